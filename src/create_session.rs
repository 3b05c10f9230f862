//! Obtain a CDM session for initialization data.
//!
//! In order: reuse a loaded compatible session, make room among loaded
//! sessions, create a new session. Persistent-license sessions first try to
//! load a previously persisted session.
use tokio_util::sync::CancellationToken;

use crate::cdm::{is_session_usable, SessionType};
use crate::error::{Error, Result};
use crate::init_data::InitializationData;
use crate::loaded_sessions::{LoadedSessionEntry, LoadedSessionsStore};
use crate::persistent_sessions::PersistentSessionsStore;

/// Where a session obtained for initialization data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLoadingKind {
    /// New session, a license request has to be generated.
    Created,
    /// Persisted session loaded from the CDM.
    LoadedPersistentSession,
    /// Session already open for compatible initialization data.
    AlreadyOpen,
}

/// Session obtained by [`create_or_load_session`].
#[derive(Clone)]
pub struct SessionCreation {
    pub kind: SessionLoadingKind,
    pub entry: LoadedSessionEntry,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Get a session for `init_data`.
///
/// `max_session_cache_size` bounds the loaded sessions: the least recently
/// used ones are closed to make room for a new one.
pub async fn create_or_load_session(
    init_data: &InitializationData,
    loaded_sessions: &LoadedSessionsStore,
    persistent_sessions: Option<&PersistentSessionsStore>,
    wanted_session_type: SessionType,
    max_session_cache_size: usize,
    cancel: &CancellationToken,
) -> Result<SessionCreation> {
    if let Some(entry) = loaded_sessions.reuse(init_data) {
        if is_session_usable(entry.session.as_ref()) {
            info!("DRM: Reuse loaded session {}", entry.session.session_id());
            return Ok(SessionCreation {
                kind: SessionLoadingKind::AlreadyOpen,
                entry,
            });
        }
        if let Some(persistent) = persistent_sessions {
            if !entry.session.session_id().is_empty() {
                persistent.delete(init_data);
            }
        }
        debug!("DRM: Closing unusable loaded session");
        loaded_sessions.close_session(&entry.session).await?;
        check_cancelled(cancel)?;
    }

    clean_old_loaded_sessions(loaded_sessions, max_session_cache_size.saturating_sub(1)).await?;
    check_cancelled(cancel)?;

    match (wanted_session_type, persistent_sessions) {
        (SessionType::Temporary, _) => create_temporary_session(loaded_sessions, init_data),
        (SessionType::PersistentLicense, None) => {
            warn!("DRM: Cannot create persistent session without a persistent sessions store");
            create_temporary_session(loaded_sessions, init_data)
        }
        (SessionType::PersistentLicense, Some(persistent)) => {
            create_and_try_to_retrieve_persistent_session(
                init_data,
                loaded_sessions,
                persistent,
                cancel,
            )
            .await
        }
    }
}

/// Close the least recently used sessions until at most `limit` remain.
pub async fn clean_old_loaded_sessions(loaded_sessions: &LoadedSessionsStore, limit: usize) -> Result<()> {
    let entries = loaded_sessions.all();
    if limit >= entries.len() {
        return Ok(());
    }
    let to_close = entries.len() - limit;
    info!("DRM: Closing {} old loaded sessions", to_close);
    let closing = entries
        .iter()
        .take(to_close)
        .map(|entry| loaded_sessions.close_session(&entry.session));
    for result in futures::future::join_all(closing).await {
        result?;
    }
    Ok(())
}

fn create_temporary_session(
    loaded_sessions: &LoadedSessionsStore,
    init_data: &InitializationData,
) -> Result<SessionCreation> {
    info!("DRM: Creating temporary session");
    let entry = loaded_sessions.create_session(init_data.clone(), SessionType::Temporary)?;
    Ok(SessionCreation {
        kind: SessionLoadingKind::Created,
        entry,
    })
}

async fn create_and_try_to_retrieve_persistent_session(
    init_data: &InitializationData,
    loaded_sessions: &LoadedSessionsStore,
    persistent_sessions: &PersistentSessionsStore,
    cancel: &CancellationToken,
) -> Result<SessionCreation> {
    check_cancelled(cancel)?;
    info!("DRM: Creating persistent session");
    let entry = loaded_sessions.create_session(init_data.clone(), SessionType::PersistentLicense)?;
    let Some(stored) = persistent_sessions.get_and_reuse(init_data) else {
        return Ok(SessionCreation {
            kind: SessionLoadingKind::Created,
            entry,
        });
    };

    match loaded_sessions
        .load_persistent_session(&entry.session, stored.session_id())
        .await
    {
        Ok(false) => {
            warn!("DRM: No data stored for the loaded session");
            persistent_sessions.delete(init_data);
            Ok(SessionCreation {
                kind: SessionLoadingKind::Created,
                entry,
            })
        }
        Ok(true) if is_session_usable(entry.session.as_ref()) => {
            persistent_sessions.add(
                init_data,
                init_data.key_ids.as_deref(),
                &entry.session.session_id(),
            );
            info!("DRM: Succeeded to load persistent session");
            Ok(SessionCreation {
                kind: SessionLoadingKind::LoadedPersistentSession,
                entry,
            })
        }
        Ok(true) => {
            warn!("DRM: Previous persistent session not usable anymore");
            recreate_persistent_session(init_data, loaded_sessions, persistent_sessions, entry, cancel).await
        }
        Err(err) => {
            warn!("DRM: Unable to load persistent session: {}", err);
            recreate_persistent_session(init_data, loaded_sessions, persistent_sessions, entry, cancel).await
        }
    }
}

async fn recreate_persistent_session(
    init_data: &InitializationData,
    loaded_sessions: &LoadedSessionsStore,
    persistent_sessions: &PersistentSessionsStore,
    previous: LoadedSessionEntry,
    cancel: &CancellationToken,
) -> Result<SessionCreation> {
    check_cancelled(cancel)?;
    info!("DRM: Removing previous persistent session");
    persistent_sessions.delete(init_data);
    if let Err(err) = loaded_sessions.close_session(&previous.session).await {
        if !previous.session.session_id().is_empty() {
            return Err(err);
        }
        loaded_sessions.remove_session_without_closing_it(&previous.session);
    }
    check_cancelled(cancel)?;
    let entry = loaded_sessions.create_session(init_data.clone(), SessionType::PersistentLicense)?;
    Ok(SessionCreation {
        kind: SessionLoadingKind::Created,
        entry,
    })
}
