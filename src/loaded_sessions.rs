//! Registry of the CDM sessions currently open on a MediaKeys instance.
//!
//! A close requested while a license request is being generated, or while a
//! persisted session is being loaded, is deferred until that operation
//! settles. The CDM never sees a `close` racing those calls, and a session is
//! closed at most once.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cdm::{safely_close_session, MediaKeySession, MediaKeys, SessionType};
use crate::config::DecryptorConfig;
use crate::error::{Error, Result};
use crate::init_data::InitializationData;
use crate::session::KeySessionRecord;
use crate::utils::same_arc;

/// Closing progress of a loaded session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingStatus {
    None,
    /// Close requested, waiting for an in-flight operation to settle.
    Awaiting,
    Pending,
    Done,
    Failed,
}

/// Snapshot of a loaded session.
#[derive(Clone)]
pub struct LoadedSessionEntry {
    pub session: Arc<dyn MediaKeySession>,
    pub session_type: SessionType,
    pub record: Arc<KeySessionRecord>,
    pub closing_status: ClosingStatus,
}

#[derive(Default)]
struct Busy {
    is_generating_request: bool,
    is_loading_persistent_session: bool,
}

impl Busy {
    fn any(&self) -> bool {
        self.is_generating_request || self.is_loading_persistent_session
    }
}

#[derive(Clone, Copy)]
enum BusyKind {
    GeneratingRequest,
    LoadingPersistentSession,
}

#[derive(Clone)]
struct StoredEntry {
    id: u64,
    session: Arc<dyn MediaKeySession>,
    session_type: SessionType,
    record: Arc<KeySessionRecord>,
    busy: Arc<Mutex<Busy>>,
    closing: Arc<watch::Sender<ClosingStatus>>,
}

impl StoredEntry {
    fn closing_status(&self) -> ClosingStatus {
        *self.closing.borrow()
    }

    fn snapshot(&self) -> LoadedSessionEntry {
        LoadedSessionEntry {
            session: self.session.clone(),
            session_type: self.session_type,
            record: self.record.clone(),
            closing_status: self.closing_status(),
        }
    }

    /// Flag the entry as busy. Refused once a close has been requested.
    fn begin(&self, kind: BusyKind) -> Result<BusyGuard> {
        let mut busy = self.busy.lock();
        if self.closing_status() != ClosingStatus::None {
            return Err(Error::SessionClosing);
        }
        match kind {
            BusyKind::GeneratingRequest => busy.is_generating_request = true,
            BusyKind::LoadingPersistentSession => busy.is_loading_persistent_session = true,
        }
        Ok(BusyGuard {
            kind,
            busy: self.busy.clone(),
            closing: self.closing.clone(),
        })
    }
}

/// Clears a busy flag when dropped and lets an awaiting close proceed.
struct BusyGuard {
    kind: BusyKind,
    busy: Arc<Mutex<Busy>>,
    closing: Arc<watch::Sender<ClosingStatus>>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut busy = self.busy.lock();
        match self.kind {
            BusyKind::GeneratingRequest => busy.is_generating_request = false,
            BusyKind::LoadingPersistentSession => busy.is_loading_persistent_session = false,
        }
        let awaiting = *self.closing.borrow() == ClosingStatus::Awaiting;
        if !busy.any() && awaiting {
            self.closing.send_replace(ClosingStatus::Pending);
        }
    }
}

/// Sessions currently open on one MediaKeys instance, least recently used
/// first.
pub struct LoadedSessionsStore {
    media_keys: Arc<dyn MediaKeys>,
    config: DecryptorConfig,
    entries: Arc<Mutex<Vec<StoredEntry>>>,
    next_id: AtomicU64,
}

impl LoadedSessionsStore {
    /// Create an empty registry for sessions of `media_keys`.
    pub fn new(media_keys: Arc<dyn MediaKeys>, config: DecryptorConfig) -> Self {
        Self {
            media_keys,
            config,
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn media_keys(&self) -> &Arc<dyn MediaKeys> {
        &self.media_keys
    }

    /// Create a session for `init_data` and register it as the most recently
    /// used one.
    ///
    /// Must be called from within a Tokio runtime when the CDM exposes close
    /// notifications.
    pub fn create_session(
        &self,
        init_data: InitializationData,
        session_type: SessionType,
    ) -> Result<LoadedSessionEntry> {
        let session = self.media_keys.create_session(session_type)?;
        let (closing, _) = watch::channel(ClosingStatus::None);
        let entry = StoredEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            session: session.clone(),
            session_type,
            record: Arc::new(KeySessionRecord::new(init_data)),
            busy: Arc::new(Mutex::new(Busy::default())),
            closing: Arc::new(closing),
        };
        let snapshot = entry.snapshot();

        if let Some(closed) = session.closed() {
            let entries = Arc::downgrade(&self.entries);
            let id = entry.id;
            tokio::spawn(async move {
                closed.await;
                if let Some(entries) = entries.upgrade() {
                    let mut entries = entries.lock();
                    if let Some(index) = entries.iter().position(|e| e.id == id) {
                        info!("DRM-LSS: Session closed by the CDM, removing it");
                        entries.remove(index);
                    }
                }
            });
        }

        self.entries.lock().push(entry);
        debug!("DRM-LSS: Created {} session", session_type);
        Ok(snapshot)
    }

    /// Most recently used open session compatible with `init_data`, which
    /// becomes the most recently used one.
    pub fn reuse(&self, init_data: &InitializationData) -> Option<LoadedSessionEntry> {
        let mut entries = self.entries.lock();
        let index = entries.iter().rposition(|entry| {
            entry.closing_status() == ClosingStatus::None && entry.record.is_compatible_with(init_data)
        })?;
        let entry = entries.remove(index);
        let snapshot = entry.snapshot();
        entries.push(entry);
        debug!("DRM-LSS: Reusing session {:?}", snapshot.session.session_id());
        Some(snapshot)
    }

    #[must_use]
    pub fn get_entry_for_session(
        &self,
        session: &Arc<dyn MediaKeySession>,
    ) -> Option<LoadedSessionEntry> {
        self.find(session).map(|entry| entry.snapshot())
    }

    /// Generate a license request. A close requested meanwhile runs once the
    /// request settled, whatever its outcome.
    pub async fn generate_license_request(
        &self,
        session: &Arc<dyn MediaKeySession>,
        init_data_type: Option<&str>,
        init_data: &[u8],
    ) -> Result<()> {
        let guard = self
            .find(session)
            .map(|entry| entry.begin(BusyKind::GeneratingRequest))
            .transpose()?;
        if guard.is_none() {
            warn!("DRM-LSS: generate_license_request on an unknown session");
        }
        let result = session.generate_request(init_data_type, init_data).await;
        drop(guard);
        result
    }

    /// Load a persisted session. Same deferred-close rules as
    /// [`Self::generate_license_request`].
    pub async fn load_persistent_session(
        &self,
        session: &Arc<dyn MediaKeySession>,
        session_id: &str,
    ) -> Result<bool> {
        let guard = self
            .find(session)
            .map(|entry| entry.begin(BusyKind::LoadingPersistentSession))
            .transpose()?;
        if guard.is_none() {
            warn!("DRM-LSS: load_persistent_session on an unknown session");
        }
        info!("DRM-LSS: Loading persistent session {}", session_id);
        let result = session
            .load(session_id)
            .await
            .map_err(|err| Error::LoadSession {
                session_id: session_id.to_string(),
                message: err.to_string(),
            });
        drop(guard);
        result
    }

    /// Close `session`. Returns `Ok(false)` when it is not registered.
    pub async fn close_session(&self, session: &Arc<dyn MediaKeySession>) -> Result<bool> {
        let Some(entry) = self.find(session) else {
            warn!("DRM-LSS: No session found to close");
            return Ok(false);
        };
        self.close_entry(&entry).await?;
        Ok(true)
    }

    /// Close every registered session.
    pub async fn close_all_sessions(&self) -> Result<()> {
        let entries = std::mem::take(&mut *self.entries.lock());
        debug!("DRM-LSS: Closing all {} sessions", entries.len());
        let results = join_all(entries.iter().map(|entry| self.close_entry(entry))).await;
        results.into_iter().collect()
    }

    /// Forget `session` without closing it. Returns whether it was registered.
    pub fn remove_session_without_closing_it(&self, session: &Arc<dyn MediaKeySession>) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| same_arc(&e.session, session)) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Every registered session, least recently used first.
    #[must_use]
    pub fn all(&self) -> Vec<LoadedSessionEntry> {
        self.entries.lock().iter().map(StoredEntry::snapshot).collect()
    }

    fn find(&self, session: &Arc<dyn MediaKeySession>) -> Option<StoredEntry> {
        self.entries
            .lock()
            .iter()
            .find(|e| same_arc(&e.session, session))
            .cloned()
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|e| e.id != id);
    }

    async fn close_entry(&self, entry: &StoredEntry) -> Result<()> {
        let mut status = entry.closing.subscribe();
        let started = {
            let busy = entry.busy.lock();
            match entry.closing_status() {
                ClosingStatus::None if busy.any() => {
                    debug!("DRM-LSS: Session busy, deferring its close");
                    entry.closing.send_replace(ClosingStatus::Awaiting);
                    true
                }
                ClosingStatus::None => {
                    entry.closing.send_replace(ClosingStatus::Pending);
                    true
                }
                _ => false,
            }
        };

        if !started {
            // Someone else is closing it, wait for them.
            let settled = status
                .wait_for(|s| matches!(s, ClosingStatus::Done | ClosingStatus::Failed))
                .await
                .map(|s| *s);
            return match settled {
                Ok(ClosingStatus::Done) => Ok(()),
                _ => Err(Error::SessionClose("session could not be closed".into())),
            };
        }

        let released = status
            .wait_for(|s| *s != ClosingStatus::Awaiting)
            .await
            .is_ok();
        if !released {
            return Err(Error::SessionClose("session entry dropped".into()));
        }

        let result = safely_close_session(entry.session.as_ref(), &self.config).await;
        let final_status = if result.is_ok() {
            ClosingStatus::Done
        } else {
            ClosingStatus::Failed
        };
        entry.closing.send_replace(final_status);
        self.remove(entry.id);
        result
    }
}
