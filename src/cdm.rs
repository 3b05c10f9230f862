//! Content Decryption Module collaborators.
//!
//! The CDM itself lives outside of this crate. These traits describe the
//! narrow surface the session orchestration needs: a key-system access
//! factory, MediaKeys, sessions and the media element they get attached to.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::DecryptorConfig;
use crate::error::{Error, Result};
use crate::key::{KeyId, KeyStatus};
use crate::key_system::KeySystemConfiguration;

/// Kind of CDM session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    Temporary,
    PersistentLicense,
}

impl SessionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Temporary => "temporary",
            SessionType::PersistentLicense => "persistent-license",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted by a CDM session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySessionEvent {
    /// The CDM wants a message to be sent to the license server.
    Message {
        message: Vec<u8>,
        message_type: Option<String>,
    },
    /// `key_statuses()` changed.
    KeyStatusesChange,
    /// The CDM reported an error on the session.
    KeyError(String),
}

/// A CDM session.
#[async_trait]
pub trait MediaKeySession: Send + Sync {
    /// Session identifier, empty until the CDM assigned one.
    fn session_id(&self) -> String;

    /// Current key statuses.
    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)>;

    /// Subscribe to the session's events. Events emitted before the call are
    /// not replayed.
    ///
    /// The channel capacity must absorb bursts of `Message` events: a lagging
    /// listener only re-checks key statuses, so a dropped message never gets
    /// its license fetched.
    fn subscribe(&self) -> broadcast::Receiver<KeySessionEvent>;

    /// Resolves once the CDM closed the session on its own, when the CDM
    /// exposes that notification.
    fn closed(&self) -> Option<BoxFuture<'static, ()>> {
        None
    }

    /// Ask the CDM for a license request, emitted later as a `Message` event.
    async fn generate_request(&self, init_data_type: Option<&str>, init_data: &[u8]) -> Result<()>;

    /// Load a persisted session. `Ok(false)` means no such session exists.
    async fn load(&self, session_id: &str) -> Result<bool>;

    /// Give a license server response to the CDM.
    async fn update(&self, response: &[u8]) -> Result<()>;

    /// Close the session and release its keys.
    async fn close(&self) -> Result<()>;
}

/// CDM instance able to create sessions.
#[async_trait]
pub trait MediaKeys: Send + Sync {
    fn create_session(&self, session_type: SessionType) -> Result<Arc<dyn MediaKeySession>>;

    /// Returns `Ok(false)` when the CDM does not use server certificates.
    async fn set_server_certificate(&self, certificate: &[u8]) -> Result<bool>;
}

/// Access to a key system with an accepted configuration.
#[async_trait]
pub trait MediaKeySystemAccess: Send + Sync {
    /// Name of the key system, e.g. `com.widevine.alpha`.
    fn key_system(&self) -> &str;

    /// Configuration the CDM accepted.
    fn configuration(&self) -> &KeySystemConfiguration;

    async fn create_media_keys(&self) -> Result<Arc<dyn MediaKeys>>;
}

/// Entry point of the platform's CDM support.
#[async_trait]
pub trait CdmProvider: Send + Sync {
    /// Ask for a key system supporting one of `configurations`.
    async fn request_media_key_system_access(
        &self,
        key_system: &str,
        configurations: &[KeySystemConfiguration],
    ) -> Result<Arc<dyn MediaKeySystemAccess>>;
}

/// Media element MediaKeys get attached to.
#[async_trait]
pub trait MediaElement: Send + Sync {
    async fn set_media_keys(&self, media_keys: Option<Arc<dyn MediaKeys>>) -> Result<()>;
}

/// Whether a loaded session can still be used to decrypt content.
///
/// Sessions without an id, without any key status, or with an expired or
/// internal-error key are not usable.
#[must_use]
pub fn is_session_usable(session: &dyn MediaKeySession) -> bool {
    if session.session_id().is_empty() {
        return false;
    }
    let statuses = session.key_statuses();
    if statuses.is_empty() {
        return false;
    }
    !statuses
        .iter()
        .any(|(_, status)| matches!(status, KeyStatus::Expired | KeyStatus::InternalError))
}

/// Close a CDM session, retrying on failure with an exponential delay.
pub async fn safely_close_session(
    session: &dyn MediaKeySession,
    config: &DecryptorConfig,
) -> Result<()> {
    let mut retry = 0u32;
    loop {
        match session.close().await {
            Ok(()) => return Ok(()),
            Err(err) if retry >= config.session_close_max_retry => {
                return Err(Error::SessionClose(err.to_string()));
            }
            Err(err) => {
                let delay = config.session_close_delay(retry);
                retry += 1;
                warn!(
                    "DRM: Could not close session {:?} ({}), retry {} in {:?}",
                    session.session_id(),
                    err,
                    retry,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
