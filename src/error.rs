//! Error types for rseme.

use thiserror::Error;

use crate::key::{KeyId, KeyStatus};

/// Main error type for decryption-session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// None of the configured key systems is supported by the CDM provider.
    #[error("No key system compatible with your wanted configuration has been found ({0})")]
    IncompatibleKeySystems(String),

    /// The MediaKeys object could not be created from the key system access.
    #[error("Could not create MediaKeys: {0}")]
    CreateMediaKeys(String),

    /// MediaKeys could not be attached to the media element.
    #[error("Could not attach MediaKeys to the media element: {0}")]
    MediaKeysAttachment(String),

    /// The server certificate was refused by the CDM.
    #[error("Could not set the server certificate: {0}")]
    ServerCertificate(String),

    /// The CDM refused to generate a license request.
    #[error("Could not generate a license request: {0}")]
    KeyGenerateRequest(String),

    /// The license callback failed.
    #[error("License request failed: {0}")]
    KeyLoad(String),

    /// The license callback did not answer in time.
    #[error("License request timed out after {timeout_ms}ms")]
    KeyLoadTimeout { timeout_ms: u64 },

    /// `session.update` rejected the license or key-status response.
    #[error("Could not update the session: {0}")]
    KeyUpdate(String),

    /// One or several key statuses were refused by the configured policies.
    #[error("{message}")]
    KeyStatusChange {
        message: String,
        key_statuses: Vec<(KeyId, KeyStatus)>,
    },

    /// The CDM reported an error on a session.
    #[error("Key error reported by the CDM: {0}")]
    KeyError(String),

    /// A persisted session could not be loaded.
    #[error("Could not load persistent session {session_id}: {message}")]
    LoadSession { session_id: String, message: String },

    /// A session could not be closed.
    #[error("Could not close session: {0}")]
    SessionClose(String),

    /// The session is being closed and cannot be used anymore.
    #[error("The session is being closed")]
    SessionClosing,

    /// The operation is not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A generic failure reported by a CDM collaborator.
    #[error("CDM error: {0}")]
    Cdm(String),

    /// The persistent storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The pending work was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid YAML configuration.
    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable code identifying the kind of failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Error::IncompatibleKeySystems(_) => "INCOMPATIBLE_KEYSYSTEMS",
            Error::CreateMediaKeys(_) => "CREATE_MEDIA_KEYS_ERROR",
            Error::MediaKeysAttachment(_) => "MEDIA_KEYS_ATTACHMENT_ERROR",
            Error::ServerCertificate(_) => "LICENSE_SERVER_CERTIFICATE_ERROR",
            Error::KeyGenerateRequest(_) => "KEY_GENERATE_REQUEST_ERROR",
            Error::KeyLoad(_) => "KEY_LOAD_ERROR",
            Error::KeyLoadTimeout { .. } => "KEY_LOAD_TIMEOUT",
            Error::KeyUpdate(_) => "KEY_UPDATE_ERROR",
            Error::KeyStatusChange { .. } => "KEY_STATUS_CHANGE_ERROR",
            Error::KeyError(_) => "KEY_ERROR",
            Error::LoadSession { .. } => "LOAD_SESSION_ERROR",
            Error::SessionClose(_) | Error::SessionClosing => "SESSION_CLOSE_ERROR",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::Cdm(_) => "CDM_ERROR",
            Error::Storage(_) | Error::Json(_) | Error::Io(_) => "STORAGE_ERROR",
            Error::Cancelled => "CANCELLED",
            Error::Config(_) => "CONFIG_ERROR",
        }
    }
}

/// Result type alias for rseme operations.
pub type Result<T> = std::result::Result<T, Error>;
