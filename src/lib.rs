//! rseme - decryption session orchestration for encrypted media playback.
//!
//! This crate provides:
//! - Key system selection and MediaKeys lifecycle on a media element.
//! - CDM session creation, reuse, eviction and deferred closing.
//! - Persistent-license session storage with versioned records.
//! - License acquisition with timeout, exponential backoff and blacklisting.
//! - Propagation of key statuses into the manifest's decipherability.
//!
//! The CDM, the media element, the manifest and the license server are
//! supplied by the embedding player through the traits of [`cdm`],
//! [`manifest`], [`license`] and [`storage`].
//!
//! Feature flags:
//! - `tracing`: emit logs through `tracing` (default).
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// CDM collaborator traits and session closing.
pub mod cdm;
/// Process-wide tunables.
pub mod config;
/// Top-level decryption state machine.
pub mod content_decryptor;
/// Session creation, reuse and loading.
pub mod create_session;
/// Common error types and Result alias.
pub mod error;
/// Initialization data and its compatibility rules.
pub mod init_data;
/// Key IDs and key statuses.
pub mod key;
/// Key system options and selection.
pub mod key_system;
/// License callbacks and retry logic.
pub mod license;
/// Registry of open CDM sessions.
pub mod loaded_sessions;
/// Decipherability updates of the manifest model.
pub mod manifest;
/// MediaKeys attached to a media element.
pub mod media_keys;
/// Persisted session records.
pub mod persistent_sessions;
/// CDM session identity record.
pub mod session;
/// Per-session event loop.
pub mod session_events;
/// Persistent storage backends.
pub mod storage;
/// Shared helper utilities.
pub mod utils;

#[cfg(test)]
mod testing;

pub use content_decryptor::{ContentDecryptor, ContentDecryptorState, DecryptorEvent};
pub use error::{Error, Result};
pub use key_system::KeySystemOption;
