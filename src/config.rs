//! Process-wide tunables for decryption sessions.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Decryptor tunables loaded from YAML.
///
/// Every field has a default, so an empty document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptorConfig {
    /// Loaded sessions kept open at the same time before the least recently
    /// used ones are closed.
    pub max_simultaneous_sessions: usize,
    /// Persisted sessions kept in the storage backend.
    pub max_stored_persistent_sessions: usize,
    /// Retries of a failing `close` call on a CDM session.
    pub session_close_max_retry: u32,
    pub session_close_initial_delay_ms: u64,
    pub session_close_max_delay_ms: u64,
    /// Backoff between two license requests.
    pub license_retry_base_delay_ms: u64,
    pub license_retry_max_delay_ms: u64,
    /// Retries of a license request when the key system options do not say.
    pub license_default_retry: u32,
    pub license_default_timeout_ms: u64,
    /// Relative jitter applied to every backoff delay (`0.3` is +/-30%).
    pub backoff_jitter: f64,
    /// Capacity of a session listener's internal event queue.
    pub session_event_queue_capacity: usize,
}

impl Default for DecryptorConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_sessions: 15,
            max_stored_persistent_sessions: 1000,
            session_close_max_retry: 5,
            session_close_initial_delay_ms: 100,
            session_close_max_delay_ms: 1000,
            license_retry_base_delay_ms: 200,
            license_retry_max_delay_ms: 3000,
            license_default_retry: 2,
            license_default_timeout_ms: 10_000,
            backoff_jitter: 0.3,
            session_event_queue_capacity: 32,
        }
    }
}

impl DecryptorConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Delay before the `retry`-th (0-based) new attempt at closing a session:
    /// `min(2^retry * initial, max)`.
    #[must_use]
    pub fn session_close_delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay = self
            .session_close_initial_delay_ms
            .saturating_mul(factor)
            .min(self.session_close_max_delay_ms);
        Duration::from_millis(delay)
    }

    #[must_use]
    pub fn license_default_timeout(&self) -> Duration {
        Duration::from_millis(self.license_default_timeout_ms)
    }
}
