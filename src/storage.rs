//! Backends for persisted session records.
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;
use crate::utils::ensure_parent_dir;

/// Durable storage of persisted session records.
///
/// Records are exchanged as a JSON array so that a backend never needs to
/// understand them. `load` may return anything: the store validates it.
pub trait PersistentSessionsStorage: Send + Sync {
    fn load(&self) -> Result<Value>;
    fn save(&self, records: &Value) -> Result<()>;
}

/// In-process storage, mostly useful to share records between decryptors of
/// the same process.
#[derive(Debug)]
pub struct MemoryStorage {
    records: Mutex<Value>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_records(Value::Array(Vec::new()))
    }

    /// Start from arbitrary (possibly invalid) content.
    pub fn with_records(records: Value) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    #[must_use]
    pub fn records(&self) -> Value {
        self.records.lock().clone()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentSessionsStorage for MemoryStorage {
    fn load(&self) -> Result<Value> {
        Ok(self.records.lock().clone())
    }

    fn save(&self, records: &Value) -> Result<()> {
        *self.records.lock() = records.clone();
        Ok(())
    }
}

/// Records kept in a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistentSessionsStorage for JsonFileStorage {
    fn load(&self) -> Result<Value> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Value::Array(Vec::new())),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, records: &Value) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        std::fs::write(&self.path, serde_json::to_vec(records)?)?;
        Ok(())
    }
}
