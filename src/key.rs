//! Key identifiers and CDM-reported key statuses.
//!
//! Key IDs are compared byte-wise. Collections of key IDs are plain vectors
//! used with set semantics through the helpers at the bottom of this module.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// A content key identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(Vec<u8>);

impl KeyId {
    /// Create a key ID from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a key ID from a hex string. Dashes are ignored so UUID-formatted
    /// `default_KID` values are accepted.
    pub fn from_hex(value: &str) -> Option<Self> {
        let cleaned: String = value.chars().filter(|c| *c != '-').collect();
        hex::decode(cleaned).ok().map(Self)
    }

    /// Raw key ID bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Interpret the key ID as a UUID when it has the usual 16-byte length.
    #[must_use]
    pub fn to_uuid(&self) -> Option<Uuid> {
        Uuid::from_slice(&self.0).ok()
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for KeyId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for KeyId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for KeyId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Uuid> for KeyId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.as_bytes().to_vec())
    }
}

/// Usability of a key as reported by the CDM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyStatus {
    Usable,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    StatusPending,
    InternalError,
    UsableInFuture,
}

impl KeyStatus {
    /// Name used by the EME key status map.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Usable => "usable",
            KeyStatus::Expired => "expired",
            KeyStatus::Released => "released",
            KeyStatus::OutputRestricted => "output-restricted",
            KeyStatus::OutputDownscaled => "output-downscaled",
            KeyStatus::StatusPending => "status-pending",
            KeyStatus::InternalError => "internal-error",
            KeyStatus::UsableInFuture => "usable-in-future",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "usable" => Ok(KeyStatus::Usable),
            "expired" => Ok(KeyStatus::Expired),
            "released" => Ok(KeyStatus::Released),
            "output-restricted" => Ok(KeyStatus::OutputRestricted),
            "output-downscaled" => Ok(KeyStatus::OutputDownscaled),
            "status-pending" => Ok(KeyStatus::StatusPending),
            "internal-error" => Ok(KeyStatus::InternalError),
            "usable-in-future" => Ok(KeyStatus::UsableInFuture),
            other => Err(format!("Unknown key status: {}", other)),
        }
    }
}

/// Whether `key_id` is present in `key_ids`.
#[must_use]
pub fn is_key_id_contained_in(key_id: &KeyId, key_ids: &[KeyId]) -> bool {
    key_ids.iter().any(|k| k == key_id)
}

/// Whether every element of `wanted` is present in `key_ids`.
#[must_use]
pub fn are_all_key_ids_contained_in(wanted: &[KeyId], key_ids: &[KeyId]) -> bool {
    wanted.iter().all(|k| is_key_id_contained_in(k, key_ids))
}

/// Whether at least one element of `wanted` is present in `key_ids`.
#[must_use]
pub fn are_some_key_ids_contained_in(wanted: &[KeyId], key_ids: &[KeyId]) -> bool {
    wanted.iter().any(|k| is_key_id_contained_in(k, key_ids))
}

/// Append the elements of `additions` that `target` does not contain yet.
pub fn merge_key_ids_into(target: &mut Vec<KeyId>, additions: &[KeyId]) {
    for key_id in additions {
        if !is_key_id_contained_in(key_id, target) {
            target.push(key_id.clone());
        }
    }
}
