//! Initialization data as encountered in the media pipeline.
//!
//! Values are kept sorted by system id (unknown system ids last) so that two
//! logically equal payloads compare equal whatever order they were found in.
//! Each value carries a cheap non-cryptographic hash used to short-circuit
//! comparisons; equality always falls back to comparing bytes.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::key::KeyId;
use crate::manifest::Manifest;

/// Fingerprint of a byte buffer.
///
/// This is the classic `h * 31 + byte` string hash on wrapping 32-bit
/// integers. It is only meant to quickly discard non-equal buffers.
#[must_use]
pub fn hash_buffer(buffer: &[u8]) -> i32 {
    buffer
        .iter()
        .fold(0i32, |hash, byte| hash.wrapping_mul(31).wrapping_add(i32::from(*byte)))
}

/// One initialization payload, for a given DRM system when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitDataValue {
    /// Hex system id (e.g. Widevine's `edef8ba9...`), if known.
    pub system_id: Option<String>,
    /// Raw payload, usually a full PSSH box.
    pub data: Vec<u8>,
    hash: i32,
}

impl InitDataValue {
    /// Create a value, computing the hash of `data`.
    pub fn new(system_id: Option<String>, data: Vec<u8>) -> Self {
        let hash = hash_buffer(&data);
        Self {
            system_id,
            data,
            hash,
        }
    }

    /// Rebuild a value with an already computed hash (from storage).
    pub(crate) fn with_hash(system_id: Option<String>, data: Vec<u8>, hash: i32) -> Self {
        Self {
            system_id,
            data,
            hash,
        }
    }

    #[must_use]
    pub fn hash(&self) -> i32 {
        self.hash
    }

    fn matches(&self, other: &InitDataValue) -> bool {
        self.hash == other.hash && self.data == other.data
    }
}

fn compare_system_ids(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Sorted set of initialization values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitDataValues {
    values: Vec<InitDataValue>,
}

impl InitDataValues {
    pub fn new(mut values: Vec<InitDataValue>) -> Self {
        values.sort_by(|a, b| compare_system_ids(&a.system_id, &b.system_id));
        Self { values }
    }

    /// Values in their canonical order.
    #[must_use]
    pub fn formatted(&self) -> &[InitDataValue] {
        &self.values
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Concatenation of every payload, which is what is given to the CDM
    /// when generating a license request.
    #[must_use]
    pub fn construct_request_data(&self) -> Vec<u8> {
        self.values
            .iter()
            .flat_map(|v| v.data.iter().copied())
            .collect()
    }

    #[must_use]
    pub fn is_compatible_with(&self, other: &[InitDataValue]) -> bool {
        are_init_values_compatible(&self.values, other)
    }
}

/// Whether two sorted value lists describe the same content, one being a
/// contiguous run of the other when matched by system id, hash and bytes.
#[must_use]
pub fn are_init_values_compatible(stored: &[InitDataValue], new: &[InitDataValue]) -> bool {
    is_a_in_b(stored, new)
        .or_else(|| is_a_in_b(new, stored))
        .unwrap_or(false)
}

/// `Some(true)` if `a` is found in `b`, `Some(false)` if a conflicting value
/// was found, `None` if `a` simply does not fit in `b`.
fn is_a_in_b(a: &[InitDataValue], b: &[InitDataValue]) -> Option<bool> {
    let first = a.first()?;
    if b.len() < a.len() {
        return None;
    }
    let start = b.iter().position(|v| v.system_id == first.system_id)?;
    if !b[start].matches(first) {
        return Some(false);
    }
    if b.len() - start < a.len() {
        return None;
    }
    for (a_elt, b_elt) in a.iter().zip(&b[start..]).skip(1) {
        if a_elt.system_id != b_elt.system_id || !a_elt.matches(b_elt) {
            return Some(false);
        }
    }
    Some(true)
}

/// Manifest position of the content that produced initialization data.
#[derive(Clone)]
pub struct ContentRef {
    pub manifest: Arc<dyn Manifest>,
    pub period_id: String,
}

impl fmt::Debug for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentRef")
            .field("period_id", &self.period_id)
            .finish_non_exhaustive()
    }
}

/// Initialization data event coming from the media pipeline.
#[derive(Debug, Clone)]
pub struct InitializationData {
    /// Initialization data type, e.g. `cenc`.
    pub init_data_type: Option<String>,
    pub values: InitDataValues,
    /// Key ids this data is known to need, when the manifest announces them.
    pub key_ids: Option<Vec<KeyId>>,
    pub content: Option<ContentRef>,
}

impl InitializationData {
    pub fn new(init_data_type: Option<String>, values: Vec<InitDataValue>) -> Self {
        Self {
            init_data_type,
            values: InitDataValues::new(values),
            key_ids: None,
            content: None,
        }
    }

    #[must_use]
    pub fn with_key_ids(mut self, key_ids: Vec<KeyId>) -> Self {
        self.key_ids = Some(key_ids);
        self
    }

    #[must_use]
    pub fn with_content(mut self, manifest: Arc<dyn Manifest>, period_id: impl Into<String>) -> Self {
        self.content = Some(ContentRef {
            manifest,
            period_id: period_id.into(),
        });
        self
    }

    /// Known key ids, if any (an empty list counts as unknown).
    #[must_use]
    pub fn known_key_ids(&self) -> Option<&[KeyId]> {
        self.key_ids.as_deref().filter(|ids| !ids.is_empty())
    }
}
