//! Persisted session identifiers.
//!
//! Records map an initialization data fingerprint to the id of a
//! persistent-license session, least recently used first. Four record
//! versions exist:
//!
//! - v4: key IDs and formatted initialization values,
//! - v3: formatted initialization values,
//! - v2: concatenated initialization data (base64) and its hash,
//! - v1: concatenated initialization data as a byte array and its hash. Very
//!   old v1 records only carry the hash.
//!
//! All of them are matched against, new records are always written as v3 or
//! v4.
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::init_data::{are_init_values_compatible, hash_buffer, InitDataValue, InitializationData};
use crate::key::KeyId;
use crate::storage::PersistentSessionsStorage;

/// One persisted session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStoredEntry", into = "RawStoredEntry")]
pub enum StoredSessionEntry {
    V4 {
        session_id: String,
        init_data_type: Option<String>,
        key_ids: Vec<KeyId>,
        values: Vec<InitDataValue>,
    },
    V3 {
        session_id: String,
        init_data_type: Option<String>,
        values: Vec<InitDataValue>,
    },
    V2 {
        session_id: String,
        init_data_type: Option<String>,
        init_data: Vec<u8>,
        init_data_hash: i32,
    },
    V1 {
        session_id: String,
        init_data_type: Option<String>,
        /// `None` for records only carrying the hash.
        init_data: Option<Vec<u8>>,
        init_data_hash: i32,
    },
}

impl StoredSessionEntry {
    #[must_use]
    pub fn version(&self) -> u32 {
        match self {
            StoredSessionEntry::V4 { .. } => 4,
            StoredSessionEntry::V3 { .. } => 3,
            StoredSessionEntry::V2 { .. } => 2,
            StoredSessionEntry::V1 { .. } => 1,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            StoredSessionEntry::V4 { session_id, .. }
            | StoredSessionEntry::V3 { session_id, .. }
            | StoredSessionEntry::V2 { session_id, .. }
            | StoredSessionEntry::V1 { session_id, .. } => session_id,
        }
    }

    #[must_use]
    pub fn init_data_type(&self) -> Option<&str> {
        match self {
            StoredSessionEntry::V4 { init_data_type, .. }
            | StoredSessionEntry::V3 { init_data_type, .. }
            | StoredSessionEntry::V2 { init_data_type, .. }
            | StoredSessionEntry::V1 { init_data_type, .. } => init_data_type.as_deref(),
        }
    }

    fn matches(&self, init_data: &InitializationData, concatenated: &mut ConcatenatedInitData) -> bool {
        if self.init_data_type() != init_data.init_data_type.as_deref() {
            return false;
        }
        match self {
            StoredSessionEntry::V4 { key_ids, values, .. } => match init_data.known_key_ids() {
                Some(wanted) => wanted.iter().all(|kid| key_ids.contains(kid)),
                None => are_init_values_compatible(init_data.values.formatted(), values),
            },
            StoredSessionEntry::V3 { values, .. } => {
                are_init_values_compatible(init_data.values.formatted(), values)
            }
            StoredSessionEntry::V2 {
                init_data: stored,
                init_data_hash,
                ..
            } => {
                let (data, hash) = concatenated.get(init_data);
                *init_data_hash == hash && stored.as_slice() == data
            }
            StoredSessionEntry::V1 {
                init_data: stored,
                init_data_hash,
                ..
            } => {
                let (data, hash) = concatenated.get(init_data);
                *init_data_hash == hash && stored.as_deref().map_or(true, |stored| stored == data)
            }
        }
    }
}

/// Concatenated initialization data, computed on first use.
#[derive(Default)]
struct ConcatenatedInitData(Option<(Vec<u8>, i32)>);

impl ConcatenatedInitData {
    fn get(&mut self, init_data: &InitializationData) -> (&[u8], i32) {
        let (data, hash) = self.0.get_or_insert_with(|| {
            let data = init_data.values.construct_request_data();
            let hash = hash_buffer(&data);
            (data, hash)
        });
        (data.as_slice(), *hash)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStoredValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system_id: Option<String>,
    hash: i32,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStoredEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<u32>,
    session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    init_data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    values: Option<Vec<RawStoredValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    init_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    init_data_hash: Option<i32>,
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>, String> {
    BASE64
        .decode(value)
        .map_err(|e| format!("invalid base64 in {}: {}", field, e))
}

fn decode_values(values: Option<Vec<RawStoredValue>>) -> Result<Vec<InitDataValue>, String> {
    values
        .ok_or_else(|| "missing values".to_string())?
        .into_iter()
        .map(|v| {
            let data = decode_base64("values", &v.data)?;
            Ok(InitDataValue::with_hash(v.system_id, data, v.hash))
        })
        .collect()
}

fn encode_values(values: Vec<InitDataValue>) -> Vec<RawStoredValue> {
    values
        .into_iter()
        .map(|v| RawStoredValue {
            hash: v.hash(),
            data: BASE64.encode(&v.data),
            system_id: v.system_id,
        })
        .collect()
}

fn byte_array(value: &Value) -> Option<Vec<u8>> {
    value
        .as_array()?
        .iter()
        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect()
}

impl TryFrom<RawStoredEntry> for StoredSessionEntry {
    type Error = String;

    fn try_from(raw: RawStoredEntry) -> Result<Self, Self::Error> {
        let RawStoredEntry {
            version,
            session_id,
            init_data_type,
            key_ids,
            values,
            init_data,
            init_data_hash,
        } = raw;
        match version {
            Some(4) => {
                let key_ids = key_ids
                    .ok_or_else(|| "missing keyIds".to_string())?
                    .iter()
                    .map(|kid| decode_base64("keyIds", kid).map(KeyId::new))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(StoredSessionEntry::V4 {
                    session_id,
                    init_data_type,
                    key_ids,
                    values: decode_values(values)?,
                })
            }
            Some(3) => Ok(StoredSessionEntry::V3 {
                session_id,
                init_data_type,
                values: decode_values(values)?,
            }),
            Some(2) => {
                let encoded = init_data
                    .as_ref()
                    .and_then(Value::as_str)
                    .ok_or_else(|| "missing initData".to_string())?;
                Ok(StoredSessionEntry::V2 {
                    session_id,
                    init_data_type,
                    init_data: decode_base64("initData", encoded)?,
                    init_data_hash: init_data_hash.ok_or_else(|| "missing initDataHash".to_string())?,
                })
            }
            Some(1) | None => match (init_data, init_data_hash) {
                // Oldest records stored the hash itself as `initData`.
                (Some(Value::Number(n)), None) => {
                    let hash = n
                        .as_i64()
                        .and_then(|h| i32::try_from(h).ok())
                        .ok_or_else(|| "invalid initData hash".to_string())?;
                    Ok(StoredSessionEntry::V1 {
                        session_id,
                        init_data_type,
                        init_data: None,
                        init_data_hash: hash,
                    })
                }
                (init_data, Some(hash)) => Ok(StoredSessionEntry::V1 {
                    session_id,
                    init_data_type,
                    init_data: init_data.as_ref().and_then(byte_array),
                    init_data_hash: hash,
                }),
                _ => Err("missing initDataHash".to_string()),
            },
            Some(other) => Err(format!("unknown record version {}", other)),
        }
    }
}

impl From<StoredSessionEntry> for RawStoredEntry {
    fn from(entry: StoredSessionEntry) -> Self {
        let mut raw = RawStoredEntry {
            version: Some(entry.version()),
            session_id: String::new(),
            init_data_type: None,
            key_ids: None,
            values: None,
            init_data: None,
            init_data_hash: None,
        };
        match entry {
            StoredSessionEntry::V4 {
                session_id,
                init_data_type,
                key_ids,
                values,
            } => {
                raw.session_id = session_id;
                raw.init_data_type = init_data_type;
                raw.key_ids = Some(key_ids.iter().map(|k| BASE64.encode(k)).collect());
                raw.values = Some(encode_values(values));
            }
            StoredSessionEntry::V3 {
                session_id,
                init_data_type,
                values,
            } => {
                raw.session_id = session_id;
                raw.init_data_type = init_data_type;
                raw.values = Some(encode_values(values));
            }
            StoredSessionEntry::V2 {
                session_id,
                init_data_type,
                init_data,
                init_data_hash,
            } => {
                raw.session_id = session_id;
                raw.init_data_type = init_data_type;
                raw.init_data = Some(Value::String(BASE64.encode(init_data)));
                raw.init_data_hash = Some(init_data_hash);
            }
            StoredSessionEntry::V1 {
                session_id,
                init_data_type,
                init_data,
                init_data_hash,
            } => {
                raw.session_id = session_id;
                raw.init_data_type = init_data_type;
                raw.init_data = init_data.map(Value::from);
                raw.init_data_hash = Some(init_data_hash);
            }
        }
        raw
    }
}

/// Persisted session records on top of a storage backend.
pub struct PersistentSessionsStore {
    storage: Arc<dyn PersistentSessionsStorage>,
    entries: Mutex<Vec<StoredSessionEntry>>,
}

impl PersistentSessionsStore {
    /// Load records from `storage`.
    ///
    /// An unreadable backend, or one not holding a list, is reset to an
    /// empty list. Invalid records are skipped.
    pub fn new(storage: Arc<dyn PersistentSessionsStorage>) -> Self {
        let store = Self {
            storage,
            entries: Mutex::new(Vec::new()),
        };
        match store.storage.load() {
            Ok(Value::Array(records)) => {
                let mut entries = Vec::with_capacity(records.len());
                for record in records {
                    match serde_json::from_value::<StoredSessionEntry>(record) {
                        Ok(entry) => entries.push(entry),
                        Err(err) => warn!("DRM-PSS: Skipping invalid stored session: {}", err),
                    }
                }
                *store.entries.lock() = entries;
            }
            Ok(_) => {
                warn!("DRM-PSS: Stored sessions are not a list, resetting them");
                store.dispose();
            }
            Err(err) => {
                warn!("DRM-PSS: Could not load stored sessions: {}", err);
                store.dispose();
            }
        }
        store
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Every record, least recently used first.
    #[must_use]
    pub fn all(&self) -> Vec<StoredSessionEntry> {
        self.entries.lock().clone()
    }

    /// Record matching `init_data`.
    #[must_use]
    pub fn get(&self, init_data: &InitializationData) -> Option<StoredSessionEntry> {
        let entries = self.entries.lock();
        find_index(&entries, init_data).map(|index| entries[index].clone())
    }

    /// Record matching `init_data`, marked as the most recently used.
    pub fn get_and_reuse(&self, init_data: &InitializationData) -> Option<StoredSessionEntry> {
        let mut entries = self.entries.lock();
        let index = find_index(&entries, init_data)?;
        let entry = entries.remove(index);
        entries.push(entry.clone());
        self.save(&entries);
        Some(entry)
    }

    /// Persist `session_id` for `init_data`.
    ///
    /// Re-adding the same session with an equal or newer record version does
    /// nothing. Otherwise the old record is replaced and the new one becomes
    /// the most recently used.
    pub fn add(&self, init_data: &InitializationData, key_ids: Option<&[KeyId]>, session_id: &str) {
        if session_id.is_empty() {
            warn!("DRM-PSS: Invalid persisted session given");
            return;
        }
        let mut entries = self.entries.lock();
        let version = if key_ids.is_some() { 4 } else { 3 };
        if let Some(index) = find_index(&entries, init_data) {
            let current = &entries[index];
            if current.version() >= version && current.session_id() == session_id {
                return;
            }
            info!("DRM-PSS: Updating session info {}", session_id);
            entries.remove(index);
        } else {
            info!("DRM-PSS: Add new session {}", session_id);
        }

        let values = init_data.values.formatted().to_vec();
        let entry = match key_ids {
            Some(key_ids) => StoredSessionEntry::V4 {
                session_id: session_id.to_string(),
                init_data_type: init_data.init_data_type.clone(),
                key_ids: key_ids.to_vec(),
                values,
            },
            None => StoredSessionEntry::V3 {
                session_id: session_id.to_string(),
                init_data_type: init_data.init_data_type.clone(),
                values,
            },
        };
        entries.push(entry);
        self.save(&entries);
    }

    /// Remove the record matching `init_data`.
    pub fn delete(&self, init_data: &InitializationData) {
        let mut entries = self.entries.lock();
        let Some(index) = find_index(&entries, init_data) else {
            warn!("DRM-PSS: initData to delete not found");
            return;
        };
        let entry = entries.remove(index);
        info!("DRM-PSS: Delete session from store {}", entry.session_id());
        self.save(&entries);
    }

    /// Remove the `count` least recently used records.
    pub fn delete_old_sessions(&self, count: usize) {
        info!("DRM-PSS: Deleting last {} sessions", count);
        let mut entries = self.entries.lock();
        let count = count.min(entries.len());
        entries.drain(..count);
        self.save(&entries);
    }

    /// Remove every record.
    pub fn dispose(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.save(&entries);
    }

    fn save(&self, entries: &[StoredSessionEntry]) {
        let result = serde_json::to_value(entries)
            .map_err(Into::into)
            .and_then(|records| self.storage.save(&records));
        if let Err(err) = result {
            warn!("DRM-PSS: Could not save sessions: {}", err);
        }
    }
}

fn find_index(entries: &[StoredSessionEntry], init_data: &InitializationData) -> Option<usize> {
    let mut concatenated = ConcatenatedInitData::default();
    entries
        .iter()
        .position(|entry| entry.matches(init_data, &mut concatenated))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::{Error, Result};
    use crate::storage::MemoryStorage;

    fn init_data(data: &[u8]) -> InitializationData {
        InitializationData::new(
            Some("cenc".into()),
            vec![InitDataValue::new(Some("edef8ba9".into()), data.to_vec())],
        )
    }

    fn kid(byte: u8) -> KeyId {
        KeyId::new(vec![byte; 16])
    }

    fn store() -> (Arc<MemoryStorage>, PersistentSessionsStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = PersistentSessionsStore::new(storage.clone());
        (storage, store)
    }

    struct FailingStorage;

    impl PersistentSessionsStorage for FailingStorage {
        fn load(&self) -> Result<Value> {
            Err(Error::Storage("unavailable".into()))
        }

        fn save(&self, _: &Value) -> Result<()> {
            Err(Error::Storage("unavailable".into()))
        }
    }

    #[test]
    fn malformed_backend_is_reset() {
        let storage = Arc::new(MemoryStorage::with_records(json!({"not": "a list"})));
        let store = PersistentSessionsStore::new(storage.clone());
        assert!(store.is_empty());
        assert_eq!(storage.records(), json!([]));

        let store = PersistentSessionsStore::new(Arc::new(FailingStorage));
        assert!(store.is_empty());
        // Saving failures are swallowed.
        store.add(&init_data(b"a"), None, "s1");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn invalid_records_are_skipped() {
        let storage = Arc::new(MemoryStorage::with_records(json!([
            {"version": 3, "sessionId": "ok", "initDataType": "cenc", "values": []},
            {"version": 9, "sessionId": "future"},
            "garbage",
        ])));
        let store = PersistentSessionsStore::new(storage);
        assert_eq!(store.len(), 1);
        assert_eq!(store.all()[0].session_id(), "ok");
    }

    #[test]
    fn add_is_idempotent_and_upgrades() {
        let (_, store) = store();
        let data = init_data(b"pssh");
        store.add(&data, None, "s1");
        store.add(&data, None, "s1");
        assert_eq!(store.len(), 1);
        assert_eq!(store.all()[0].version(), 3);

        store.add(&init_data(b"other"), None, "s2");
        store.add(&data, Some(&[kid(1)]), "s1");
        let all = store.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].version(), 4);
        assert_eq!(all[1].session_id(), "s1");

        store.add(&data, None, "s1");
        assert_eq!(store.all()[1].version(), 4);
    }

    #[test]
    fn empty_session_id_is_ignored() {
        let (_, store) = store();
        store.add(&init_data(b"pssh"), None, "");
        assert!(store.is_empty());
    }

    #[test]
    fn v4_records_match_by_key_id() {
        let (_, store) = store();
        store.add(&init_data(b"pssh"), Some(&[kid(1), kid(2)]), "s1");
        let by_key = init_data(b"unrelated").with_key_ids(vec![kid(2)]);
        assert_eq!(store.get(&by_key).map(|e| e.session_id().to_string()), Some("s1".into()));
        let unknown_key = init_data(b"pssh").with_key_ids(vec![kid(3)]);
        assert!(store.get(&unknown_key).is_none());
        assert!(store.get(&init_data(b"pssh")).is_some());
    }

    #[test]
    fn legacy_records_are_found() {
        let data = init_data(b"legacy");
        let concatenated = data.values.construct_request_data();
        let hash = hash_buffer(&concatenated);
        let storage = Arc::new(MemoryStorage::with_records(json!([
            {"version": 2, "sessionId": "v2", "initDataType": "cenc",
             "initData": BASE64.encode(b"other"), "initDataHash": hash_buffer(b"other")},
            {"sessionId": "v1", "initDataType": "cenc",
             "initData": concatenated, "initDataHash": hash},
            {"sessionId": "v0", "initDataType": "cenc", "initData": hash_buffer(b"oldest")},
        ])));
        let store = PersistentSessionsStore::new(storage);
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(&data).expect("v1").session_id(), "v1");
        assert_eq!(store.get(&init_data(b"other")).expect("v2").session_id(), "v2");
        assert_eq!(store.get(&init_data(b"oldest")).expect("v0").session_id(), "v0");
    }

    #[test]
    fn new_records_use_latest_shape() {
        let (storage, store) = store();
        store.add(&init_data(b"pssh"), Some(&[kid(7)]), "s1");
        let records = storage.records();
        let record = &records[0];
        assert_eq!(record["version"], 4);
        assert_eq!(record["sessionId"], "s1");
        assert_eq!(record["keyIds"][0], BASE64.encode([7u8; 16]));
        assert_eq!(record["values"][0]["systemId"], "edef8ba9");
    }

    #[test]
    fn get_and_reuse_moves_to_the_end() {
        let (_, store) = store();
        store.add(&init_data(b"a"), None, "a");
        store.add(&init_data(b"b"), None, "b");
        store.add(&init_data(b"c"), None, "c");
        let entry = store.get_and_reuse(&init_data(b"a")).expect("a");
        assert_eq!(entry.session_id(), "a");
        let order: Vec<_> = store.all().iter().map(|e| e.session_id().to_string()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn delete_old_sessions_removes_least_recently_used() {
        let (_, store) = store();
        for name in ["a", "b", "c", "d", "e"] {
            store.add(&init_data(name.as_bytes()), None, name);
        }
        store.delete_old_sessions(2);
        let order: Vec<_> = store.all().iter().map(|e| e.session_id().to_string()).collect();
        assert_eq!(order, vec!["c", "d", "e"]);
        store.delete_old_sessions(10);
        assert!(store.is_empty());
    }

    #[test]
    fn delete_removes_matching_record() {
        let (storage, store) = store();
        store.add(&init_data(b"a"), None, "a");
        store.delete(&init_data(b"a"));
        store.delete(&init_data(b"missing"));
        assert!(store.is_empty());
        assert_eq!(storage.records(), json!([]));
    }
}
