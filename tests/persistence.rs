use std::sync::Arc;

use rseme::init_data::{InitDataValue, InitializationData};
use rseme::key::KeyId;
use rseme::persistent_sessions::PersistentSessionsStore;
use rseme::storage::{JsonFileStorage, MemoryStorage, PersistentSessionsStorage};

const WIDEVINE: &str = "edef8ba979d64acea3c827dcd51d21ed";

fn init_data(payload: &[u8]) -> InitializationData {
    InitializationData::new(
        Some("cenc".into()),
        vec![InitDataValue::new(Some(WIDEVINE.into()), payload.to_vec())],
    )
}

#[test]
fn records_survive_a_reload_from_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("drm/sessions.json");

    let store = PersistentSessionsStore::new(Arc::new(JsonFileStorage::new(&path)));
    store.add(&init_data(b"first"), None, "persisted-1");
    let key_ids = [KeyId::new(vec![1u8; 16])];
    store.add(&init_data(b"second"), Some(&key_ids[..]), "persisted-2");
    assert_eq!(store.len(), 2);

    let reloaded = PersistentSessionsStore::new(Arc::new(JsonFileStorage::new(&path)));
    let entries = reloaded.all();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].session_id(), "persisted-1");
    assert_eq!(entries[0].version(), 3);
    assert_eq!(entries[1].session_id(), "persisted-2");
    assert_eq!(entries[1].version(), 4);

    let found = reloaded
        .get(&init_data(b"second"))
        .ok_or_else(|| anyhow::anyhow!("record not found"))?;
    assert_eq!(found.session_id(), "persisted-2");
    assert!(reloaded.get(&init_data(b"third")).is_none());
    Ok(())
}

#[test]
fn reuse_and_eviction_follow_usage_order() -> anyhow::Result<()> {
    let storage = Arc::new(MemoryStorage::new());
    let store = PersistentSessionsStore::new(storage.clone());
    for (index, payload) in [b"a", b"b", b"c"].iter().enumerate() {
        store.add(&init_data(*payload), None, &format!("session-{index}"));
    }

    assert!(store.get_and_reuse(&init_data(b"a")).is_some());
    store.delete_old_sessions(2);

    let remaining: Vec<String> = store
        .all()
        .iter()
        .map(|entry| entry.session_id().to_string())
        .collect();
    assert_eq!(remaining, vec!["session-0".to_string()]);
    assert_eq!(storage.load()?.as_array().map(Vec::len), Some(1));
    Ok(())
}

#[test]
fn invalid_content_is_reset() -> anyhow::Result<()> {
    let storage = Arc::new(MemoryStorage::with_records(serde_json::json!({"not": "a list"})));
    let store = PersistentSessionsStore::new(storage.clone());
    assert!(store.is_empty());
    assert_eq!(storage.records(), serde_json::json!([]));

    store.add(&init_data(b"a"), None, "session");
    store.delete(&init_data(b"a"));
    assert!(store.is_empty());
    Ok(())
}
