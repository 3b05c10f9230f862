//! Identity of an opened CDM session.
//!
//! A `KeySessionRecord` binds a session to the initialization data it was
//! opened for and to the key IDs learned since. Key IDs are only ever added,
//! so a record can only become compatible with more initialization data over
//! time.

use parking_lot::RwLock;

use crate::init_data::InitializationData;
use crate::key::{are_all_key_ids_contained_in, is_key_id_contained_in, KeyId};

/// Initialization data and key IDs linked to one CDM session.
#[derive(Debug)]
pub struct KeySessionRecord {
    initialization_data: InitializationData,
    /// `None` until a license or key status named the session's keys.
    key_ids: RwLock<Option<Vec<KeyId>>>,
}

impl KeySessionRecord {
    /// Create a record without any known key ID.
    pub fn new(initialization_data: InitializationData) -> Self {
        Self {
            initialization_data,
            key_ids: RwLock::new(None),
        }
    }

    /// Initialization data the session was created for.
    #[must_use]
    pub fn initialization_data(&self) -> &InitializationData {
        &self.initialization_data
    }

    /// Link key IDs to this session. Already known key IDs are ignored.
    pub fn associate_key_ids<'a>(&self, key_ids: impl IntoIterator<Item = &'a KeyId>) {
        let mut guard = self.key_ids.write();
        let known = guard.get_or_insert_with(Vec::new);
        for key_id in key_ids {
            if !is_key_id_contained_in(key_id, known) {
                known.push(key_id.clone());
            }
        }
    }

    #[must_use]
    pub fn is_associated_with_key_id(&self, key_id: &KeyId) -> bool {
        self.key_ids
            .read()
            .as_ref()
            .is_some_and(|known| is_key_id_contained_in(key_id, known))
    }

    /// Key IDs linked so far, in association order.
    #[must_use]
    pub fn associated_key_ids(&self) -> Vec<KeyId> {
        self.key_ids.read().clone().unwrap_or_default()
    }

    /// Whether the session behind this record can be used for
    /// `initialization_data`.
    ///
    /// Key IDs are checked first: the wanted ones may already be linked to the
    /// session, or be a subset of the key IDs announced with the original
    /// initialization data. Without key IDs on both sides, the raw values are
    /// compared.
    #[must_use]
    pub fn is_compatible_with(&self, initialization_data: &InitializationData) -> bool {
        if let Some(wanted) = initialization_data.known_key_ids() {
            if let Some(known) = self.key_ids.read().as_ref() {
                if are_all_key_ids_contained_in(wanted, known) {
                    return true;
                }
            }
            if let Some(announced) = self.initialization_data.key_ids.as_deref() {
                return are_all_key_ids_contained_in(wanted, announced);
            }
        }
        if self.initialization_data.init_data_type != initialization_data.init_data_type {
            return false;
        }
        self.initialization_data
            .values
            .is_compatible_with(initialization_data.values.formatted())
    }
}
