//! Decipherability sink into the manifest model.
//!
//! The manifest itself is owned by the embedding player. This crate only needs
//! the key IDs each period announces and a way to re-evaluate which
//! representations can be decrypted.

use crate::init_data::{InitDataValue, InitializationData};
use crate::key::{merge_key_ids_into, KeyId};

/// Initialization data announced for a representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionInitData {
    pub init_data_type: String,
    pub values: Vec<InitDataValue>,
}

/// Protection information attached to a representation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentProtections {
    pub key_ids: Vec<KeyId>,
    pub init_data: Vec<ProtectionInitData>,
}

/// Read-only view of a representation given to decipherability updates.
#[derive(Debug, Clone, Copy)]
pub struct RepresentationView<'a> {
    pub id: &'a str,
    /// Current decipherability, `None` when not known yet.
    pub decipherable: Option<bool>,
    pub content_protections: Option<&'a ContentProtections>,
}

/// Key IDs announced by one period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodKeyIds {
    pub period_id: String,
    pub key_ids: Vec<KeyId>,
}

/// Manifest model of the content being played.
///
/// Implementations must not call back into the decryptor from
/// `update_representations_decipherability`.
pub trait Manifest: Send + Sync {
    /// Key IDs announced by each period, in period order.
    fn period_key_ids(&self) -> Vec<PeriodKeyIds>;

    /// Re-evaluate every representation. `update` returns the new
    /// decipherability of the representation it is given.
    fn update_representations_decipherability(
        &self,
        update: &mut dyn FnMut(&RepresentationView<'_>) -> Option<bool>,
    );
}

/// Key IDs announced by the period `period_id`.
#[must_use]
pub fn key_ids_of_period(manifest: &dyn Manifest, period_id: &str) -> Vec<KeyId> {
    manifest
        .period_key_ids()
        .into_iter()
        .find(|p| p.period_id == period_id)
        .map(|p| p.key_ids)
        .unwrap_or_default()
}

/// Every key ID announced by the manifest, without duplicates.
#[must_use]
pub fn content_key_ids(manifest: &dyn Manifest) -> Vec<KeyId> {
    let mut all = Vec::new();
    for period in manifest.period_key_ids() {
        merge_key_ids_into(&mut all, &period.key_ids);
    }
    all
}

/// Mark representations depending on `blacklisted` key IDs as not
/// decipherable and those depending on `whitelisted` ones as decipherable.
/// Representations depending on `delisted` key IDs go back to unknown.
pub fn update_decipherability(
    manifest: &dyn Manifest,
    whitelisted: &[KeyId],
    blacklisted: &[KeyId],
    delisted: &[KeyId],
) {
    manifest.update_representations_decipherability(&mut |representation| {
        let Some(protections) = representation.content_protections else {
            return representation.decipherable;
        };
        for key_id in &protections.key_ids {
            if blacklisted.contains(key_id) {
                return Some(false);
            }
            if whitelisted.contains(key_id) {
                return Some(true);
            }
            if delisted.contains(key_id) {
                return None;
            }
        }
        representation.decipherable
    });
}

/// Mark as not decipherable every representation whose protection data
/// contains all of `init_data`'s values.
pub fn blacklist_protection_data(manifest: &dyn Manifest, init_data: &InitializationData) {
    let wanted = init_data.values.formatted();
    manifest.update_representations_decipherability(&mut |representation| {
        if representation.decipherable == Some(false) {
            return Some(false);
        }
        let protections = representation
            .content_protections
            .map(|p| p.init_data.as_slice())
            .unwrap_or_default();
        for protection in protections {
            let same_type = init_data
                .init_data_type
                .as_deref()
                .map_or(true, |t| t == protection.init_data_type);
            if !same_type {
                continue;
            }
            let contained = wanted.iter().all(|undecipherable| {
                protection.values.iter().any(|current| {
                    (undecipherable.system_id.is_none()
                        || current.system_id == undecipherable.system_id)
                        && current.data == undecipherable.data
                })
            });
            if contained {
                return Some(false);
            }
        }
        representation.decipherable
    });
}
