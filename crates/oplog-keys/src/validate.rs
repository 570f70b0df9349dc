//! Key-authorization rules.
//!
//! Every key-table mutation is checked against the key that signed it:
//!
//! - a key may only manage keys whose ring level is numerically at least
//!   its own;
//! - it may never grant `permissions` or `allowedActions` beyond its own.
//!
//! For deletes and updates the ceiling is the existing key being changed.
//! Validation never mutates; the `apply_*` functions assume validation of
//! the whole operation already passed and are run against a draft table.

use std::collections::HashSet;

use tracing::info;

use oplog_core::KeyId;

use crate::error::PermsError;
use crate::record::{ForeignKeyRef, KeyPurpose, KeyRecord, KeyUpdate};
use crate::table::KeyTable;

/// Follow-up work produced by applying key mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEffect {
    /// A key refers to another contract that must be followed to resolve it.
    WatchForeignKey(ForeignKeyRef),
}

/// Whether private key material must be encrypted to a known `enc` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivateCheck {
    Verify,
    Skip,
}

fn deny(msg: String) -> PermsError {
    PermsError::PermissionDenied(msg)
}

/// Fail unless `signer` may manage `target`.
fn check_ceiling(signer: &KeyRecord, target: &KeyRecord, action: &str) -> Result<(), PermsError> {
    if target.ring_level < signer.ring_level {
        return Err(deny(format!(
            "cannot {action} key {:?} at ring {} with a ring {} key",
            target.name, target.ring_level, signer.ring_level
        )));
    }
    if !target.permissions.is_subset_of(&signer.permissions) {
        return Err(deny(format!(
            "cannot {action} key {:?}: permissions exceed the signer's",
            target.name
        )));
    }
    if !target.allowed_actions.is_subset_of(&signer.allowed_actions) {
        return Err(deny(format!(
            "cannot {action} key {:?}: allowed actions exceed the signer's",
            target.name
        )));
    }
    Ok(())
}

fn check_private(table: &KeyTable, batch: &[&KeyRecord], key: &KeyRecord) -> Result<(), PermsError> {
    let Some(private) = &key.private else {
        return Ok(());
    };
    let target = &private.content.key_id;
    let known = table
        .get(target)
        .map(|k| k.is_current() && k.record.has_purpose(KeyPurpose::Enc))
        .unwrap_or(false)
        || batch
            .iter()
            .any(|k| &k.id == target && k.has_purpose(KeyPurpose::Enc));
    if known {
        Ok(())
    } else {
        Err(PermsError::InvalidKey(format!(
            "private material of {:?} is not encrypted to a current enc key",
            key.name
        )))
    }
}

/// Check a batch of new keys signed by `signer`.
pub fn validate_key_add(
    signer: &KeyRecord,
    table: &KeyTable,
    keys: &[&KeyRecord],
    private: PrivateCheck,
) -> Result<(), PermsError> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();

    for key in keys {
        key.check_id()?;
        if key.purpose.is_empty() {
            return Err(PermsError::InvalidKey(format!("key {:?} has no purpose", key.name)));
        }
        check_ceiling(signer, key, "add")?;

        if table.get(&key.id).is_some() || !ids.insert(key.id) {
            return Err(PermsError::InvalidKey(format!("duplicate key id {}", key.id)));
        }
        if table.current_by_name(&key.name).is_some() || !names.insert(key.name.as_str()) {
            return Err(PermsError::InvalidKey(format!(
                "a current key named {:?} already exists",
                key.name
            )));
        }
        key.foreign_ref()?;
        if private == PrivateCheck::Verify {
            check_private(table, keys, key)?;
        }
    }
    Ok(())
}

/// Check a batch of revocations signed by `signer`.
pub fn validate_key_delete(signer: &KeyRecord, table: &KeyTable, ids: &[KeyId]) -> Result<(), PermsError> {
    let mut seen = HashSet::new();
    for id in ids {
        let existing = table.get(id).ok_or(PermsError::KeyNotFound(*id))?;
        if !existing.is_current() || !seen.insert(*id) {
            return Err(PermsError::InvalidKey(format!("key {id} is already revoked")));
        }
        check_ceiling(signer, &existing.record, "delete")?;
    }
    Ok(())
}

/// Check a batch of key rotations signed by `signer`.
///
/// The signer must be able to manage the existing key, and the replacement
/// may not escalate beyond the signer either. Rotation keeps the name and
/// changes the id.
pub fn validate_key_update(
    signer: &KeyRecord,
    table: &KeyTable,
    updates: &[&KeyUpdate],
    private: PrivateCheck,
) -> Result<(), PermsError> {
    let mut old_ids = HashSet::new();
    let mut new_ids = HashSet::new();
    let new_keys: Vec<&KeyRecord> = updates.iter().map(|u| &u.key).collect();

    for update in updates {
        let existing = table
            .get(&update.old_key_id)
            .ok_or(PermsError::KeyNotFound(update.old_key_id))?;
        if !existing.is_current() || !old_ids.insert(update.old_key_id) {
            return Err(PermsError::InvalidKey(format!(
                "key {} is already revoked",
                update.old_key_id
            )));
        }
        check_ceiling(signer, &existing.record, "update")?;

        let key = &update.key;
        key.check_id()?;
        check_ceiling(signer, key, "update")?;
        if key.name != existing.record.name {
            return Err(PermsError::InvalidKey(format!(
                "update of {:?} cannot rename it to {:?}",
                existing.record.name, key.name
            )));
        }
        if key.id == update.old_key_id {
            return Err(PermsError::InvalidKey(format!(
                "update of {:?} must rotate the key",
                key.name
            )));
        }
        if table.get(&key.id).is_some() || !new_ids.insert(key.id) {
            return Err(PermsError::InvalidKey(format!("duplicate key id {}", key.id)));
        }
        key.foreign_ref()?;
        if private == PrivateCheck::Verify {
            check_private(table, &new_keys, key)?;
        }
    }
    Ok(())
}

/// Add validated keys, valid from `height`.
pub fn apply_key_addition(
    table: &mut KeyTable,
    keys: Vec<KeyRecord>,
    height: u64,
    mut effects: Option<&mut Vec<KeyEffect>>,
) -> Result<(), PermsError> {
    for key in keys {
        if let (Some(reference), Some(effects)) = (key.foreign_ref()?, effects.as_deref_mut()) {
            effects.push(KeyEffect::WatchForeignKey(reference));
        }
        info!(key = %key.id, name = %key.name, height, "key added");
        table.insert(key, height)?;
    }
    Ok(())
}

/// Revoke validated keys at `height`.
pub fn apply_key_revocation(table: &mut KeyTable, ids: &[KeyId], height: u64) -> Result<(), PermsError> {
    for id in ids {
        table.revoke(id, height)?;
        info!(key = %id, height, "key revoked");
    }
    Ok(())
}

/// Rotate validated keys at `height`.
pub fn apply_key_update(
    table: &mut KeyTable,
    updates: Vec<KeyUpdate>,
    height: u64,
    mut effects: Option<&mut Vec<KeyEffect>>,
) -> Result<(), PermsError> {
    for update in updates {
        table.revoke(&update.old_key_id, height)?;
        apply_key_addition(table, vec![update.key], height, effects.as_deref_mut())?;
    }
    Ok(())
}

/// Fail unless `signer` may sign operations of kind `op`.
pub fn authorize_op(signer: &KeyRecord, op: &str) -> Result<(), PermsError> {
    if signer.permissions.allows(op) {
        Ok(())
    } else {
        Err(deny(format!("key {:?} may not sign {op:?} operations", signer.name)))
    }
}

/// Fail unless `signer` may sign actions of type `action`.
pub fn authorize_action(signer: &KeyRecord, action: &str) -> Result<(), PermsError> {
    if signer.allowed_actions.allows(action) {
        Ok(())
    } else {
        Err(deny(format!("key {:?} may not sign {action:?} actions", signer.name)))
    }
}
