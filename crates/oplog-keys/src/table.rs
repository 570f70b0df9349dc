//! The authorized-key table of a contract.
//!
//! Every key carries a closed-open validity window `[valid_from, valid_until)`
//! in contract heights. Revoked keys stay in the table so older messages can
//! still be verified against them.

use std::collections::BTreeMap;
use std::sync::Arc;

use oplog_core::{ContractId, KeyId};

use crate::error::{EnvelopeError, PermsError};
use crate::record::{KeyPurpose, KeyRecord};

/// Which keys decryption may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyScope {
    /// Only keys whose validity window contains the height.
    #[default]
    Window,
    /// Revoked keys too. Used only to read key-share material whose
    /// encrypting contract has since rotated past the key.
    IncludeRevoked,
}

/// A key record plus its validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    pub record: KeyRecord,
    pub valid_from: u64,
    pub valid_until: Option<u64>,
}

impl AuthorizedKey {
    /// Whether `height` falls in `[valid_from, valid_until)`.
    pub fn is_valid_at(&self, height: u64) -> bool {
        self.valid_from <= height && self.valid_until.map_or(true, |until| height < until)
    }

    /// Whether the key has not been revoked.
    pub fn is_current(&self) -> bool {
        self.valid_until.is_none()
    }

    pub fn id(&self) -> &KeyId {
        &self.record.id
    }
}

/// Read access to other contracts' key tables.
///
/// Used for inner signatures made by another contract's key and for
/// key-share material that authenticates against a foreign contract.
pub trait ForeignTables: Send + Sync {
    /// The latest known key table and height of `contract`.
    fn snapshot(&self, contract: &ContractId) -> Option<(Arc<KeyTable>, u64)>;
}

/// A contract's authorized keys, current and revoked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyTable {
    keys: BTreeMap<KeyId, AuthorizedKey>,
}

impl KeyTable {
    /// Build the initial table of a contract from its creation keys.
    pub fn bootstrap<I>(records: I, height: u64) -> Result<Self, PermsError>
    where
        I: IntoIterator<Item = KeyRecord>,
    {
        let mut table = Self::default();
        for record in records {
            record.check_id()?;
            table.insert(record, height)?;
        }
        Ok(table)
    }

    pub fn get(&self, id: &KeyId) -> Option<&AuthorizedKey> {
        self.keys.get(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// All keys, revoked ones included.
    pub fn iter(&self) -> impl Iterator<Item = &AuthorizedKey> {
        self.keys.values()
    }

    /// Keys that have not been revoked.
    pub fn current(&self) -> impl Iterator<Item = &AuthorizedKey> {
        self.keys.values().filter(|k| k.is_current())
    }

    /// The current key named `name`. At most one exists.
    pub fn current_by_name(&self, name: &str) -> Option<&AuthorizedKey> {
        self.current().find(|k| k.record.name == name)
    }

    /// Every key that ever held `name`, oldest first.
    pub fn history_by_name(&self, name: &str) -> Vec<&AuthorizedKey> {
        let mut history: Vec<_> = self.keys.values().filter(|k| k.record.name == name).collect();
        history.sort_by_key(|k| k.valid_from);
        history
    }

    /// Add a key valid from `height`.
    ///
    /// Fails if the id is already present or the name already has a
    /// current key.
    pub fn insert(&mut self, record: KeyRecord, height: u64) -> Result<(), PermsError> {
        if self.keys.contains_key(&record.id) {
            return Err(PermsError::InvalidKey(format!("duplicate key id {}", record.id)));
        }
        if self.current_by_name(&record.name).is_some() {
            return Err(PermsError::InvalidKey(format!(
                "a current key named {:?} already exists",
                record.name
            )));
        }
        self.keys.insert(
            record.id,
            AuthorizedKey {
                record,
                valid_from: height,
                valid_until: None,
            },
        );
        Ok(())
    }

    /// Close the validity window of a current key at `height`.
    pub fn revoke(&mut self, id: &KeyId, height: u64) -> Result<(), PermsError> {
        let key = self.keys.get_mut(id).ok_or(PermsError::KeyNotFound(*id))?;
        if key.valid_until.is_some() {
            return Err(PermsError::InvalidKey(format!("key {id} is already revoked")));
        }
        key.valid_until = Some(height);
        Ok(())
    }

    /// Check that `id` may sign a message at `height`.
    pub fn authorize_signing(&self, id: &KeyId, height: u64) -> Result<&AuthorizedKey, EnvelopeError> {
        let key = self.get(id).ok_or(EnvelopeError::SignatureKeyNotFound(*id))?;
        let unauthorized = |reason: &str| EnvelopeError::SignatureKeyUnauthorized {
            key: *id,
            height,
            reason: reason.to_string(),
        };
        if !key.record.has_purpose(KeyPurpose::Sig) {
            return Err(unauthorized("key lacks the sig purpose"));
        }
        if !key.is_valid_at(height) {
            return Err(unauthorized("height outside the key's validity window"));
        }
        Ok(key)
    }

    /// Check that `id` may decrypt data at `height`.
    pub fn authorize_decryption(
        &self,
        id: &KeyId,
        height: u64,
        scope: KeyScope,
    ) -> Result<&AuthorizedKey, EnvelopeError> {
        let key = self
            .get(id)
            .ok_or_else(|| EnvelopeError::Decryption(format!("key {id} is not in the key table")))?;
        if !key.record.has_purpose(KeyPurpose::Enc) {
            return Err(EnvelopeError::Decryption(format!("key {id} lacks the enc purpose")));
        }
        if scope == KeyScope::Window && !key.is_valid_at(height) {
            return Err(EnvelopeError::Decryption(format!(
                "key {id} is not valid at height {height}"
            )));
        }
        Ok(key)
    }

    /// Resolve the key to use for new outgoing data.
    ///
    /// A revoked key is replaced by the current key with the same name, as
    /// long as that key has `purpose`.
    pub fn resolve_current(&self, id: &KeyId, purpose: KeyPurpose) -> Result<&AuthorizedKey, EnvelopeError> {
        let no_current = || EnvelopeError::NoCurrentKey {
            key: *id,
            purpose: purpose.to_string(),
        };
        let key = self.get(id).ok_or_else(no_current)?;
        let key = if key.is_current() {
            key
        } else {
            self.current_by_name(&key.record.name).ok_or_else(no_current)?
        };
        if !key.record.has_purpose(purpose) {
            return Err(no_current());
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oplog_core::SecretKey;

    fn record(name: &str, purpose: KeyPurpose) -> (SecretKey, KeyRecord) {
        let secret = match purpose {
            KeyPurpose::Enc => SecretKey::generate_encryption(),
            _ => SecretKey::generate_signing(),
        };
        let record = KeyRecord::new(name, &secret.public(), [purpose]);
        (secret, record)
    }

    #[test]
    fn test_validity_window_is_closed_open() {
        let (_, rec) = record("sig", KeyPurpose::Sig);
        let id = rec.id;
        let mut table = KeyTable::default();
        table.insert(rec, 3).unwrap();

        assert!(table.authorize_signing(&id, 2).is_err());
        assert!(table.authorize_signing(&id, 3).is_ok());
        assert!(table.authorize_signing(&id, 100).is_ok());

        table.revoke(&id, 7).unwrap();
        assert!(table.authorize_signing(&id, 6).is_ok());
        assert!(matches!(
            table.authorize_signing(&id, 7),
            Err(EnvelopeError::SignatureKeyUnauthorized { .. })
        ));
    }

    #[test]
    fn test_signing_requires_sig_purpose() {
        let (_, rec) = record("enc", KeyPurpose::Enc);
        let id = rec.id;
        let table = KeyTable::bootstrap([rec], 0).unwrap();

        assert!(matches!(
            table.authorize_signing(&id, 0),
            Err(EnvelopeError::SignatureKeyUnauthorized { .. })
        ));
        let missing = SecretKey::generate_signing().id();
        assert_eq!(
            table.authorize_signing(&missing, 0).unwrap_err(),
            EnvelopeError::SignatureKeyNotFound(missing)
        );
    }

    #[test]
    fn test_include_revoked_scope() {
        let (_, rec) = record("enc", KeyPurpose::Enc);
        let id = rec.id;
        let mut table = KeyTable::bootstrap([rec], 0).unwrap();
        table.revoke(&id, 5).unwrap();

        assert!(table.authorize_decryption(&id, 9, KeyScope::Window).is_err());
        assert!(table.authorize_decryption(&id, 9, KeyScope::IncludeRevoked).is_ok());
    }

    #[test]
    fn test_unique_current_names() {
        let (_, a) = record("main", KeyPurpose::Sig);
        let (_, b) = record("main", KeyPurpose::Sig);
        let a_id = a.id;
        let mut table = KeyTable::default();
        table.insert(a.clone(), 0).unwrap();

        assert!(table.insert(b.clone(), 1).is_err());
        assert!(table.insert(a, 1).is_err());

        table.revoke(&a_id, 2).unwrap();
        table.insert(b, 2).unwrap();

        let history = table.history_by_name("main");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id(), &a_id);
        assert_eq!(table.current_by_name("main").map(|k| k.valid_from), Some(2));
    }

    #[test]
    fn test_resolve_current_substitutes_revoked_key() {
        let (_, old) = record("main", KeyPurpose::Sig);
        let (_, new) = record("main", KeyPurpose::Sig);
        let (old_id, new_id) = (old.id, new.id);

        let mut table = KeyTable::bootstrap([old], 0).unwrap();
        assert_eq!(table.resolve_current(&old_id, KeyPurpose::Sig).unwrap().id(), &old_id);

        table.revoke(&old_id, 1).unwrap();
        assert!(matches!(
            table.resolve_current(&old_id, KeyPurpose::Sig),
            Err(EnvelopeError::NoCurrentKey { .. })
        ));

        table.insert(new, 1).unwrap();
        assert_eq!(table.resolve_current(&old_id, KeyPurpose::Sig).unwrap().id(), &new_id);
        assert!(table.resolve_current(&old_id, KeyPurpose::Enc).is_err());
    }
}
