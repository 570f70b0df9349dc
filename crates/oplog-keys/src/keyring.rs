//! Locally held secret keys.

use std::collections::HashMap;
use std::sync::RwLock;

use oplog_core::{CoreError, KeyId, SecretKey};

/// Secret material as a caller may hold it.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    Key(SecretKey),
    /// `"<alg>-secret:<hex>"`, parsed on demand.
    Serialized(String),
}

impl KeyMaterial {
    pub fn into_secret(self) -> Result<SecretKey, CoreError> {
        match self {
            KeyMaterial::Key(key) => Ok(key),
            KeyMaterial::Serialized(text) => SecretKey::parse_secret(&text),
        }
    }
}

/// Lookup of secret keys by id.
pub trait SecretKeys: Send + Sync {
    fn lookup(&self, id: &KeyId) -> Option<KeyMaterial>;

    /// Resolve `id` to a parsed secret whose public half matches `id`.
    fn secret(&self, id: &KeyId) -> Option<SecretKey> {
        let secret = self.lookup(id)?.into_secret().ok()?;
        (secret.id() == *id).then_some(secret)
    }
}

/// An in-memory key ring.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: RwLock<HashMap<KeyId, KeyMaterial>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret, returning its id.
    pub fn insert(&self, key: SecretKey) -> KeyId {
        let id = key.id();
        self.write().insert(id, KeyMaterial::Key(key));
        id
    }

    /// Add a serialized secret.
    pub fn insert_serialized(&self, text: impl Into<String>) -> Result<KeyId, CoreError> {
        let text = text.into();
        let id = SecretKey::parse_secret(&text)?.id();
        self.write().insert(id, KeyMaterial::Serialized(text));
        Ok(id)
    }

    pub fn remove(&self, id: &KeyId) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn contains(&self, id: &KeyId) -> bool {
        self.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<KeyId, KeyMaterial>> {
        self.keys.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<KeyId, KeyMaterial>> {
        self.keys.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SecretKeys for KeyRing {
    fn lookup(&self, id: &KeyId) -> Option<KeyMaterial> {
        self.read().get(id).cloned()
    }
}

/// A key set with no secrets, for verifying without decrypting.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecrets;

impl SecretKeys for NoSecrets {
    fn lookup(&self, _id: &KeyId) -> Option<KeyMaterial> {
        None
    }
}
