//! Key records: the data a contract stores about each authorized key.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use oplog_core::{ContractId, KeyId, PublicKey, SecretKey};

use crate::envelope::{EncryptedData, EncryptedWire, OpenContext};
use crate::error::{EnvelopeError, PermsError};
use crate::keyring::SecretKeys;
use crate::table::{KeyScope, KeyTable};

/// Capability class of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPurpose {
    /// Encryption.
    Enc,
    /// Signing.
    Sig,
    /// Administrative keys that are never used on the wire.
    Sak,
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyPurpose::Enc => "enc",
            KeyPurpose::Sig => "sig",
            KeyPurpose::Sak => "sak",
        })
    }
}

/// A permission or action scope: everything (`"*"`) or an explicit set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    All,
    Only(BTreeSet<String>),
}

impl Scope {
    /// A scope granting nothing.
    pub fn none() -> Self {
        Scope::Only(BTreeSet::new())
    }

    /// A scope over the given names.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Scope::Only(names.into_iter().map(Into::into).collect())
    }

    /// Whether `name` is in scope.
    pub fn allows(&self, name: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Only(set) => set.contains(name),
        }
    }

    /// Whether every name in `self` is also in `ceiling`.
    ///
    /// `All` is only a subset of `All`.
    pub fn is_subset_of(&self, ceiling: &Scope) -> bool {
        match (self, ceiling) {
            (_, Scope::All) => true,
            (Scope::All, Scope::Only(_)) => false,
            (Scope::Only(a), Scope::Only(b)) => a.is_subset(b),
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scope::All => serializer.serialize_str("*"),
            Scope::Only(set) => set.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Star(String),
            List(BTreeSet<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Star(s) if s == "*" => Ok(Scope::All),
            Repr::Star(s) => Err(serde::de::Error::custom(format!(
                "scope must be \"*\" or a list, got {s:?}"
            ))),
            Repr::List(set) => Ok(Scope::Only(set)),
        }
    }
}

/// A secret key's text form, as carried inside encrypted private material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretText(pub String);

crate::plain_envelope_data!(SecretText);

/// Private half of a key, encrypted to one of the contract's own keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKeyMaterial {
    pub content: EncryptedWire,
    /// May be handed to other contracts through key-share.
    pub shareable: bool,
}

/// A reference to a key that lives in another contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForeignKeyRef {
    pub contract_id: ContractId,
    pub key_name: String,
}

const FOREIGN_KEY_SCHEME: &str = "oplog:";

impl fmt::Display for ForeignKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{FOREIGN_KEY_SCHEME}{}?keyName={}", self.contract_id, self.key_name)
    }
}

impl FromStr for ForeignKeyRef {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, PermsError> {
        let invalid = || PermsError::InvalidKey(format!("invalid foreign key reference {s:?}"));
        let rest = s.strip_prefix(FOREIGN_KEY_SCHEME).ok_or_else(invalid)?;
        let (contract, query) = rest.split_once('?').ok_or_else(invalid)?;
        let key_name = query.strip_prefix("keyName=").ok_or_else(invalid)?;
        if key_name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            contract_id: contract.parse()?,
            key_name: key_name.to_string(),
        })
    }
}

/// An authorized key as recorded in a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub id: KeyId,
    pub name: String,
    pub purpose: BTreeSet<KeyPurpose>,
    pub ring_level: u32,
    pub permissions: Scope,
    pub allowed_actions: Scope,
    /// Serialized public key.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<PrivateKeyMaterial>,
}

crate::plain_envelope_data!(KeyRecord);

impl KeyRecord {
    /// A record for `public` with ring level 0 and unrestricted scopes.
    pub fn new<I>(name: impl Into<String>, public: &PublicKey, purposes: I) -> Self
    where
        I: IntoIterator<Item = KeyPurpose>,
    {
        Self {
            id: public.id(),
            name: name.into(),
            purpose: purposes.into_iter().collect(),
            ring_level: 0,
            permissions: Scope::All,
            allowed_actions: Scope::All,
            data: public.serialize(),
            foreign_key: None,
            private: None,
        }
    }

    /// Set the ring level.
    pub fn ring_level(mut self, ring_level: u32) -> Self {
        self.ring_level = ring_level;
        self
    }

    /// Set the operation permissions.
    pub fn permissions(mut self, permissions: Scope) -> Self {
        self.permissions = permissions;
        self
    }

    /// Set the allowed action types.
    pub fn allowed_actions(mut self, allowed_actions: Scope) -> Self {
        self.allowed_actions = allowed_actions;
        self
    }

    /// Mark this record as standing in for a key of another contract.
    pub fn foreign(mut self, reference: &ForeignKeyRef) -> Self {
        self.foreign_key = Some(reference.to_string());
        self
    }

    /// Attach the private half, encrypted to `encryption_key` of `table`.
    pub fn with_private(
        mut self,
        secret: &SecretKey,
        table: &KeyTable,
        encryption_key: KeyId,
        shareable: bool,
    ) -> Result<Self, EnvelopeError> {
        if secret.id() != self.id {
            return Err(EnvelopeError::Rejected(
                "private material does not match key id".into(),
            ));
        }
        let content = EncryptedData::encrypt(
            table,
            encryption_key,
            SecretText(secret.serialize_secret()),
        )?
        .to_wire(&private_aad(&self.id))?;
        self.private = Some(PrivateKeyMaterial { content, shareable });
        Ok(self)
    }

    /// Whether the record carries `purpose`.
    pub fn has_purpose(&self, purpose: KeyPurpose) -> bool {
        self.purpose.contains(&purpose)
    }

    /// Parse the public key.
    pub fn public_key(&self) -> Result<PublicKey, PermsError> {
        Ok(PublicKey::parse(&self.data)?)
    }

    /// Check that `id` is the CID of `data` and that `data` parses.
    pub fn check_id(&self) -> Result<(), PermsError> {
        let public = self.public_key()?;
        if public.id() != self.id {
            return Err(PermsError::InvalidKey(format!(
                "key {:?} id does not match its data",
                self.name
            )));
        }
        Ok(())
    }

    /// Parsed foreign key reference, if any.
    pub fn foreign_ref(&self) -> Result<Option<ForeignKeyRef>, PermsError> {
        self.foreign_key.as_deref().map(str::parse).transpose()
    }

    /// Decrypt the private half.
    ///
    /// The recovered secret must derive this record's id.
    pub fn open_private(
        &self,
        keys: Arc<KeyTable>,
        height: u64,
        scope: KeyScope,
        secrets: Arc<dyn SecretKeys>,
    ) -> Result<SecretKey, EnvelopeError> {
        let material = self
            .private
            .as_ref()
            .ok_or_else(|| EnvelopeError::Format(format!("key {:?} has no private material", self.name)))?;

        let expected = self.id;
        let ctx = OpenContext::new(keys, height, secrets)
            .with_scope(scope)
            .with_aad(private_aad(&self.id));
        let envelope: EncryptedData<SecretText> = EncryptedData::from_wire(
            material.content.clone(),
            ctx,
            Some(Arc::new(move |text: &SecretText| {
                let secret = SecretKey::parse_secret(&text.0)?;
                if secret.id() == expected {
                    Ok(())
                } else {
                    Err(EnvelopeError::Rejected("private key does not derive key id".into()))
                }
            })),
        );

        Ok(SecretKey::parse_secret(&envelope.value()?.0)?)
    }
}

/// A key rotation: revoke `old_key_id` and install `key` under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUpdate {
    pub old_key_id: KeyId,
    pub key: KeyRecord,
}

crate::plain_envelope_data!(KeyUpdate);

fn private_aad(id: &KeyId) -> Vec<u8> {
    let mut aad = b"oplog-private-key:".to_vec();
    aad.extend_from_slice(&id.cid().to_bytes());
    aad
}
