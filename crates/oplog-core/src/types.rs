//! Strong type definitions for oplog identifiers.
//!
//! All identifiers are newtypes over [`Cid`] to prevent mixing a message hash
//! with a key id at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cid::{Cid, CONTRACT_DATA_CODEC, KEY_CODEC};
use crate::error::{CoreError, Result};

/// Identity of a contract: the CID of its contract-creation message.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Cid", into = "Cid")]
pub struct ContractId(pub Cid);

impl ContractId {
    /// Wrap a message CID.
    pub fn from_cid(cid: Cid) -> Result<Self> {
        if cid.codec() != CONTRACT_DATA_CODEC {
            return Err(CoreError::InvalidCid(format!(
                "contract id must use the contract data codec, got 0x{:x}",
                cid.codec()
            )));
        }
        Ok(Self(cid))
    }

    /// The underlying CID.
    pub const fn cid(&self) -> &Cid {
        &self.0
    }
}

impl TryFrom<Cid> for ContractId {
    type Error = CoreError;

    fn try_from(cid: Cid) -> Result<Self> {
        Self::from_cid(cid)
    }
}

impl From<ContractId> for Cid {
    fn from(id: ContractId) -> Self {
        id.0
    }
}

impl fmt::Debug for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.0.to_string();
        write!(f, "ContractId(..{})", &text[text.len().saturating_sub(12)..])
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ContractId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_cid(s.parse()?)
    }
}

/// Identity of a key: the CID of its serialized public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Cid", into = "Cid")]
pub struct KeyId(pub Cid);

impl KeyId {
    /// Derive the id for a serialized public key.
    pub fn for_public_key(serialized: &str) -> Self {
        Self(Cid::compute(KEY_CODEC, serialized.as_bytes()))
    }

    pub fn from_cid(cid: Cid) -> Result<Self> {
        if cid.codec() != KEY_CODEC {
            return Err(CoreError::InvalidCid("key id must use the key codec".into()));
        }
        Ok(Self(cid))
    }

    /// The underlying CID.
    pub const fn cid(&self) -> &Cid {
        &self.0
    }
}

impl TryFrom<Cid> for KeyId {
    type Error = CoreError;

    fn try_from(cid: Cid) -> Result<Self> {
        Self::from_cid(cid)
    }
}

impl From<KeyId> for Cid {
    fn from(id: KeyId) -> Self {
        id.0
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.0.to_string();
        write!(f, "KeyId(..{})", &text[text.len().saturating_sub(12)..])
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for KeyId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_cid(s.parse()?)
    }
}
