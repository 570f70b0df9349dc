//! The message head.
//!
//! The head is encoded once as a canonical CBOR map with small integer keys
//! and embedded verbatim in the message. Absent optional fields are omitted.
//!
//! | key | field |
//! |-----|-------|
//! | 0 | version |
//! | 1 | operation type code |
//! | 2 | height |
//! | 3 | contract id (absent for contract creation) |
//! | 4 | previous head |
//! | 5 | previous key operation |
//! | 6 | manifest reference |

use ciborium::value::{Integer, Value};

use oplog_core::canonical::{decode_value, encode_value};
use oplog_core::{Cid, ContractId};

use crate::error::{ProtocolError, Result};
use crate::op::OpType;

/// The current head version.
pub const HEAD_VERSION: u64 = 1;

const VERSION: u8 = 0;
const OP_TYPE: u8 = 1;
const HEIGHT: u8 = 2;
const CONTRACT_ID: u8 = 3;
const PREVIOUS_HEAD: u8 = 4;
const PREVIOUS_KEY_OP: u8 = 5;
const MANIFEST: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub version: u64,
    pub op_type: OpType,
    /// Position in the contract log. Contract creation is height 0.
    pub height: u64,
    /// `None` only for contract creation, whose own CID names the contract.
    pub contract_id: Option<ContractId>,
    pub previous_head: Option<Cid>,
    /// Most recent message that could alter the key table.
    pub previous_key_op: Option<Cid>,
    pub manifest: Option<Cid>,
}

fn format(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::Format(msg.into())
}

fn cid_field(value: &Value, field: &str) -> Result<Cid> {
    match value {
        Value::Bytes(bytes) => {
            Cid::from_bytes(bytes).map_err(|e| format(format!("head {field}: {e}")))
        }
        _ => Err(format(format!("head {field} must be a byte string"))),
    }
}

fn uint_field(value: &Value, field: &str) -> Result<u64> {
    match value {
        Value::Integer(i) => {
            u64::try_from(*i).map_err(|_| format(format!("head {field} out of range")))
        }
        _ => Err(format(format!("head {field} must be an unsigned integer"))),
    }
}

impl MessageHead {
    pub fn is_first(&self) -> bool {
        self.contract_id.is_none()
    }

    /// Canonical bytes of the head.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let key = |k: u8| Value::Integer(Integer::from(k));
        let mut entries = vec![
            (key(VERSION), Value::Integer(Integer::from(self.version))),
            (key(OP_TYPE), Value::Text(self.op_type.code().to_string())),
            (key(HEIGHT), Value::Integer(Integer::from(self.height))),
        ];
        let optional = [
            (CONTRACT_ID, self.contract_id.map(|c| c.0)),
            (PREVIOUS_HEAD, self.previous_head),
            (PREVIOUS_KEY_OP, self.previous_key_op),
            (MANIFEST, self.manifest),
        ];
        for (k, cid) in optional {
            if let Some(cid) = cid {
                entries.push((key(k), Value::Bytes(cid.to_bytes())));
            }
        }
        Ok(encode_value(&Value::Map(entries))?)
    }

    /// Parse canonical head bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value = decode_value(bytes).map_err(|e| format(format!("head: {e}")))?;
        let Value::Map(entries) = value else {
            return Err(format("head must be a map"));
        };

        let mut version = None;
        let mut op_type = None;
        let mut height = None;
        let mut head = MessageHead {
            version: HEAD_VERSION,
            op_type: OpType::Contract,
            height: 0,
            contract_id: None,
            previous_head: None,
            previous_key_op: None,
            manifest: None,
        };

        for (k, v) in &entries {
            let k = match k {
                Value::Integer(i) => u8::try_from(*i).map_err(|_| format("unknown head field"))?,
                _ => return Err(format("head keys must be integers")),
            };
            match k {
                VERSION => version = Some(uint_field(v, "version")?),
                OP_TYPE => {
                    let code = v.as_text().ok_or_else(|| format("head type must be text"))?;
                    op_type = Some(
                        OpType::from_code(code)
                            .ok_or_else(|| format(format!("unknown operation type {code:?}")))?,
                    );
                }
                HEIGHT => height = Some(uint_field(v, "height")?),
                CONTRACT_ID => {
                    let cid = cid_field(v, "contract id")?;
                    head.contract_id = Some(
                        ContractId::from_cid(cid).map_err(|e| format(format!("head contract id: {e}")))?,
                    );
                }
                PREVIOUS_HEAD => head.previous_head = Some(cid_field(v, "previous head")?),
                PREVIOUS_KEY_OP => head.previous_key_op = Some(cid_field(v, "previous key op")?),
                MANIFEST => head.manifest = Some(cid_field(v, "manifest")?),
                other => return Err(format(format!("unknown head field {other}"))),
            }
        }

        head.version = version.ok_or_else(|| format("head is missing its version"))?;
        if head.version != HEAD_VERSION {
            return Err(format(format!("unsupported head version {}", head.version)));
        }
        head.op_type = op_type.ok_or_else(|| format("head is missing its operation type"))?;
        head.height = height.ok_or_else(|| format("head is missing its height"))?;
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oplog_core::CONTRACT_DATA_CODEC;

    fn cid(seed: &[u8]) -> Cid {
        Cid::compute(CONTRACT_DATA_CODEC, seed)
    }

    fn head() -> MessageHead {
        MessageHead {
            version: HEAD_VERSION,
            op_type: OpType::KeyAdd,
            height: 7,
            contract_id: Some(ContractId(cid(b"contract"))),
            previous_head: Some(cid(b"prev")),
            previous_key_op: Some(cid(b"key op")),
            manifest: None,
        }
    }

    #[test]
    fn test_head_roundtrip() {
        let head = head();
        let bytes = head.to_bytes().unwrap();
        assert_eq!(MessageHead::from_bytes(&bytes).unwrap(), head);
    }

    #[test]
    fn test_creation_head_is_compact() {
        let head = MessageHead {
            version: HEAD_VERSION,
            op_type: OpType::Contract,
            height: 0,
            contract_id: None,
            previous_head: None,
            previous_key_op: None,
            manifest: None,
        };
        let bytes = head.to_bytes().unwrap();
        // {0: 1, 1: "c", 2: 0}
        assert_eq!(bytes, vec![0xa3, 0x00, 0x01, 0x01, 0x61, b'c', 0x02, 0x00]);
        assert!(MessageHead::from_bytes(&bytes).unwrap().is_first());
    }

    #[test]
    fn test_rejects_unknown_field_and_version() {
        let mut bytes = head().to_bytes().unwrap();
        // Bump the version value: {0: 2, ...}
        assert_eq!(&bytes[..3], &[0xa6, 0x00, 0x01]);
        bytes[2] = 0x02;
        assert!(MessageHead::from_bytes(&bytes).is_err());

        let extra = encode_value(&Value::Map(vec![
            (Value::Integer(0.into()), Value::Integer(1.into())),
            (Value::Integer(1.into()), Value::Text("ka".into())),
            (Value::Integer(2.into()), Value::Integer(1.into())),
            (Value::Integer(9.into()), Value::Null),
        ]))
        .unwrap();
        assert!(matches!(
            MessageHead::from_bytes(&extra),
            Err(ProtocolError::Format(_))
        ));
    }

    #[test]
    fn test_rejects_non_canonical() {
        let bytes = head().to_bytes().unwrap();
        let mut padded = bytes.clone();
        padded.push(0x00);
        assert!(MessageHead::from_bytes(&padded).is_err());
        assert!(MessageHead::from_bytes(&[]).is_err());
    }
}
