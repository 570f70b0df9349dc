//! Operation payloads.
//!
//! Every operation encodes as a canonical CBOR array `[code, payload]` where
//! `payload` is a byte string whose layout depends on the operation type.
//! Key-add, key-delete and key-update payloads are lists of envelopes; an
//! atomic payload is a list of encoded operations.
//!
//! Atomics cannot nest. [`AtomicOp`] uses [`Infallible`] as its atomic
//! payload, so a nested atomic cannot even be constructed.

use bytes::Bytes;
use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;

use oplog_core::{Cid, ContractId, KeyId};
use oplog_keys::envelope::{decode_plain, encode_plain};
use oplog_keys::{
    plain_envelope_data, EncryptedData, EncryptedWire, Envelope, EnvelopeError, KeyRecord,
    KeyUpdate, Open, OpenContext, Seal, SignedWire,
};

use crate::error::ProtocolError;

type EnvResult<T> = std::result::Result<T, EnvelopeError>;

/// Default bound on the number of members of an atomic operation.
pub const MAX_ATOMIC_OPS: usize = 64;

/// Operation kinds and their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Contract,
    ActionEncrypted,
    ActionUnencrypted,
    KeyAdd,
    KeyDel,
    KeyUpdate,
    PropSet,
    KeyShare,
    KeyRequest,
    KeyRequestSeen,
    Atomic,
}

impl OpType {
    pub const ALL: [OpType; 11] = [
        OpType::Contract,
        OpType::ActionEncrypted,
        OpType::ActionUnencrypted,
        OpType::KeyAdd,
        OpType::KeyDel,
        OpType::KeyUpdate,
        OpType::PropSet,
        OpType::KeyShare,
        OpType::KeyRequest,
        OpType::KeyRequestSeen,
        OpType::Atomic,
    ];

    /// Wire code. Also the name used in key `permissions`.
    pub const fn code(&self) -> &'static str {
        match self {
            OpType::Contract => "c",
            OpType::ActionEncrypted => "ae",
            OpType::ActionUnencrypted => "au",
            OpType::KeyAdd => "ka",
            OpType::KeyDel => "kd",
            OpType::KeyUpdate => "ku",
            OpType::PropSet => "ps",
            OpType::KeyShare => "ks",
            OpType::KeyRequest => "kr",
            OpType::KeyRequestSeen => "krs",
            OpType::Atomic => "a",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Whether this kind can alter the key table.
    pub const fn is_key_op(&self) -> bool {
        matches!(
            self,
            OpType::Contract | OpType::KeyAdd | OpType::KeyDel | OpType::KeyUpdate
        )
    }

    /// Whether the payload is a list of envelopes.
    pub const fn is_list(&self) -> bool {
        matches!(self, OpType::KeyAdd | OpType::KeyDel | OpType::KeyUpdate)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// An application action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionData {
    #[serde(rename = "type")]
    pub action_type: String,
    pub data: Value,
}

plain_envelope_data!(ActionData);

impl ActionData {
    pub fn new(action_type: impl Into<String>, data: Value) -> Self {
        Self {
            action_type: action_type.into(),
            data,
        }
    }
}

/// Contract creation: the contract type and its initial keys.
#[derive(Debug)]
pub struct ContractCreate {
    pub contract_type: String,
    pub keys: Vec<Envelope<KeyRecord>>,
}

#[derive(Serialize, Deserialize)]
struct ContractCreateWire {
    #[serde(rename = "type")]
    contract_type: String,
    keys: Vec<Bytes>,
}

/// Set a contract property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropSet {
    pub key: String,
    pub value: Value,
}

/// Key material handed from one contract to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyShare {
    /// Contract whose key table holds the key `keys` is encrypted to.
    pub contract_id: ContractId,
    /// Contract the shared keys belong to, when not the one this share is
    /// published in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_contract_id: Option<ContractId>,
    /// The key-request message this share answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Cid>,
    pub keys: EncryptedWire,
}

/// The fields of a key request, shared by both wire versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRequestBody {
    /// Requesting contract.
    pub contract_id: ContractId,
    /// Requester height at which the reply key exists.
    pub height: u64,
    /// Signed [`ReplyWith`](crate::delegation::ReplyWith) descriptor.
    pub reply_with: SignedWire,
    /// `"*"` or a comma-separated list of key names.
    pub request: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

plain_envelope_data!(KeyRequestBody);

/// A key request. Version 2 may be encrypted or signed and carries a
/// `reference`.
#[derive(Debug)]
pub enum KeyRequest {
    V1(KeyRequestBody),
    V2(Envelope<KeyRequestBody>),
}

impl KeyRequest {
    pub fn body(&self) -> EnvResult<&KeyRequestBody> {
        match self {
            KeyRequest::V1(body) => Ok(body),
            KeyRequest::V2(envelope) => envelope.value(),
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            KeyRequest::V1(_) => 1,
            KeyRequest::V2(_) => 2,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct KeyRequestWire {
    v: u8,
    body: Bytes,
}

/// Acknowledges a key request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequestSeen {
    pub request: Cid,
    pub success: bool,
}

#[derive(Serialize, Deserialize)]
struct OpWire(String, Bytes);

/// An operation. `A` is the payload of the atomic variant.
#[derive(Debug)]
pub enum Op<A> {
    Contract(ContractCreate),
    ActionEncrypted(EncryptedData<Envelope<ActionData>>),
    ActionUnencrypted(Envelope<ActionData>),
    KeyAdd(Vec<Envelope<KeyRecord>>),
    KeyDel(Vec<Envelope<KeyId>>),
    KeyUpdate(Vec<Envelope<KeyUpdate>>),
    PropSet(PropSet),
    KeyShare(KeyShare),
    KeyRequest(KeyRequest),
    KeyRequestSeen(KeyRequestSeen),
    Atomic(A),
}

/// A member of an atomic batch. Cannot itself be atomic.
pub type AtomicOp = Op<Infallible>;

/// A top-level operation.
pub type Operation = Op<Vec<AtomicOp>>;

/// Payload of the atomic variant.
pub trait AtomicMembers: Sized {
    fn seal_members(&self, aad: &[u8]) -> EnvResult<Vec<Bytes>>;
    fn open_members(members: &[Bytes], ctx: &OpenContext) -> EnvResult<Self>;
    fn member_types(&self) -> Vec<OpType>;
}

impl AtomicMembers for Infallible {
    fn seal_members(&self, _aad: &[u8]) -> EnvResult<Vec<Bytes>> {
        match *self {}
    }

    fn open_members(_members: &[Bytes], _ctx: &OpenContext) -> EnvResult<Self> {
        Err(EnvelopeError::Format("atomic operations cannot nest".into()))
    }

    fn member_types(&self) -> Vec<OpType> {
        match *self {}
    }
}

impl AtomicMembers for Vec<AtomicOp> {
    fn seal_members(&self, aad: &[u8]) -> EnvResult<Vec<Bytes>> {
        self.iter().map(|op| op.seal(aad).map(Bytes::from)).collect()
    }

    fn open_members(members: &[Bytes], ctx: &OpenContext) -> EnvResult<Self> {
        members.iter().map(|m| AtomicOp::open(m, ctx)).collect()
    }

    fn member_types(&self) -> Vec<OpType> {
        self.iter().map(Op::op_type).collect()
    }
}

impl<A> Op<A> {
    pub fn op_type(&self) -> OpType {
        match self {
            Op::Contract(_) => OpType::Contract,
            Op::ActionEncrypted(_) => OpType::ActionEncrypted,
            Op::ActionUnencrypted(_) => OpType::ActionUnencrypted,
            Op::KeyAdd(_) => OpType::KeyAdd,
            Op::KeyDel(_) => OpType::KeyDel,
            Op::KeyUpdate(_) => OpType::KeyUpdate,
            Op::PropSet(_) => OpType::PropSet,
            Op::KeyShare(_) => OpType::KeyShare,
            Op::KeyRequest(_) => OpType::KeyRequest,
            Op::KeyRequestSeen(_) => OpType::KeyRequestSeen,
            Op::Atomic(_) => OpType::Atomic,
        }
    }

    fn list_len(&self) -> Option<usize> {
        match self {
            Op::KeyAdd(list) => Some(list.len()),
            Op::KeyDel(list) => Some(list.len()),
            Op::KeyUpdate(list) => Some(list.len()),
            _ => None,
        }
    }
}

fn seal_each<T: Seal>(items: &[T], aad: &[u8]) -> EnvResult<Vec<Bytes>> {
    items.iter().map(|item| item.seal(aad).map(Bytes::from)).collect()
}

fn open_each<T: Open>(items: &[Bytes], ctx: &OpenContext) -> EnvResult<Vec<T>> {
    items.iter().map(|item| T::open(item, ctx)).collect()
}

fn open_list<T: Open>(payload: &[u8], ctx: &OpenContext) -> EnvResult<Vec<T>> {
    let items: Vec<Bytes> = decode_plain(payload)?;
    open_each(&items, ctx)
}

impl<A: AtomicMembers> Seal for Op<A> {
    fn seal(&self, aad: &[u8]) -> EnvResult<Vec<u8>> {
        let payload = match self {
            Op::Contract(create) => encode_plain(&ContractCreateWire {
                contract_type: create.contract_type.clone(),
                keys: seal_each(&create.keys, aad)?,
            })?,
            Op::ActionEncrypted(action) => action.seal(aad)?,
            Op::ActionUnencrypted(action) => action.seal(aad)?,
            Op::KeyAdd(keys) => encode_plain(&seal_each(keys, aad)?)?,
            Op::KeyDel(ids) => encode_plain(&seal_each(ids, aad)?)?,
            Op::KeyUpdate(updates) => encode_plain(&seal_each(updates, aad)?)?,
            Op::PropSet(prop) => encode_plain(prop)?,
            Op::KeyShare(share) => encode_plain(share)?,
            Op::KeyRequest(KeyRequest::V1(body)) => encode_plain(&KeyRequestWire {
                v: 1,
                body: encode_plain(body)?.into(),
            })?,
            Op::KeyRequest(KeyRequest::V2(envelope)) => encode_plain(&KeyRequestWire {
                v: 2,
                body: envelope.seal(aad)?.into(),
            })?,
            Op::KeyRequestSeen(seen) => encode_plain(seen)?,
            Op::Atomic(members) => encode_plain(&members.seal_members(aad)?)?,
        };
        encode_plain(&OpWire(self.op_type().code().to_string(), payload.into()))
    }
}

impl<A: AtomicMembers> Open for Op<A> {
    fn open(bytes: &[u8], ctx: &OpenContext) -> EnvResult<Self> {
        let OpWire(code, payload) = decode_plain(bytes)?;
        let op_type = OpType::from_code(&code)
            .ok_or_else(|| EnvelopeError::Format(format!("unknown operation type {code:?}")))?;

        Ok(match op_type {
            OpType::Contract => {
                let wire: ContractCreateWire = decode_plain(&payload)?;
                Op::Contract(ContractCreate {
                    contract_type: wire.contract_type,
                    keys: open_each(&wire.keys, ctx)?,
                })
            }
            OpType::ActionEncrypted => Op::ActionEncrypted(EncryptedData::open(&payload, ctx)?),
            OpType::ActionUnencrypted => Op::ActionUnencrypted(Envelope::open(&payload, ctx)?),
            OpType::KeyAdd => Op::KeyAdd(open_list(&payload, ctx)?),
            OpType::KeyDel => Op::KeyDel(open_list(&payload, ctx)?),
            OpType::KeyUpdate => Op::KeyUpdate(open_list(&payload, ctx)?),
            OpType::PropSet => Op::PropSet(decode_plain(&payload)?),
            OpType::KeyShare => Op::KeyShare(decode_plain(&payload)?),
            OpType::KeyRequest => {
                let wire: KeyRequestWire = decode_plain(&payload)?;
                Op::KeyRequest(match wire.v {
                    1 => KeyRequest::V1(decode_plain(&wire.body)?),
                    2 => KeyRequest::V2(Envelope::open(&wire.body, ctx)?),
                    v => {
                        return Err(EnvelopeError::Format(format!(
                            "unsupported key request version {v}"
                        )))
                    }
                })
            }
            OpType::KeyRequestSeen => Op::KeyRequestSeen(decode_plain(&payload)?),
            OpType::Atomic => {
                let members: Vec<Bytes> = decode_plain(&payload)?;
                Op::Atomic(A::open_members(&members, ctx)?)
            }
        })
    }
}

/// The structure of an operation, independent of its signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpShape {
    pub op_type: OpType,
    /// Member types of an atomic, in order. Empty otherwise.
    pub members: Vec<OpType>,
}

fn structural(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::Structural(msg.into())
}

fn check_members(members: &[OpType], max_atomic_ops: usize) -> Result<(), ProtocolError> {
    if members.is_empty() {
        return Err(structural("atomic operation has no members"));
    }
    if members.len() > max_atomic_ops {
        return Err(structural(format!(
            "atomic operation has {} members, the limit is {max_atomic_ops}",
            members.len()
        )));
    }
    for member in members {
        match member {
            OpType::Atomic => return Err(structural("atomic operations cannot nest")),
            OpType::Contract => {
                return Err(structural("contract creation cannot appear inside an atomic"))
            }
            _ => {}
        }
    }
    Ok(())
}

impl OpShape {
    /// Shape of an outgoing operation.
    pub fn of(op: &Operation, max_atomic_ops: usize) -> Result<Self, ProtocolError> {
        let op_type = op.op_type();
        let members = match op {
            Op::Atomic(members) => {
                let types = members.member_types();
                check_members(&types, max_atomic_ops)?;
                if members.iter().any(|m| m.list_len() == Some(0)) {
                    return Err(structural("key operation lists cannot be empty"));
                }
                types
            }
            _ => Vec::new(),
        };
        if op.list_len() == Some(0) {
            return Err(structural("key operation lists cannot be empty"));
        }
        Ok(Self { op_type, members })
    }

    /// Shape of an encoded operation, checked without opening envelopes.
    pub fn inspect(bytes: &[u8], max_atomic_ops: usize) -> Result<Self, ProtocolError> {
        let (op_type, payload) = inspect_one(bytes)?;
        let mut members = Vec::new();
        if op_type == OpType::Atomic {
            let list: Vec<Bytes> = decode_plain(&payload)
                .map_err(|_| structural("atomic payload must be a list"))?;
            for member in &list {
                members.push(inspect_one(member)?.0);
            }
            check_members(&members, max_atomic_ops)?;
        }
        Ok(Self { op_type, members })
    }

    /// Whether the operation, or any atomic member, can alter the key table.
    pub fn is_key_op(&self) -> bool {
        self.op_type.is_key_op() || self.members.iter().any(OpType::is_key_op)
    }

    /// Contract creation must be exactly the first message of a contract.
    pub fn check_position(&self, is_first: bool) -> Result<(), ProtocolError> {
        match (is_first, self.op_type == OpType::Contract) {
            (true, false) => Err(structural("the first message must create the contract")),
            (false, true) => Err(structural("contract creation must be the first message")),
            _ => Ok(()),
        }
    }
}

fn inspect_one(bytes: &[u8]) -> Result<(OpType, Bytes), ProtocolError> {
    let OpWire(code, payload) =
        decode_plain(bytes).map_err(|e| ProtocolError::Format(e.to_string()))?;
    let op_type = OpType::from_code(&code)
        .ok_or_else(|| structural(format!("unknown operation type {code:?}")))?;
    if op_type.is_list() {
        let list: Vec<Bytes> = decode_plain(&payload)
            .map_err(|_| structural(format!("{op_type} payload must be a list")))?;
        if list.is_empty() {
            return Err(structural("key operation lists cannot be empty"));
        }
    }
    Ok((op_type, payload))
}
