//! Messages: one entry of a contract log.
//!
//! A message is the canonical map `{"h": head, "p": payload}`. The head is
//! the canonical head encoding, embedded as a byte string; the payload is a
//! signed envelope over the operation, signed with the head bytes as AAD.
//!
//! Outgoing messages produce their wire form and CID on first request.
//! Incoming messages keep the exact bytes they were parsed from, so the CID
//! is always computed over published bytes and never over re-encoded values.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::warn;

use oplog_core::{from_canonical_bytes, to_canonical_bytes, Cid, ContractId, KeyId, CONTRACT_DATA_CODEC};
use oplog_keys::{
    Envelope, EnvelopeError, EnvelopeWire, ForeignTables, KeyRecord, KeyTable, Open, OpenContext,
    SecretKeys, SignedData,
};

use crate::error::{ProtocolError, Result};
use crate::head::{MessageHead, HEAD_VERSION};
use crate::op::{ContractCreate, Op, OpShape, Operation, MAX_ATOMIC_OPS};
use crate::state::ContractState;

#[derive(Serialize, Deserialize)]
struct MessageWire {
    #[serde(rename = "h")]
    head: Bytes,
    #[serde(rename = "p")]
    payload: Bytes,
}

/// Head fields of an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageParams {
    pub contract_id: Option<ContractId>,
    pub previous_head: Option<Cid>,
    pub previous_key_op: Option<Cid>,
    pub height: u64,
    pub manifest: Option<Cid>,
}

impl MessageParams {
    /// Parameters of a contract-creation message.
    pub fn genesis() -> Self {
        Self::default()
    }

    /// Parameters of the message following `state`.
    pub fn next(state: &ContractState) -> Self {
        Self {
            contract_id: Some(state.contract_id),
            previous_head: Some(state.head),
            previous_key_op: state.previous_key_op,
            height: state.height + 1,
            manifest: None,
        }
    }

    pub fn with_manifest(mut self, manifest: Cid) -> Self {
        self.manifest = Some(manifest);
        self
    }
}

/// The key that signed a message.
#[derive(Debug, Clone)]
pub struct MessageSigner {
    pub record: KeyRecord,
    /// Set when the key belongs to another contract.
    pub foreign: Option<ForeignSigner>,
}

/// Latest known key table of the contract holding a foreign signing key.
#[derive(Debug, Clone)]
pub struct ForeignSigner {
    pub contract: ContractId,
    pub keys: Arc<KeyTable>,
    /// Height that table was taken at.
    pub height: u64,
}

/// A contract log entry.
pub struct Message {
    head: MessageHead,
    head_bytes: Bytes,
    payload: SignedData<Operation>,
    shape: OpShape,
    /// Table the payload signature is checked against.
    keys: Arc<KeyTable>,
    foreign: Option<Arc<dyn ForeignTables>>,
    wire: OnceLock<Bytes>,
    cid: OnceLock<Cid>,
}

fn structural(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::Structural(msg.into())
}

fn format(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::Format(msg.into())
}

impl Message {
    /// Build an outgoing message from a signed operation.
    ///
    /// Structural rules are checked here: contract creation is exactly the
    /// first message, atomics are flat and bounded, key operation lists are
    /// non-empty.
    pub fn create(params: MessageParams, payload: SignedData<Operation>, keys: Arc<KeyTable>) -> Result<Self> {
        let shape = OpShape::of(payload.value()?, MAX_ATOMIC_OPS)?;
        let is_first = params.contract_id.is_none();
        shape.check_position(is_first)?;
        if is_first && (params.height != 0 || params.previous_head.is_some()) {
            return Err(structural("contract creation must be at height 0 with no previous head"));
        }
        if !is_first && (params.height == 0 || params.previous_head.is_none()) {
            return Err(structural("messages after creation need a height and a previous head"));
        }

        let head = MessageHead {
            version: HEAD_VERSION,
            op_type: shape.op_type,
            height: params.height,
            contract_id: params.contract_id,
            previous_head: params.previous_head,
            previous_key_op: params.previous_key_op,
            manifest: params.manifest,
        };
        let head_bytes = head.to_bytes()?.into();

        Ok(Self {
            head,
            head_bytes,
            payload,
            shape,
            keys,
            foreign: None,
            wire: OnceLock::new(),
            cid: OnceLock::new(),
        })
    }

    /// Sign `operation` with `key_id` of `keys` and build the message.
    pub fn sign(
        params: MessageParams,
        operation: Operation,
        keys: &Arc<KeyTable>,
        key_id: KeyId,
        secrets: &dyn SecretKeys,
    ) -> Result<Self> {
        let payload = SignedData::sign(keys, key_id, operation, secrets)?;
        Self::create(params, payload, keys.clone())
    }

    /// Build a contract-creation message signed by one of its own keys.
    pub fn create_contract(
        contract_type: impl Into<String>,
        keys: Vec<Envelope<KeyRecord>>,
        signer: KeyId,
        secrets: &dyn SecretKeys,
    ) -> Result<Self> {
        let records = keys.iter().filter_map(|k| k.value().ok().cloned());
        let table = Arc::new(KeyTable::bootstrap(records, 0)?);
        let operation = Op::Contract(ContractCreate {
            contract_type: contract_type.into(),
            keys,
        });
        Self::sign(MessageParams::genesis(), operation, &table, signer, secrets)
    }

    /// Parse an incoming message.
    ///
    /// Contract creation is checked against a table bootstrapped from its own
    /// key list; encrypted records that cannot be read are left out. Every
    /// other message needs `prior`, the state it is applied on top of.
    pub fn deserialize(
        raw: &[u8],
        secrets: Arc<dyn SecretKeys>,
        prior: Option<&ContractState>,
        foreign: Option<Arc<dyn ForeignTables>>,
    ) -> Result<Self> {
        if raw.is_empty() {
            return Err(format("empty message"));
        }
        let wire: MessageWire = from_canonical_bytes(raw).map_err(|e| format(e.to_string()))?;
        let head = MessageHead::from_bytes(&wire.head)?;

        let signed = match EnvelopeWire::decode(&wire.payload)? {
            EnvelopeWire::Signed(signed) => signed,
            _ => return Err(format("message payload must be signed")),
        };
        let shape = OpShape::inspect(&signed.data, MAX_ATOMIC_OPS)?;
        if shape.op_type != head.op_type {
            return Err(format(format!(
                "head says {} but the payload is {}",
                head.op_type, shape.op_type
            )));
        }
        shape.check_position(head.is_first())?;

        let (contract_id, keys) = match (head.contract_id, prior) {
            (None, _) => {
                if head.height != 0 || head.previous_head.is_some() {
                    return Err(structural("contract creation must be at height 0 with no previous head"));
                }
                let contract_id = ContractId(Cid::compute(CONTRACT_DATA_CODEC, raw));
                let keys = bootstrap_table(&signed.data, &wire.head, contract_id, &secrets)?;
                (contract_id, keys)
            }
            (Some(contract_id), Some(prior)) => {
                if prior.contract_id != contract_id {
                    return Err(format(format!(
                        "message for {contract_id} applied to state of {}",
                        prior.contract_id
                    )));
                }
                (contract_id, prior.keys.clone())
            }
            (Some(contract_id), None) => return Err(ProtocolError::MissingState(contract_id)),
        };

        let mut ctx = OpenContext::new(keys.clone(), head.height, secrets)
            .for_contract(contract_id)
            .with_aad(wire.head.clone());
        if let Some(foreign) = &foreign {
            ctx = ctx.with_foreign(foreign.clone());
        }

        Ok(Self {
            head,
            head_bytes: wire.head,
            payload: SignedData::from_wire(signed, ctx),
            shape,
            keys,
            foreign,
            wire: OnceLock::from(Bytes::copy_from_slice(raw)),
            cid: OnceLock::new(),
        })
    }

    /// Parse only the head, for routing. Nothing is verified.
    pub fn deserialize_head_only(raw: &[u8]) -> Result<HeadInfo> {
        if raw.is_empty() {
            return Err(format("empty message"));
        }
        let wire: MessageWire = from_canonical_bytes(raw).map_err(|e| format(e.to_string()))?;
        Ok(HeadInfo {
            head: MessageHead::from_bytes(&wire.head)?,
            raw: Bytes::copy_from_slice(raw),
            cid: OnceLock::new(),
        })
    }

    /// Wire bytes, produced once.
    pub fn serialize(&self) -> Result<&Bytes> {
        if let Some(wire) = self.wire.get() {
            return Ok(wire);
        }
        let payload = EnvelopeWire::Signed(self.payload.to_wire(&self.head_bytes)?).encode()?;
        let bytes = to_canonical_bytes(&MessageWire {
            head: self.head_bytes.clone(),
            payload: payload.into(),
        })?;
        Ok(self.wire.get_or_init(|| bytes.into()))
    }

    /// CID of the wire bytes.
    pub fn hash(&self) -> Result<Cid> {
        if let Some(cid) = self.cid.get() {
            return Ok(*cid);
        }
        let cid = Cid::compute(CONTRACT_DATA_CODEC, self.serialize()?);
        Ok(*self.cid.get_or_init(|| cid))
    }

    /// The contract this message belongs to. For contract creation this is
    /// the message's own CID.
    pub fn contract_id(&self) -> Result<ContractId> {
        match self.head.contract_id {
            Some(id) => Ok(id),
            None => Ok(ContractId(self.hash()?)),
        }
    }

    pub fn is_first_message(&self) -> bool {
        self.head.is_first()
    }

    /// Whether applying this message can alter the key table.
    pub fn is_key_op(&self) -> bool {
        self.shape.is_key_op()
    }

    pub fn head(&self) -> &MessageHead {
        &self.head
    }

    pub fn head_bytes(&self) -> &[u8] {
        &self.head_bytes
    }

    pub fn height(&self) -> u64 {
        self.head.height
    }

    pub fn shape(&self) -> &OpShape {
        &self.shape
    }

    pub fn payload(&self) -> &SignedData<Operation> {
        &self.payload
    }

    /// The operation, verifying the payload signature on first access.
    pub fn operation(&self) -> Result<&Operation> {
        Ok(self.payload.value()?)
    }

    /// Table the payload signature is checked against. For contract
    /// creation this is the bootstrap table.
    pub fn keys(&self) -> &Arc<KeyTable> {
        &self.keys
    }

    /// The signing key's record and, when it belongs to another contract,
    /// that contract's table.
    ///
    /// Fails with [`ProtocolError::MissingState`] while the other contract
    /// is unknown.
    pub fn signer(&self) -> Result<MessageSigner> {
        let key_id = *self.payload.key_id();
        let home = self.contract_id()?;
        match self.payload.meta().signing_contract_id {
            Some(other) if other != home => {
                let (keys, height) = self
                    .foreign
                    .as_ref()
                    .and_then(|f| f.snapshot(&other))
                    .ok_or(ProtocolError::MissingState(other))?;
                let record = keys
                    .get(&key_id)
                    .ok_or(EnvelopeError::SignatureKeyNotFound(key_id))?
                    .record
                    .clone();
                Ok(MessageSigner {
                    record,
                    foreign: Some(ForeignSigner {
                        contract: other,
                        keys,
                        height,
                    }),
                })
            }
            _ => {
                let key = self
                    .keys
                    .get(&key_id)
                    .ok_or(EnvelopeError::SignatureKeyNotFound(key_id))?;
                Ok(MessageSigner {
                    record: key.record.clone(),
                    foreign: None,
                })
            }
        }
    }

    pub fn describe(&self) -> String {
        let contract = self
            .contract_id()
            .map(|c| c.to_string())
            .unwrap_or_else(|_| "?".into());
        let cid = self.hash().map(|c| c.to_string()).unwrap_or_else(|_| "?".into());
        describe(&self.head, &contract, &cid)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("head", &self.head)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

fn describe(head: &MessageHead, contract: &str, cid: &str) -> String {
    format!("{} h={} c={contract} m={cid}", head.op_type, head.height)
}

/// Build the key table a contract-creation message is verified against.
///
/// Plain records come first; encrypted records are then read against that
/// table, and dropped with a warning if they cannot be.
fn bootstrap_table(
    op_bytes: &[u8],
    head_bytes: &Bytes,
    contract_id: ContractId,
    secrets: &Arc<dyn SecretKeys>,
) -> Result<Arc<KeyTable>> {
    let open = |keys: Arc<KeyTable>| -> Result<Vec<Envelope<KeyRecord>>> {
        let ctx = OpenContext::new(keys, 0, secrets.clone())
            .for_contract(contract_id)
            .with_aad(head_bytes.clone());
        match Operation::open(op_bytes, &ctx)? {
            Op::Contract(create) => Ok(create.keys),
            _ => Err(structural("the first message must create the contract")),
        }
    };

    let plain: Vec<KeyRecord> = open(Arc::new(KeyTable::default()))?
        .into_iter()
        .filter_map(|k| match k {
            Envelope::Plain(record) => Some(record),
            _ => None,
        })
        .collect();
    let first = Arc::new(KeyTable::bootstrap(plain, 0)?);

    let mut records = Vec::new();
    for envelope in open(first)? {
        match envelope.value() {
            Ok(record) => records.push(record.clone()),
            Err(e) => warn!(contract = %contract_id, error = %e, "skipping unreadable key in contract creation"),
        }
    }
    Ok(Arc::new(KeyTable::bootstrap(records, 0)?))
}

/// Routing information read from a message head.
pub struct HeadInfo {
    head: MessageHead,
    raw: Bytes,
    cid: OnceLock<Cid>,
}

impl HeadInfo {
    pub fn head(&self) -> &MessageHead {
        &self.head
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn cid(&self) -> Cid {
        *self
            .cid
            .get_or_init(|| Cid::compute(CONTRACT_DATA_CODEC, &self.raw))
    }

    pub fn contract_id(&self) -> ContractId {
        self.head.contract_id.unwrap_or_else(|| ContractId(self.cid()))
    }

    pub fn is_first(&self) -> bool {
        self.head.is_first()
    }

    /// `"<op> h=<height> c=<contract> m=<cid>"`.
    pub fn describe(&self) -> String {
        describe(
            &self.head,
            &self.contract_id().to_string(),
            &self.cid().to_string(),
        )
    }
}

impl fmt::Debug for HeadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
