//! Test fixtures and helpers.
//!
//! [`TestLog`] replays a single contract synchronously with a
//! [`Processor`]. [`TestNode`] is one participant of a multi-contract
//! setup: a key ring, a [`Contracts`] and an outbox; [`deliver`] moves
//! published messages between nodes.

use std::sync::Arc;

use bytes::Bytes;

use oplog::{
    Applied, ContractState, Contracts, IngestOutcome, MemoryOutbox, Message, MessageParams, Operation,
    Outbox, OutgoingMessage, Processor, ProtocolError, ReplayConfig, Result,
};
use oplog_core::{Blake3Hash, ContractId, KeyId, SecretKey};
use oplog_keys::{Envelope, KeyPurpose, KeyRecord, KeyRing, KeyTable, SecretKeys};

/// Deterministic seed for key number `tag` of party `party`.
///
/// Distinct `(party, tag)` pairs stay distinct after X25519 clamping.
pub fn seed(party: u8, tag: u8) -> [u8; 32] {
    Blake3Hash::hash_parts(&[b"oplog-testkit-seed", &[party], &[tag]]).0
}

/// A key created shareable by a fixture.
#[derive(Debug, Clone)]
pub struct SharedKey {
    pub name: String,
    pub id: KeyId,
    /// Serialized secret.
    pub secret: String,
}

/// Creation keys of party `party`.
///
/// Always a ring-0 signing key `sig` and a ring-0 encryption key `enc`,
/// followed by one shareable encryption key per name in `shared` whose
/// private half is encrypted to `enc`.
pub fn creation_keys(party: u8, shared: &[&str]) -> Result<(Vec<SecretKey>, Vec<KeyRecord>)> {
    let sig = SecretKey::signing_from_seed(seed(party, 0));
    let enc = SecretKey::encryption_from_seed(seed(party, 1));
    let base = vec![
        KeyRecord::new("sig", &sig.public(), [KeyPurpose::Sig]),
        KeyRecord::new("enc", &enc.public(), [KeyPurpose::Enc]),
    ];
    let table = KeyTable::bootstrap(base.clone(), 0)?;

    let mut secrets = vec![sig, enc];
    let mut records = base;
    for (i, name) in shared.iter().enumerate() {
        let secret = SecretKey::encryption_from_seed(seed(party, 2 + i as u8));
        let record = KeyRecord::new(*name, &secret.public(), [KeyPurpose::Enc]).with_private(
            &secret,
            &table,
            records[1].id,
            true,
        )?;
        secrets.push(secret);
        records.push(record);
    }
    Ok((secrets, records))
}

/// Replay a whole log from scratch.
pub fn replay(log: &[Bytes], secrets: Arc<dyn SecretKeys>) -> Result<ContractState> {
    let processor = Processor::default();
    let mut state: Option<ContractState> = None;
    for raw in log {
        let message = Message::deserialize(raw, secrets.clone(), state.as_ref(), None)?;
        state = Some(processor.apply(state.as_ref(), &message)?.state);
    }
    state.ok_or_else(|| ProtocolError::Format("empty log".into()))
}

/// A single contract replayed in memory.
pub struct TestLog {
    pub ring: Arc<KeyRing>,
    pub contract: ContractId,
    /// Ring-0 signing key `sig`.
    pub signer: KeyId,
    pub state: ContractState,
    /// Every applied message, genesis first.
    pub log: Vec<Bytes>,
    processor: Processor,
}

impl TestLog {
    /// A contract with the base keys of `party` plus `extra` keys.
    pub fn new(party: u8, extra: Vec<(SecretKey, KeyRecord)>) -> Result<Self> {
        let (secrets, mut records) = creation_keys(party, &[])?;
        let ring = Arc::new(KeyRing::new());
        for secret in secrets {
            ring.insert(secret);
        }
        for (secret, record) in extra {
            ring.insert(secret);
            records.push(record);
        }
        let signer = records[0].id;

        let genesis = Message::create_contract(
            "test",
            records.into_iter().map(Envelope::Plain).collect(),
            signer,
            ring.as_ref(),
        )?;
        let processor = Processor::default();
        let state = processor.apply(None, &genesis)?.state;
        Ok(Self {
            contract: state.contract_id,
            log: vec![genesis.serialize()?.clone()],
            ring,
            signer,
            state,
            processor,
        })
    }

    /// Build the next message without applying it.
    pub fn sign(&self, signer: KeyId, op: Operation) -> Result<Bytes> {
        let message = Message::sign(
            MessageParams::next(&self.state),
            op,
            &self.state.keys,
            signer,
            self.ring.as_ref(),
        )?;
        Ok(message.serialize()?.clone())
    }

    /// Parse and apply `raw`, committing only on success.
    pub fn apply(&mut self, raw: &Bytes) -> Result<Applied> {
        let message = Message::deserialize(raw, self.ring.clone(), Some(&self.state), None)?;
        let applied = self.processor.apply(Some(&self.state), &message)?;
        self.state = applied.state.clone();
        self.log.push(raw.clone());
        Ok(applied)
    }

    /// Sign and apply in one step.
    pub fn append(&mut self, signer: KeyId, op: Operation) -> Result<Applied> {
        let raw = self.sign(signer, op)?;
        self.apply(&raw)
    }
}

/// A contract created through a [`TestNode`].
#[derive(Debug, Clone)]
pub struct TestContract {
    pub id: ContractId,
    /// Ring-0 signing key `sig`.
    pub signer: KeyId,
    /// Ring-0 encryption key `enc`.
    pub enc: KeyId,
    pub shared: Vec<SharedKey>,
    pub genesis: Bytes,
}

/// One participant: keys, replayed contracts and an outbox.
pub struct TestNode {
    pub ring: Arc<KeyRing>,
    pub outbox: Arc<MemoryOutbox>,
    pub contracts: Contracts,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_config(ReplayConfig::default())
    }

    pub fn with_config(config: ReplayConfig) -> Self {
        let ring = Arc::new(KeyRing::new());
        let outbox = Arc::new(MemoryOutbox::new());
        let contracts = Contracts::new(config, ring.clone()).with_outbox(outbox.clone());
        Self {
            ring,
            outbox,
            contracts,
        }
    }

    /// Create a contract owned by this node and publish its genesis.
    pub async fn create_contract(&self, party: u8, contract_type: &str, shared: &[&str]) -> Result<TestContract> {
        let (secrets, records) = creation_keys(party, shared)?;
        let signer = records[0].id;
        let enc = records[1].id;
        let shared = secrets[2..]
            .iter()
            .zip(&records[2..])
            .map(|(secret, record)| SharedKey {
                name: record.name.clone(),
                id: record.id,
                secret: secret.serialize_secret(),
            })
            .collect();
        self.ring.insert(secrets[0].clone());
        self.ring.insert(secrets[1].clone());

        let genesis = Message::create_contract(
            contract_type,
            records.into_iter().map(Envelope::Plain).collect(),
            signer,
            self.ring.as_ref(),
        )?;
        let id = genesis.contract_id()?;
        let bytes = self.publish(id, &genesis).await?;
        self.contracts.ingest(bytes.clone()).await?;
        Ok(TestContract {
            id,
            signer,
            enc,
            shared,
            genesis: bytes,
        })
    }

    /// Sign the next message of `contract`, apply it locally and publish it.
    pub async fn append(&self, contract: &ContractId, signer: KeyId, op: Operation) -> Result<IngestOutcome> {
        let state = self
            .contracts
            .state(contract)
            .ok_or(ProtocolError::MissingState(*contract))?;
        let message = Message::sign(MessageParams::next(&state), op, &state.keys, signer, self.ring.as_ref())?;
        let bytes = self.publish(*contract, &message).await?;
        self.contracts.ingest(bytes).await
    }

    async fn publish(&self, contract_id: ContractId, message: &Message) -> Result<Bytes> {
        let bytes = message.serialize()?.clone();
        self.outbox
            .publish(vec![OutgoingMessage {
                contract_id,
                cid: message.hash()?,
                bytes: bytes.clone(),
            }])
            .await?;
        Ok(bytes)
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Ingest everything the nodes have published into every node, until no
/// outbox has anything left.
pub async fn deliver(nodes: &[&TestNode]) -> Result<Vec<IngestOutcome>> {
    let mut outcomes = Vec::new();
    loop {
        let mut batches = Vec::new();
        for node in nodes {
            batches.extend(node.outbox.take().await);
        }
        if batches.is_empty() {
            return Ok(outcomes);
        }
        for message in batches.into_iter().flatten() {
            for node in nodes {
                outcomes.push(node.contracts.ingest(message.bytes.clone()).await?);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciborium::value::Value;
    use oplog::{Op, PropSet};

    #[test]
    fn test_creation_keys_deterministic() {
        let (_, a) = creation_keys(7, &["data"]).unwrap();
        let (_, b) = creation_keys(7, &["data"]).unwrap();
        let (_, c) = creation_keys(8, &["data"]).unwrap();

        let ids = |records: &[KeyRecord]| records.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
        assert_ne!(ids(&a), ids(&c));
        assert!(a[2].private.as_ref().unwrap().shareable);
    }

    #[test]
    fn test_shared_keys_never_collide_with_base_keys() {
        for party in 0..8 {
            let (_, records) = creation_keys(party, &["data", "archive", "extra"]).unwrap();
            let ids: std::collections::BTreeSet<_> = records.iter().map(|r| r.id).collect();
            assert_eq!(ids.len(), records.len(), "party {party}");
        }
    }

    #[test]
    fn test_log_append_and_replay() {
        let mut log = TestLog::new(1, Vec::new()).unwrap();
        let signer = log.signer;
        log.append(
            signer,
            Op::PropSet(PropSet {
                key: "k".into(),
                value: Value::Bool(true),
            }),
        )
        .unwrap();

        assert_eq!(log.state.height, 1);
        let replayed = replay(&log.log, log.ring.clone()).unwrap();
        assert_eq!(replayed, log.state);
    }

    #[tokio::test]
    async fn test_deliver_between_nodes() {
        let alice = TestNode::new();
        let bob = TestNode::new();
        let contract = alice.create_contract(1, "notes", &[]).await.unwrap();
        assert!(bob.contracts.state(&contract.id).is_none());

        let outcomes = deliver(&[&alice, &bob]).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], IngestOutcome::Stale { .. }));
        assert!(bob.contracts.state(&contract.id).is_some());
        assert!(deliver(&[&alice, &bob]).await.unwrap().is_empty());
    }
}
