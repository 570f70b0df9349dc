//! External collaborators.
//!
//! The core never fetches keys, loads state or publishes messages itself.
//! These traits are the seams to whatever does; the in-memory versions are
//! for tests and single-process use.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use oplog_core::{Cid, ContractId, KeyId};
use oplog_keys::KeyMaterial;

use crate::state::ContractState;

/// Supplies secret keys that are not in the local key ring.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Look up the secret for `id`. `Ok(None)` means nobody has it.
    async fn fetch(&self, id: &KeyId) -> anyhow::Result<Option<KeyMaterial>>;
}

/// Supplies contract state snapshots the caller already holds.
#[async_trait]
pub trait StateSource: Send + Sync {
    async fn state(&self, contract: &ContractId) -> anyhow::Result<Option<ContractState>>;
}

/// A message ready to be appended to a contract log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub contract_id: ContractId,
    pub cid: Cid,
    pub bytes: Bytes,
}

/// Publishes outgoing messages.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Publish a batch. Observers see either all of it or none of it.
    async fn publish(&self, batch: Vec<OutgoingMessage>) -> anyhow::Result<()>;
}

/// A fetcher that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFetcher;

#[async_trait]
impl KeyFetcher for NoFetcher {
    async fn fetch(&self, _id: &KeyId) -> anyhow::Result<Option<KeyMaterial>> {
        Ok(None)
    }
}

/// Keys held in memory, handed out on request.
#[derive(Debug, Default)]
pub struct MemoryKeyFetcher {
    keys: Mutex<HashMap<KeyId, KeyMaterial>>,
}

impl MemoryKeyFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: KeyId, material: KeyMaterial) {
        self.keys.lock().await.insert(id, material);
    }
}

#[async_trait]
impl KeyFetcher for MemoryKeyFetcher {
    async fn fetch(&self, id: &KeyId) -> anyhow::Result<Option<KeyMaterial>> {
        Ok(self.keys.lock().await.get(id).cloned())
    }
}

/// State snapshots held in memory.
#[derive(Debug, Default)]
pub struct MemoryStateSource {
    states: Mutex<HashMap<ContractId, ContractState>>,
}

impl MemoryStateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, state: ContractState) {
        self.states.lock().await.insert(state.contract_id, state);
    }
}

#[async_trait]
impl StateSource for MemoryStateSource {
    async fn state(&self, contract: &ContractId) -> anyhow::Result<Option<ContractState>> {
        Ok(self.states.lock().await.get(contract).cloned())
    }
}

/// Collects published batches.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    batches: Mutex<Vec<Vec<OutgoingMessage>>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything published so far, batch by batch.
    pub async fn take(&self) -> Vec<Vec<OutgoingMessage>> {
        std::mem::take(&mut *self.batches.lock().await)
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn publish(&self, batch: Vec<OutgoingMessage>) -> anyhow::Result<()> {
        if batch.is_empty() {
            anyhow::bail!("refusing to publish an empty batch");
        }
        self.batches.lock().await.push(batch);
        Ok(())
    }
}
