//! Contract state: the key and version management portion derived by replay.

use std::collections::BTreeMap;
use std::sync::Arc;

use ciborium::value::Value;

use oplog_core::{Cid, ContractId};
use oplog_keys::{KeyTable, SignedWire};

/// Where a received key request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Shared,
    Denied,
}

/// A key request seen in this contract's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequestEntry {
    pub requester: ContractId,
    /// Requester height at which the reply key was added.
    pub requester_height: u64,
    pub request: String,
    pub reference: Option<String>,
    pub reply_with: SignedWire,
    pub status: RequestStatus,
}

/// State of one contract after applying its log up to `height`.
///
/// Snapshots are values: applying a message produces a new state and
/// never touches the prior one.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractState {
    pub contract_id: ContractId,
    pub contract_type: String,
    pub height: u64,
    /// CID of the last applied message.
    pub head: Cid,
    /// CID of the last applied message that could alter the key table.
    pub previous_key_op: Option<Cid>,
    pub keys: Arc<KeyTable>,
    pub props: BTreeMap<String, Value>,
    /// Received key requests, by request message CID.
    pub key_requests: BTreeMap<Cid, KeyRequestEntry>,
}

impl ContractState {
    /// State right after contract creation.
    pub fn genesis(contract_id: ContractId, contract_type: impl Into<String>, keys: Arc<KeyTable>) -> Self {
        Self {
            contract_id,
            contract_type: contract_type.into(),
            height: 0,
            head: contract_id.0,
            previous_key_op: Some(contract_id.0),
            keys,
            props: BTreeMap::new(),
            key_requests: BTreeMap::new(),
        }
    }

    /// Mutable access to the key table, cloning it if it is shared.
    pub fn keys_mut(&mut self) -> &mut KeyTable {
        Arc::make_mut(&mut self.keys)
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Requests from `requester` that have not been answered.
    pub fn pending_requests<'a>(
        &'a self,
        requester: &'a ContractId,
    ) -> impl Iterator<Item = (&'a Cid, &'a KeyRequestEntry)> + 'a {
        self.key_requests
            .iter()
            .filter(move |(_, e)| &e.requester == requester && e.status == RequestStatus::Pending)
    }

    /// The latest request from `requester` with this request string and reference.
    pub fn find_request(
        &self,
        requester: &ContractId,
        request: &str,
        reference: Option<&str>,
    ) -> Option<(&Cid, &KeyRequestEntry)> {
        self.key_requests
            .iter()
            .filter(|(_, e)| {
                &e.requester == requester
                    && e.request == request
                    && e.reference.as_deref() == reference
            })
            .max_by_key(|(_, e)| e.requester_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oplog_core::{SecretKey, CONTRACT_DATA_CODEC};
    use oplog_keys::{KeyPurpose, KeyRecord};

    #[test]
    fn test_genesis_points_at_itself() {
        let id = ContractId(Cid::compute(CONTRACT_DATA_CODEC, b"genesis"));
        let state = ContractState::genesis(id, "chat", Arc::new(KeyTable::default()));
        assert_eq!(state.head, id.0);
        assert_eq!(state.previous_key_op, Some(id.0));
        assert_eq!(state.height, 0);
    }

    #[test]
    fn test_keys_mut_copies_shared_table() {
        let id = ContractId(Cid::compute(CONTRACT_DATA_CODEC, b"genesis"));
        let prior = ContractState::genesis(id, "chat", Arc::new(KeyTable::default()));
        let mut draft = prior.clone();

        let key = SecretKey::generate_signing();
        draft
            .keys_mut()
            .insert(KeyRecord::new("k", &key.public(), [KeyPurpose::Sig]), 1)
            .unwrap();

        assert!(prior.keys.is_empty());
        assert_eq!(draft.keys.len(), 1);
    }
}
