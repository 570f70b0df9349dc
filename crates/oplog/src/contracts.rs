//! The outer boundary: ingesting raw messages for many contracts.
//!
//! Messages of one contract are applied strictly in order, one at a time,
//! behind a per-contract async mutex. Different contracts proceed
//! independently. Each message is applied copy-then-commit: the stored
//! snapshot is only replaced when the whole message applied.
//!
//! Failure handling follows the error taxonomy:
//!
//! - recoverable errors (missing decryption key, missing state, a missing
//!   predecessor, collaborator failures) park the message; later messages of
//!   the contract park behind it until [`Contracts::retry`] succeeds, while
//!   earlier ones still apply;
//! - format, signature, permission and structural errors quarantine the
//!   contract until [`Contracts::lift_quarantine`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use oplog_core::{Cid, ContractId, KeyId};
use oplog_keys::{ForeignTables, KeyRing, KeyTable, SecretKeys};

use crate::collab::{KeyFetcher, MemoryOutbox, MemoryStateSource, NoFetcher, Outbox, OutgoingMessage, StateSource};
use crate::config::ReplayConfig;
use crate::delegation::{self, DelegationStatus, ShareRequest};
use crate::error::{ProtocolError, Result};
use crate::message::{HeadInfo, Message};
use crate::op::KeyShare;
use crate::process::{ActionOutcome, Processor, SideEffect};
use crate::state::ContractState;

/// Latest committed state of every known contract.
#[derive(Debug, Default)]
pub struct Snapshots {
    states: RwLock<HashMap<ContractId, Arc<ContractState>>>,
}

impl Snapshots {
    pub fn get(&self, contract: &ContractId) -> Option<Arc<ContractState>> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(contract)
            .cloned()
    }

    pub fn insert(&self, state: Arc<ContractState>) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.contract_id, state);
    }
}

impl ForeignTables for Snapshots {
    fn snapshot(&self, contract: &ContractId) -> Option<(Arc<KeyTable>, u64)> {
        self.get(contract).map(|s| (s.keys.clone(), s.height))
    }
}

/// What happened to an ingested message.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Applied {
        cid: Cid,
        height: u64,
        actions: Vec<ActionOutcome>,
        effects: Vec<SideEffect>,
    },
    /// At or below the contract's current height. Ignored.
    Stale { cid: Cid },
    /// Kept for a later [`Contracts::retry`].
    Parked { cid: Cid, reason: String },
}

#[derive(Default)]
struct Slot {
    quarantined: Option<String>,
    parked: VecDeque<HeadInfo>,
    /// Applied messages with encrypted actions still waiting for a key.
    deferred: Vec<Arc<Message>>,
}

/// Replays contract logs and drives key delegation.
pub struct Contracts {
    config: ReplayConfig,
    processor: Processor,
    ring: Arc<KeyRing>,
    snapshots: Arc<Snapshots>,
    slots: StdMutex<HashMap<ContractId, Arc<Mutex<Slot>>>>,
    fetcher: Arc<dyn KeyFetcher>,
    source: Arc<dyn StateSource>,
    outbox: Arc<dyn Outbox>,
}

fn outgoing(contract_id: ContractId, message: &Message) -> Result<OutgoingMessage> {
    Ok(OutgoingMessage {
        contract_id,
        cid: message.hash()?,
        bytes: message.serialize()?.clone(),
    })
}

fn merge(actions: Vec<ActionOutcome>, resolved: Vec<ActionOutcome>) -> Vec<ActionOutcome> {
    actions
        .into_iter()
        .map(|action| match action {
            ActionOutcome::Deferred { index, .. } => resolved
                .iter()
                .find(|r| matches!(r, ActionOutcome::Resolved { index: i, .. } if *i == index))
                .cloned()
                .unwrap_or(action),
            other => other,
        })
        .collect()
}

impl Contracts {
    pub fn new(config: ReplayConfig, ring: Arc<KeyRing>) -> Self {
        Self {
            processor: Processor::new(config.processor.clone()),
            config,
            ring,
            snapshots: Arc::new(Snapshots::default()),
            slots: StdMutex::new(HashMap::new()),
            fetcher: Arc::new(NoFetcher),
            source: Arc::new(MemoryStateSource::new()),
            outbox: Arc::new(MemoryOutbox::new()),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn KeyFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_state_source(mut self, source: Arc<dyn StateSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = outbox;
        self
    }

    pub fn ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    /// Latest committed state of `contract`.
    pub fn state(&self, contract: &ContractId) -> Option<Arc<ContractState>> {
        self.snapshots.get(contract)
    }

    fn slot(&self, contract: ContractId) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(contract).or_default().clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ingestion
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply the next raw message of some contract.
    pub async fn ingest(&self, raw: impl Into<Bytes>) -> Result<IngestOutcome> {
        let raw = raw.into();
        let info = Message::deserialize_head_only(&raw)?;
        let contract = info.contract_id();
        let slot = self.slot(contract);
        let mut slot = slot.lock().await;

        if let Some(reason) = &slot.quarantined {
            return Err(ProtocolError::Quarantined {
                contract,
                reason: reason.clone(),
            });
        }
        let height = info.head().height;
        if slot.parked.iter().any(|p| p.head().height <= height) {
            debug!(message = %info.describe(), "parking behind earlier message");
            let cid = info.cid();
            slot.parked.push_back(info);
            return Ok(IngestOutcome::Parked {
                cid,
                reason: "waiting behind a parked message".into(),
            });
        }
        self.process(&mut slot, contract, info).await
    }

    /// Re-attempt parked messages of `contract` in height order.
    ///
    /// Stops at the first message that still cannot be applied.
    pub async fn retry(&self, contract: &ContractId) -> Result<Vec<IngestOutcome>> {
        let slot = self.slot(*contract);
        let mut slot = slot.lock().await;
        if let Some(reason) = &slot.quarantined {
            return Err(ProtocolError::Quarantined {
                contract: *contract,
                reason: reason.clone(),
            });
        }

        let mut parked: Vec<HeadInfo> = slot.parked.drain(..).collect();
        parked.sort_by_key(|info| info.head().height);

        let mut outcomes = Vec::new();
        let mut rest = parked.into_iter();
        while let Some(info) = rest.next() {
            match self.process(&mut slot, *contract, info).await {
                Ok(outcome) => {
                    let stuck = matches!(outcome, IngestOutcome::Parked { .. });
                    outcomes.push(outcome);
                    if stuck {
                        slot.parked.extend(rest);
                        break;
                    }
                }
                Err(e) => {
                    slot.parked.extend(rest);
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }

    /// Read deferred encrypted actions of `contract` again, fetching
    /// missing keys first.
    ///
    /// A message whose actions turn out to be invalid once readable is
    /// dropped.
    pub async fn retry_deferred(&self, contract: &ContractId) -> Vec<ActionOutcome> {
        let slot = self.slot(*contract);
        let mut slot = slot.lock().await;
        let pending = std::mem::take(&mut slot.deferred);

        let mut resolved = Vec::new();
        for message in pending {
            let actions = match self.processor.resolve_actions(&message) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!(message = %message.describe(), error = %e, "dropping deferred actions");
                    continue;
                }
            };
            let actions = self.resolve_deferred(&message, actions).await;
            if actions.iter().any(ActionOutcome::is_deferred) {
                slot.deferred.push(message.clone());
            }
            resolved.extend(actions.into_iter().filter(|a| !a.is_deferred()));
        }
        resolved
    }

    /// Number of messages of `contract` waiting for [`Contracts::retry`].
    pub async fn parked(&self, contract: &ContractId) -> usize {
        self.slot(*contract).lock().await.parked.len()
    }

    pub async fn quarantined(&self, contract: &ContractId) -> Option<String> {
        self.slot(*contract).lock().await.quarantined.clone()
    }

    /// Resume processing of a quarantined contract.
    pub async fn lift_quarantine(&self, contract: &ContractId) -> bool {
        let lifted = self.slot(*contract).lock().await.quarantined.take().is_some();
        if lifted {
            info!(%contract, "quarantine lifted");
        }
        lifted
    }

    async fn process(&self, slot: &mut Slot, contract: ContractId, info: HeadInfo) -> Result<IngestOutcome> {
        match self.try_apply(slot, contract, &info).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_recoverable() => {
                warn!(message = %info.describe(), error = %e, "parking message");
                let cid = info.cid();
                slot.parked.push_back(info);
                Ok(IngestOutcome::Parked {
                    cid,
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                if e.is_fatal_for_contract() && self.config.processor.quarantine_on_fatal {
                    error!(message = %info.describe(), error = %e, "quarantining contract");
                    slot.quarantined = Some(e.to_string());
                } else {
                    warn!(message = %info.describe(), error = %e, "rejected message");
                }
                Err(e)
            }
        }
    }

    async fn try_apply(&self, slot: &mut Slot, contract: ContractId, info: &HeadInfo) -> Result<IngestOutcome> {
        let cid = info.cid();
        let prior = if info.is_first() {
            if self.snapshots.get(&contract).is_some() {
                return Ok(IngestOutcome::Stale { cid });
            }
            None
        } else {
            let prior = self.prior_state(&contract).await?;
            if info.head().height <= prior.height {
                debug!(message = %info.describe(), height = prior.height, "ignoring stale message");
                return Ok(IngestOutcome::Stale { cid });
            }
            if info.head().height > prior.height + 1 {
                return Err(ProtocolError::OutOfOrder {
                    contract,
                    expected: prior.height + 1,
                    got: info.head().height,
                });
            }
            Some(prior)
        };

        let foreign: Arc<dyn ForeignTables> = self.snapshots.clone();
        let secrets: Arc<dyn SecretKeys> = self.ring.clone();
        let message = Message::deserialize(info.raw(), secrets, prior.as_deref(), Some(foreign))?;

        let applied = match self.processor.apply(prior.as_deref(), &message) {
            Ok(applied) => applied,
            Err(e) => match e.missing_key() {
                Some(key) if self.ensure_key(&key).await? => {
                    self.processor.apply(prior.as_deref(), &message)?
                }
                _ => return Err(e),
            },
        };

        let actions = if applied.has_deferred() {
            self.resolve_deferred(&message, applied.actions).await
        } else {
            applied.actions
        };

        let state = Arc::new(applied.state);
        self.snapshots.insert(state.clone());
        if actions.iter().any(ActionOutcome::is_deferred) {
            slot.deferred.push(Arc::new(message));
        }
        if self.config.processor.import_shared_keys {
            self.import_shares(&state, &applied.shares);
        }

        Ok(IngestOutcome::Applied {
            cid,
            height: state.height,
            actions,
            effects: applied.effects,
        })
    }

    async fn prior_state(&self, contract: &ContractId) -> Result<Arc<ContractState>> {
        if let Some(state) = self.snapshots.get(contract) {
            return Ok(state);
        }
        match self.source.state(contract).await? {
            Some(state) => {
                let state = Arc::new(state);
                self.snapshots.insert(state.clone());
                Ok(state)
            }
            None => Err(ProtocolError::MissingState(*contract)),
        }
    }

    /// Make the secret for `key` available locally. Returns whether it is.
    async fn ensure_key(&self, key: &KeyId) -> Result<bool> {
        if self.ring.contains(key) {
            return Ok(true);
        }
        let Some(material) = self.fetcher.fetch(key).await? else {
            return Ok(false);
        };
        let secret = material.into_secret()?;
        if secret.id() != *key {
            warn!(%key, fetched = %secret.id(), "fetched key does not match");
            return Ok(false);
        }
        self.ring.insert(secret);
        info!(%key, "fetched missing key");
        Ok(true)
    }

    async fn resolve_deferred(&self, message: &Message, actions: Vec<ActionOutcome>) -> Vec<ActionOutcome> {
        if !self.config.retry_deferred {
            return actions;
        }
        let missing: BTreeSet<KeyId> = actions
            .iter()
            .filter_map(|a| match a {
                ActionOutcome::Deferred { key, .. } => Some(*key),
                _ => None,
            })
            .collect();

        let mut available = false;
        for key in &missing {
            match self.ensure_key(key).await {
                Ok(found) => available |= found,
                Err(e) => warn!(%key, error = %e, "key fetch failed"),
            }
        }
        if !available {
            return actions;
        }
        match self.processor.resolve_actions(message) {
            Ok(resolved) => merge(actions, resolved),
            Err(e) => {
                warn!(message = %message.describe(), error = %e, "deferred actions still unreadable");
                actions
            }
        }
    }

    /// Import shares encrypted to a reply key held locally.
    fn import_shares(&self, state: &ContractState, shares: &[KeyShare]) {
        for share in shares {
            if !self.ring.contains(&share.keys.key_id) {
                continue;
            }
            let Some(requester) = self.snapshots.get(&share.contract_id) else {
                debug!(recipient = %share.contract_id, "share for an unknown contract");
                continue;
            };
            let owner = share.foreign_contract_id.unwrap_or(state.contract_id);
            let Some(owner) = self.snapshots.get(&owner) else {
                debug!(%owner, "share of keys from an unknown contract");
                continue;
            };
            if let Err(e) = delegation::import_key_share(share, &requester, &owner, &self.ring, self.ring.clone()) {
                warn!(contract = %state.contract_id, error = %e, "could not import shared keys");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delegation
    // ─────────────────────────────────────────────────────────────────────────

    fn known(&self, contract: &ContractId) -> Result<Arc<ContractState>> {
        self.snapshots
            .get(contract)
            .ok_or(ProtocolError::MissingState(*contract))
    }

    /// Ask `target` for keys on behalf of `requester`.
    ///
    /// Publishes the reply key addition and the request as one batch.
    /// Returns the reply key, or `None` if the same request is outstanding.
    pub async fn request_keys(
        &self,
        requester: &ContractId,
        target: &ContractId,
        signer: KeyId,
        request: &str,
        reference: Option<&str>,
    ) -> Result<Option<KeyId>> {
        let requester_state = self.known(requester)?;
        let target_state = self.known(target)?;
        let Some(messages) =
            delegation::key_request(&requester_state, &target_state, signer, request, reference, &self.ring)?
        else {
            return Ok(None);
        };

        let batch = vec![
            outgoing(*requester, &messages.key_add)?,
            outgoing(*target, &messages.key_request)?,
        ];
        self.outbox.publish(batch).await?;
        Ok(Some(messages.reply_key))
    }

    /// Answer the key request `request` seen in `target`'s log.
    pub async fn respond(
        &self,
        target: &ContractId,
        request: Cid,
        signer: KeyId,
        approve: bool,
        owner: Option<&ContractId>,
    ) -> Result<Cid> {
        let target_state = self.known(target)?;
        let requester = target_state
            .key_requests
            .get(&request)
            .map(|e| e.requester)
            .ok_or_else(|| ProtocolError::Structural(format!("unknown key request {request}")))?;
        let requester_state = self.known(&requester)?;
        let owner_state = owner.map(|o| self.known(o)).transpose()?;

        let message = delegation::respond_to_key_request(
            ShareRequest {
                target: &target_state,
                requester: &requester_state,
                request,
                signer,
                owner: owner_state.as_deref(),
            },
            approve,
            self.ring.clone(),
        )?;
        let out = outgoing(*target, &message)?;
        let cid = out.cid;
        self.outbox.publish(vec![out]).await?;
        Ok(cid)
    }

    /// Revoke the reply key of a finished request.
    pub async fn complete(
        &self,
        requester: &ContractId,
        target: &ContractId,
        request: &str,
        reference: Option<&str>,
        signer: KeyId,
    ) -> Result<Option<Cid>> {
        let requester_state = self.known(requester)?;
        let Some(message) = delegation::complete_key_request(
            &requester_state,
            target,
            request,
            reference,
            signer,
            self.ring.as_ref(),
        )?
        else {
            return Ok(None);
        };
        let out = outgoing(*requester, &message)?;
        let cid = out.cid;
        self.outbox.publish(vec![out]).await?;
        Ok(Some(cid))
    }

    pub fn delegation_status(
        &self,
        requester: &ContractId,
        target: &ContractId,
        request: &str,
        reference: Option<&str>,
    ) -> Option<DelegationStatus> {
        let requester = self.snapshots.get(requester)?;
        let target = self.snapshots.get(target)?;
        Some(delegation::status(&requester, &target, request, reference))
    }
}
