//! Applying messages to contract state.
//!
//! The processor is pure: it takes a prior state and a message and returns
//! the next state, never touching the prior one. Every operation, including
//! every member of an atomic, is applied to a draft copy; the draft is only
//! returned when all of them succeed.

use tracing::debug;

use ciborium::value::Value;
use oplog_core::{Cid, ContractId, KeyId};
use oplog_keys::validate::{
    apply_key_addition, apply_key_revocation, apply_key_update, authorize_action, authorize_op,
    validate_key_add, validate_key_delete, validate_key_update,
};
use oplog_keys::{
    EncryptedData, Envelope, EnvelopeError, ForeignKeyRef, KeyEffect, KeyUpdate,
    PrivateCheck,
};

use crate::config::ProcessorConfig;
use crate::error::{ProtocolError, Result};
use crate::message::{Message, MessageSigner};
use crate::op::{ActionData, AtomicMembers, KeyRequest, KeyShare, Op, OpType};
use crate::state::{ContractState, KeyRequestEntry, RequestStatus};

/// An action read from the log.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Resolved {
        message: Cid,
        /// Position of the action within the message.
        index: usize,
        action_type: String,
        data: Value,
        signer: KeyId,
    },
    /// An encrypted action whose key is not available locally yet.
    Deferred { message: Cid, index: usize, key: KeyId },
}

impl ActionOutcome {
    pub fn is_deferred(&self) -> bool {
        matches!(self, ActionOutcome::Deferred { .. })
    }
}

/// Work for the caller that follows from an applied message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// A key refers to another contract that must be followed.
    WatchForeignKey(ForeignKeyRef),
    /// `requester` asked `target` for keys.
    KeyRequestReceived {
        target: ContractId,
        requester: ContractId,
        request: Cid,
    },
    /// `owner` published key material for `recipient`.
    KeyShareReceived {
        owner: ContractId,
        recipient: ContractId,
        message: Cid,
    },
    KeyRequestAnswered {
        target: ContractId,
        request: Cid,
        success: bool,
    },
}

/// Result of applying one message.
#[derive(Debug, Clone)]
pub struct Applied {
    pub state: ContractState,
    pub actions: Vec<ActionOutcome>,
    pub effects: Vec<SideEffect>,
    /// Key shares carried by the message. Not kept in the state; a caller
    /// holding the reply key imports them from here.
    pub shares: Vec<KeyShare>,
}

impl Applied {
    pub fn has_deferred(&self) -> bool {
        self.actions.iter().any(ActionOutcome::is_deferred)
    }
}

/// Per-message context threaded through the operations.
struct Step<'a> {
    message: Cid,
    height: u64,
    signer: &'a MessageSigner,
    actions: Vec<ActionOutcome>,
    effects: Vec<SideEffect>,
    shares: Vec<KeyShare>,
    index: usize,
}

fn structural(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::Structural(msg.into())
}

/// Applies messages with copy-then-commit semantics.
#[derive(Debug, Clone, Default)]
pub struct Processor {
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Apply `message` on top of `prior`.
    ///
    /// `prior` must be `None` exactly for contract creation. On error the
    /// prior state is untouched and nothing of the message is applied.
    pub fn apply(&self, prior: Option<&ContractState>, message: &Message) -> Result<Applied> {
        let cid = message.hash()?;
        // An unknown foreign signer parks the message rather than failing
        // its signature check.
        let signer = message.signer()?;
        let operation = message.operation()?;

        if message.shape().members.len() > self.config.max_atomic_ops {
            return Err(structural(format!(
                "atomic operation has {} members, the limit is {}",
                message.shape().members.len(),
                self.config.max_atomic_ops
            )));
        }
        if signer.foreign.is_some() && operation.op_type() != OpType::KeyRequest {
            return Err(oplog_keys::PermsError::PermissionDenied(format!(
                "foreign key {:?} may only sign key requests",
                signer.record.name
            ))
            .into());
        }

        let mut draft = match prior {
            None if message.is_first_message() => None,
            None => return Err(ProtocolError::MissingState(message.contract_id()?)),
            Some(_) if message.is_first_message() => {
                return Err(structural("contract already exists"));
            }
            Some(prior) => {
                if self.config.verify_linkage {
                    check_linkage(prior, message)?;
                }
                Some(prior.clone())
            }
        };

        let mut step = Step {
            message: cid,
            height: message.height(),
            signer: &signer,
            actions: Vec::new(),
            effects: Vec::new(),
            shares: Vec::new(),
            index: 0,
        };

        match operation {
            Op::Contract(create) => {
                authorize_op(&signer.record, OpType::Contract.code())?;
                let contract_id = message.contract_id()?;
                let state = ContractState::genesis(contract_id, create.contract_type.clone(), message.keys().clone());
                for key in state.keys.iter() {
                    if let Some(reference) = key.record.foreign_ref()? {
                        step.effects.push(SideEffect::WatchForeignKey(reference));
                    }
                }
                draft = Some(state);
            }
            Op::Atomic(members) => {
                let state = draft.as_mut().ok_or_else(|| structural("atomic before creation"))?;
                for member in members {
                    apply_one(state, member, &mut step)?;
                    step.index += 1;
                }
            }
            single => {
                let state = draft.as_mut().ok_or_else(|| structural("operation before creation"))?;
                apply_one(state, single, &mut step)?;
            }
        }

        let mut state = draft.ok_or_else(|| structural("no state produced"))?;
        state.height = message.height();
        state.head = cid;
        if message.is_key_op() {
            state.previous_key_op = Some(cid);
        }
        debug!(
            contract = %state.contract_id,
            height = state.height,
            op = %operation.op_type(),
            "applied message"
        );

        Ok(Applied {
            state,
            actions: step.actions,
            effects: step.effects,
            shares: step.shares,
        })
    }

    /// Read the encrypted actions of an applied message again, e.g. after a
    /// missing key was fetched.
    pub fn resolve_actions(&self, message: &Message) -> Result<Vec<ActionOutcome>> {
        let cid = message.hash()?;
        let signer = message.signer()?;
        let mut outcomes = Vec::new();
        match message.operation()? {
            Op::Atomic(members) => {
                for (index, member) in members.iter().enumerate() {
                    if let Op::ActionEncrypted(action) = member {
                        outcomes.push(read_encrypted_action(action, &signer, cid, index)?);
                    }
                }
            }
            Op::ActionEncrypted(action) => {
                outcomes.push(read_encrypted_action(action, &signer, cid, 0)?);
            }
            _ => {}
        }
        Ok(outcomes)
    }
}

fn check_linkage(prior: &ContractState, message: &Message) -> Result<()> {
    let head = message.head();
    if head.height != prior.height + 1 {
        return Err(structural(format!(
            "expected height {}, got {}",
            prior.height + 1,
            head.height
        )));
    }
    if head.previous_head != Some(prior.head) {
        return Err(structural("previous head does not match the contract head"));
    }
    if head.previous_key_op != prior.previous_key_op {
        return Err(structural("previous key operation does not match"));
    }
    Ok(())
}

fn resolved(action: &ActionData, signer: &MessageSigner, message: Cid, index: usize) -> Result<ActionOutcome> {
    authorize_action(&signer.record, &action.action_type)?;
    Ok(ActionOutcome::Resolved {
        message,
        index,
        action_type: action.action_type.clone(),
        data: action.data.clone(),
        signer: signer.record.id,
    })
}

fn read_encrypted_action(
    action: &EncryptedData<Envelope<ActionData>>,
    signer: &MessageSigner,
    message: Cid,
    index: usize,
) -> Result<ActionOutcome> {
    match action.value() {
        Ok(inner) => resolved(inner.value()?, signer, message, index),
        Err(EnvelopeError::DecryptionKeyNotFound(key)) => {
            debug!(%message, %key, "deferring encrypted action");
            Ok(ActionOutcome::Deferred { message, index, key })
        }
        Err(e) => Err(e.into()),
    }
}

fn values<T: oplog_keys::Open + Clone>(list: &[Envelope<T>]) -> Result<Vec<T>> {
    list.iter()
        .map(|e| e.value().cloned().map_err(ProtocolError::from))
        .collect()
}

fn watch(effects: Vec<KeyEffect>, step: &mut Step<'_>) {
    step.effects.extend(effects.into_iter().map(|e| match e {
        KeyEffect::WatchForeignKey(reference) => SideEffect::WatchForeignKey(reference),
    }));
}

fn apply_one<A: AtomicMembers>(state: &mut ContractState, op: &Op<A>, step: &mut Step<'_>) -> Result<()> {
    let signer = &step.signer.record;
    authorize_op(signer, op.op_type().code())?;

    match op {
        Op::Contract(_) => return Err(structural("contract creation must be the first message")),
        Op::Atomic(_) => return Err(structural("atomic operations cannot nest")),

        Op::ActionUnencrypted(action) => {
            let outcome = resolved(action.value()?, step.signer, step.message, step.index)?;
            step.actions.push(outcome);
        }
        Op::ActionEncrypted(action) => {
            let outcome = read_encrypted_action(action, step.signer, step.message, step.index)?;
            step.actions.push(outcome);
        }

        Op::KeyAdd(list) => {
            let keys = values(list)?;
            validate_key_add(signer, &state.keys, &keys.iter().collect::<Vec<_>>(), PrivateCheck::Verify)?;
            let mut effects = Vec::new();
            apply_key_addition(state.keys_mut(), keys, step.height, Some(&mut effects))?;
            watch(effects, step);
        }
        Op::KeyDel(list) => {
            let ids = values(list)?;
            validate_key_delete(signer, &state.keys, &ids)?;
            apply_key_revocation(state.keys_mut(), &ids, step.height)?;
        }
        Op::KeyUpdate(list) => {
            let updates: Vec<KeyUpdate> = values(list)?;
            validate_key_update(signer, &state.keys, &updates.iter().collect::<Vec<_>>(), PrivateCheck::Verify)?;
            let mut effects = Vec::new();
            apply_key_update(state.keys_mut(), updates, step.height, Some(&mut effects))?;
            watch(effects, step);
        }

        Op::PropSet(prop) => {
            state.props.insert(prop.key.clone(), prop.value.clone());
        }

        Op::KeyShare(share) => {
            step.effects.push(SideEffect::KeyShareReceived {
                owner: share.foreign_contract_id.unwrap_or(state.contract_id),
                recipient: share.contract_id,
                message: step.message,
            });
            step.shares.push(share.clone());
        }

        Op::KeyRequest(request) => apply_key_request(state, request, step)?,

        Op::KeyRequestSeen(seen) => {
            let entry = state
                .key_requests
                .get_mut(&seen.request)
                .ok_or_else(|| structural(format!("unknown key request {}", seen.request)))?;
            if entry.status != RequestStatus::Pending {
                return Err(structural(format!("key request {} was already answered", seen.request)));
            }
            entry.status = if seen.success {
                RequestStatus::Shared
            } else {
                RequestStatus::Denied
            };
            step.effects.push(SideEffect::KeyRequestAnswered {
                target: state.contract_id,
                request: seen.request,
                success: seen.success,
            });
        }
    }
    Ok(())
}

fn apply_key_request(state: &mut ContractState, request: &KeyRequest, step: &mut Step<'_>) -> Result<()> {
    let body = request.body()?;
    if let Some(foreign) = &step.signer.foreign {
        if foreign.contract != body.contract_id {
            return Err(oplog_keys::PermsError::PermissionDenied(format!(
                "key request for {} signed by a key of {}",
                body.contract_id, foreign.contract
            ))
            .into());
        }
        // The requester's table must reach the height the request names;
        // the signing key is checked at that height, not at the latest one.
        if foreign.height < body.height {
            return Err(ProtocolError::MissingState(foreign.contract));
        }
        foreign.keys.authorize_signing(&step.signer.record.id, body.height)?;
    }
    if state.key_requests.contains_key(&step.message) {
        return Err(structural("one key request per message"));
    }

    let reference = match request {
        KeyRequest::V1(_) => None,
        KeyRequest::V2(_) => body.reference.clone(),
    };
    let duplicate = state
        .pending_requests(&body.contract_id)
        .any(|(_, e)| e.request == body.request && e.reference == reference);
    if duplicate {
        debug!(requester = %body.contract_id, request = %body.request, "key request already pending");
        return Ok(());
    }

    state.key_requests.insert(
        step.message,
        KeyRequestEntry {
            requester: body.contract_id,
            requester_height: body.height,
            request: body.request.clone(),
            reference,
            reply_with: body.reply_with.clone(),
            status: RequestStatus::Pending,
        },
    );
    step.effects.push(SideEffect::KeyRequestReceived {
        target: state.contract_id,
        requester: body.contract_id,
        request: step.message,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use oplog_core::SecretKey;
    use oplog_keys::{KeyPurpose, KeyRecord, KeyRing, Scope};

    use crate::delegation::SharedKeyMaterial;
    use crate::message::MessageParams;
    use crate::op::{PropSet, Operation};

    struct Log {
        ring: Arc<KeyRing>,
        admin: KeyId,
        state: ContractState,
        processor: Processor,
    }

    fn log() -> Log {
        let ring = Arc::new(KeyRing::new());
        let admin = SecretKey::generate_signing();
        let record = KeyRecord::new("admin", &admin.public(), [KeyPurpose::Sig]);
        let admin = ring.insert(admin);
        let genesis = Message::create_contract("notes", vec![Envelope::Plain(record)], admin, ring.as_ref()).unwrap();
        let processor = Processor::default();
        let state = processor.apply(None, &genesis).unwrap().state;
        Log { ring, admin, state, processor }
    }

    impl Log {
        fn roundtrip(&self, op: Operation) -> Message {
            let msg = Message::sign(MessageParams::next(&self.state), op, &self.state.keys, self.admin, self.ring.as_ref())
                .unwrap();
            let raw = msg.serialize().unwrap().clone();
            Message::deserialize(&raw, self.ring.clone(), Some(&self.state), None).unwrap()
        }
    }

    fn prop(key: &str) -> PropSet {
        PropSet {
            key: key.into(),
            value: Value::Text(key.to_uppercase()),
        }
    }

    #[test]
    fn test_genesis_state() {
        let l = log();
        assert_eq!(l.state.height, 0);
        assert_eq!(l.state.contract_type, "notes");
        assert_eq!(l.state.keys.len(), 1);
    }

    #[test]
    fn test_prop_set_advances_head() {
        let l = log();
        let msg = l.roundtrip(Op::PropSet(prop("title")));
        let applied = l.processor.apply(Some(&l.state), &msg).unwrap();
        assert_eq!(applied.state.height, 1);
        assert_eq!(applied.state.head, msg.hash().unwrap());
        assert_eq!(applied.state.previous_key_op, l.state.previous_key_op);
        assert_eq!(applied.state.prop("title"), Some(&Value::Text("TITLE".into())));
    }

    #[test]
    fn test_linkage_enforced() {
        let l = log();
        let msg = l.roundtrip(Op::PropSet(prop("a")));
        let next = l.processor.apply(Some(&l.state), &msg).unwrap().state;

        // Replaying the same message on the advanced state breaks linkage.
        let stale = Message::deserialize(msg.serialize().unwrap(), l.ring.clone(), Some(&next), None).unwrap();
        assert!(matches!(
            l.processor.apply(Some(&next), &stale),
            Err(ProtocolError::Structural(_))
        ));
    }

    #[test]
    fn test_atomic_all_or_nothing() {
        let l = log();
        let stranger = KeyId::for_public_key(&SecretKey::generate_signing().public().serialize());
        let op: Operation = Op::Atomic(vec![
            Op::PropSet(prop("a")),
            Op::KeyDel(vec![Envelope::Plain(stranger)]),
        ]);
        let msg = l.roundtrip(op);
        let before = l.state.clone();
        assert!(l.processor.apply(Some(&l.state), &msg).is_err());
        assert_eq!(l.state, before);
    }

    #[test]
    fn test_key_add_marks_key_op() {
        let l = log();
        let writer = SecretKey::generate_signing();
        let record = KeyRecord::new("writer", &writer.public(), [KeyPurpose::Sig])
            .ring_level(1)
            .permissions(Scope::only(["au"]))
            .allowed_actions(Scope::only(["post"]));
        let msg = l.roundtrip(Op::KeyAdd(vec![Envelope::Plain(record.clone())]));
        assert!(msg.is_key_op());

        let applied = l.processor.apply(Some(&l.state), &msg).unwrap();
        assert_eq!(applied.state.previous_key_op, Some(msg.hash().unwrap()));
        let key = applied.state.keys.get(&record.id).unwrap();
        assert_eq!(key.valid_from, 1);
    }

    #[test]
    fn test_actions_respect_allowed_actions() {
        let l = log();
        let writer = SecretKey::generate_signing();
        let record = KeyRecord::new("writer", &writer.public(), [KeyPurpose::Sig])
            .permissions(Scope::only(["au"]))
            .allowed_actions(Scope::only(["post"]));
        let msg = l.roundtrip(Op::KeyAdd(vec![Envelope::Plain(record)]));
        let state = l.processor.apply(Some(&l.state), &msg).unwrap().state;
        let writer = l.ring.insert(writer);

        let act = |action: &str| {
            let op = Op::ActionUnencrypted(Envelope::Plain(ActionData::new(action, Value::Null)));
            let msg = Message::sign(MessageParams::next(&state), op, &state.keys, writer, l.ring.as_ref()).unwrap();
            let raw = msg.serialize().unwrap().clone();
            let msg = Message::deserialize(&raw, l.ring.clone(), Some(&state), None).unwrap();
            l.processor.apply(Some(&state), &msg)
        };

        let applied = act("post").unwrap();
        assert!(matches!(
            &applied.actions[..],
            [ActionOutcome::Resolved { action_type, .. }] if action_type == "post"
        ));
        assert!(matches!(act("delete"), Err(ProtocolError::Perms(_))));

        // The writer may not set properties.
        let op = Op::PropSet(prop("x"));
        let msg = Message::sign(MessageParams::next(&state), op, &state.keys, writer, l.ring.as_ref()).unwrap();
        assert!(l.processor.apply(Some(&state), &msg).is_err());
    }

    #[test]
    fn test_missing_key_defers_action() {
        let l = log();
        let enc = SecretKey::generate_encryption();
        let record = KeyRecord::new("enc", &enc.public(), [KeyPurpose::Enc]);
        let msg = l.roundtrip(Op::KeyAdd(vec![Envelope::Plain(record.clone())]));
        let state = l.processor.apply(Some(&l.state), &msg).unwrap().state;

        let action = EncryptedData::encrypt(
            &state.keys,
            record.id,
            Envelope::Plain(ActionData::new("post", Value::Text("hidden".into()))),
        )
        .unwrap();
        let op = Op::ActionEncrypted(action);
        let outgoing = Message::sign(MessageParams::next(&state), op, &state.keys, l.admin, l.ring.as_ref()).unwrap();
        let raw = outgoing.serialize().unwrap().clone();
        let incoming = Message::deserialize(&raw, l.ring.clone(), Some(&state), None).unwrap();

        let applied = l.processor.apply(Some(&state), &incoming).unwrap();
        assert!(applied.has_deferred());
        assert_eq!(applied.state.height, 2);

        l.ring.insert(enc);
        let outcomes = l.processor.resolve_actions(&incoming).unwrap();
        assert!(matches!(
            &outcomes[..],
            [ActionOutcome::Resolved { data: Value::Text(text), .. }] if text == "hidden"
        ));
    }

    #[test]
    fn test_key_share_is_reported_not_stored() {
        let l = log();
        let enc = SecretKey::generate_encryption();
        let record = KeyRecord::new("reply", &enc.public(), [KeyPurpose::Enc]);
        let msg = l.roundtrip(Op::KeyAdd(vec![Envelope::Plain(record.clone())]));
        let state = l.processor.apply(Some(&l.state), &msg).unwrap().state;

        let keys = EncryptedData::encrypt(&state.keys, record.id, SharedKeyMaterial { keys: Vec::new() })
            .unwrap()
            .to_wire(b"share")
            .unwrap();
        let share = KeyShare {
            contract_id: state.contract_id,
            foreign_contract_id: None,
            request: None,
            keys,
        };
        let op = Op::KeyShare(share.clone());
        let outgoing = Message::sign(MessageParams::next(&state), op, &state.keys, l.admin, l.ring.as_ref()).unwrap();
        let raw = outgoing.serialize().unwrap().clone();
        let incoming = Message::deserialize(&raw, l.ring.clone(), Some(&state), None).unwrap();

        let applied = l.processor.apply(Some(&state), &incoming).unwrap();
        assert_eq!(applied.shares, vec![share]);
        assert!(matches!(&applied.effects[..], [SideEffect::KeyShareReceived { .. }]));

        // Only the head moves.
        let mut expected = state.clone();
        expected.height = applied.state.height;
        expected.head = applied.state.head;
        assert_eq!(applied.state, expected);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let l = log();
        let msg = l.roundtrip(Op::Atomic(vec![Op::PropSet(prop("a")), Op::PropSet(prop("b"))]));
        let first = l.processor.apply(Some(&l.state), &msg).unwrap();
        let second = l.processor.apply(Some(&l.state), &msg).unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(first.effects, second.effects);
    }
}
