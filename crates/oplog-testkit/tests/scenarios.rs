//! End-to-end scenarios over whole contract logs.
//!
//! Single-contract rules are exercised with [`TestLog`]; delegation between
//! contracts runs through two [`TestNode`]s exchanging published messages.

use ciborium::value::Value;
use proptest::prelude::*;

use oplog::{
    ActionData, ActionOutcome, DelegationStatus, ErrorKind, IngestOutcome, Message, Op, Processor,
    PropSet, RequestStatus, SideEffect,
};
use oplog_core::SecretKey;
use oplog_keys::validate::validate_key_add;
use oplog_keys::{EncryptedData, Envelope, KeyPurpose, KeyRecord, KeyTable, PrivateCheck, Scope, SecretKeys};
use oplog_testkit::generators::{prop_set, signing_key};
use oplog_testkit::{deliver, replay, seed, Capabilities, TestLog, TestNode};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn prop(key: &str, value: &str) -> oplog::Operation {
    Op::PropSet(PropSet {
        key: key.into(),
        value: Value::Text(value.into()),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Single contract
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_creation_message_is_its_own_contract() {
    let log = TestLog::new(1, Vec::new()).unwrap();
    let genesis = Message::deserialize(&log.log[0], log.ring.clone(), None, None).unwrap();

    assert!(genesis.is_first_message());
    assert_eq!(genesis.contract_id().unwrap().0, genesis.hash().unwrap());
    assert_eq!(log.state.contract_id, log.contract);
    assert_eq!(log.state.keys.len(), 2);
    assert!(log.state.keys.iter().all(|k| k.record.ring_level == 0));
}

#[test]
fn test_ring_two_key_add_is_capped() {
    let admin = SecretKey::signing_from_seed(seed(9, 0));
    let record = KeyRecord::new("admin", &admin.public(), [KeyPurpose::Sig])
        .ring_level(2)
        .permissions(Scope::only(["ka"]));
    let admin_id = record.id;
    let mut log = TestLog::new(1, vec![(admin, record)]).unwrap();

    let key = |name: &str, ring: u32, permissions: Scope| {
        let secret = SecretKey::generate_signing();
        Op::KeyAdd(vec![Envelope::Plain(
            KeyRecord::new(name, &secret.public(), [KeyPurpose::Sig])
                .ring_level(ring)
                .permissions(permissions),
        )])
    };

    // Below the signer's ring.
    let err = log.append(admin_id, key("low", 1, Scope::only(["ka"]))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);

    // Broader than the signer's permissions.
    let err = log
        .append(admin_id, key("wide", 2, Scope::only(["ka", "kd"])))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    let err = log.append(admin_id, key("all", 3, Scope::All)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert_eq!(log.state.height, 0);

    // Within both ceilings.
    log.append(admin_id, key("peer", 2, Scope::only(["ka"]))).unwrap();
    log.append(admin_id, key("narrow", 3, Scope::none())).unwrap();
    assert_eq!(log.state.height, 2);
    assert!(log.state.keys.current_by_name("peer").is_some());

    // The admin may not set properties.
    let err = log.append(admin_id, prop("title", "x")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
}

#[test]
fn test_atomic_batch_is_all_or_nothing() {
    let mut log = TestLog::new(1, Vec::new()).unwrap();
    let before = log.state.clone();
    let stranger = SecretKey::generate_signing().id();

    let raw = log
        .sign(
            log.signer,
            Op::Atomic(vec![
                Op::PropSet(PropSet {
                    key: "title".into(),
                    value: Value::Text("kept?".into()),
                }),
                Op::KeyDel(vec![Envelope::Plain(stranger)]),
            ]),
        )
        .unwrap();
    assert!(log.apply(&raw).is_err());
    assert_eq!(log.state, before);
    assert!(log.state.prop("title").is_none());
}

#[test]
fn test_same_message_twice_same_state() {
    let log = TestLog::new(1, Vec::new()).unwrap();
    let raw = log.sign(log.signer, prop("title", "hello")).unwrap();
    let processor = Processor::default();

    let first = Message::deserialize(&raw, log.ring.clone(), Some(&log.state), None).unwrap();
    let second = Message::deserialize(&raw, log.ring.clone(), Some(&log.state), None).unwrap();
    let a = processor.apply(Some(&log.state), &first).unwrap();
    let b = processor.apply(Some(&log.state), &second).unwrap();

    assert_eq!(a.state, b.state);
    assert_eq!(a.effects, b.effects);
    assert_eq!(first.serialize().unwrap(), &raw);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_replay_is_deterministic(ops in prop::collection::vec(prop_set(), 1..6)) {
        let mut log = TestLog::new(3, Vec::new()).unwrap();
        for op in ops {
            log.append(log.signer, op).unwrap();
        }
        let once = replay(&log.log, log.ring.clone()).unwrap();
        let twice = replay(&log.log, log.ring.clone()).unwrap();
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(&once, &log.state);
    }

    #[test]
    fn prop_key_add_never_escalates(
        signer: Capabilities,
        target: Capabilities,
        s in signing_key(),
        t in signing_key(),
    ) {
        prop_assume!(s.id() != t.id());
        let signer_record = signer.record("signer", &s, KeyPurpose::Sig);
        let target_record = target.record("target", &t, KeyPurpose::Sig);
        let table = KeyTable::bootstrap([signer_record.clone()], 0).unwrap();

        let result = validate_key_add(&signer_record, &table, &[&target_record], PrivateCheck::Skip);
        prop_assert_eq!(result.is_ok(), signer.covers(&target));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delegation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_key_request_and_share_round_trip() {
    init_tracing();
    let alice = TestNode::new();
    let bob = TestNode::new();
    let a = alice.create_contract(1, "requester", &[]).await.unwrap();
    let b = bob.create_contract(2, "vault", &["data", "archive"]).await.unwrap();
    deliver(&[&alice, &bob]).await.unwrap();
    let data = b.shared[0].clone();

    // Bob posts an action only the "data" key can read.
    let state = bob.contracts.state(&b.id).unwrap();
    let action = EncryptedData::encrypt(
        &state.keys,
        data.id,
        Envelope::Plain(ActionData::new("note", Value::Text("for data holders".into()))),
    )
    .unwrap();
    bob.append(&b.id, b.signer, Op::ActionEncrypted(action)).await.unwrap();
    deliver(&[&alice, &bob]).await.unwrap();
    assert!(alice.contracts.retry_deferred(&b.id).await.is_empty());

    let reply = alice
        .contracts
        .request_keys(&a.id, &b.id, a.signer, "data", None)
        .await
        .unwrap()
        .expect("first request");
    deliver(&[&alice, &bob]).await.unwrap();
    for node in [&alice, &bob] {
        assert_eq!(
            node.contracts.delegation_status(&a.id, &b.id, "data", None),
            Some(DelegationStatus::Requested)
        );
    }
    // Asking again while the request is outstanding does nothing.
    assert!(alice
        .contracts
        .request_keys(&a.id, &b.id, a.signer, "data", None)
        .await
        .unwrap()
        .is_none());

    let target = bob.contracts.state(&b.id).unwrap();
    let (request, entry) = target.key_requests.iter().next().unwrap();
    assert_eq!(entry.requester, a.id);
    assert_eq!(entry.status, RequestStatus::Pending);
    bob.contracts
        .respond(&b.id, *request, b.signer, true, None)
        .await
        .unwrap();

    let outcomes = deliver(&[&alice, &bob]).await.unwrap();
    assert!(outcomes.iter().any(|o| matches!(
        o,
        IngestOutcome::Applied { effects, .. }
            if effects.iter().any(|e| matches!(e, SideEffect::KeyShareReceived { .. }))
    )));

    // Alice now holds exactly the requested key, and only that key.
    let imported = alice.ring.secret(&data.id).expect("shared key imported");
    assert_eq!(imported.serialize_secret(), data.secret);
    assert!(!alice.ring.contains(&b.shared[1].id));
    assert!(!bob.ring.contains(&data.id));
    assert_eq!(
        alice.contracts.delegation_status(&a.id, &b.id, "data", None),
        Some(DelegationStatus::Shared)
    );

    // The deferred action is readable now.
    let resolved = alice.contracts.retry_deferred(&b.id).await;
    assert!(matches!(
        &resolved[..],
        [ActionOutcome::Resolved { action_type, data: Value::Text(text), .. }]
            if action_type == "note" && text == "for data holders"
    ));

    // Completing revokes the reply key.
    alice
        .contracts
        .complete(&a.id, &b.id, "data", None, a.signer)
        .await
        .unwrap()
        .expect("reply key is current");
    deliver(&[&alice, &bob]).await.unwrap();
    let requester = alice.contracts.state(&a.id).unwrap();
    assert!(requester.keys.get(&reply).is_some_and(|k| !k.is_current()));
    assert_eq!(
        alice.contracts.delegation_status(&a.id, &b.id, "data", None),
        Some(DelegationStatus::None)
    );
}

#[tokio::test]
async fn test_denied_and_empty_requests() {
    init_tracing();
    let alice = TestNode::new();
    let bob = TestNode::new();
    let a = alice.create_contract(3, "requester", &[]).await.unwrap();
    let b = bob.create_contract(4, "vault", &["data"]).await.unwrap();
    deliver(&[&alice, &bob]).await.unwrap();

    alice
        .contracts
        .request_keys(&a.id, &b.id, a.signer, "data", Some("thread-1"))
        .await
        .unwrap()
        .unwrap();
    // Each request extends both logs, so it must land before the next one.
    deliver(&[&alice, &bob]).await.unwrap();
    alice
        .contracts
        .request_keys(&a.id, &b.id, a.signer, "nothing-here", None)
        .await
        .unwrap()
        .unwrap();
    deliver(&[&alice, &bob]).await.unwrap();

    let target = bob.contracts.state(&b.id).unwrap();
    let (data_request, _) = target.find_request(&a.id, "data", Some("thread-1")).unwrap();
    let (empty_request, _) = target.find_request(&a.id, "nothing-here", None).unwrap();
    let (data_request, empty_request) = (*data_request, *empty_request);

    bob.contracts
        .respond(&b.id, data_request, b.signer, false, None)
        .await
        .unwrap();
    deliver(&[&alice, &bob]).await.unwrap();
    // An approval that selects no keys is a denial too.
    bob.contracts
        .respond(&b.id, empty_request, b.signer, true, None)
        .await
        .unwrap();
    deliver(&[&alice, &bob]).await.unwrap();

    for (request, reference) in [("data", Some("thread-1")), ("nothing-here", None)] {
        assert_eq!(
            alice.contracts.delegation_status(&a.id, &b.id, request, reference),
            Some(DelegationStatus::Denied)
        );
    }
    assert!(!alice.ring.contains(&b.shared[0].id));

    // Answering twice is refused.
    assert!(bob
        .contracts
        .respond(&b.id, data_request, b.signer, true, None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_share_of_another_contracts_keys() {
    init_tracing();
    let alice = TestNode::new();
    let bob = TestNode::new();
    let a = alice.create_contract(5, "requester", &[]).await.unwrap();
    let b = bob.create_contract(6, "front", &[]).await.unwrap();
    let c = bob.create_contract(7, "vault", &["data"]).await.unwrap();
    deliver(&[&alice, &bob]).await.unwrap();
    let data = c.shared[0].clone();

    alice
        .contracts
        .request_keys(&a.id, &b.id, a.signer, "data", None)
        .await
        .unwrap()
        .unwrap();
    deliver(&[&alice, &bob]).await.unwrap();

    let target = bob.contracts.state(&b.id).unwrap();
    let (request, _) = target.find_request(&a.id, "data", None).unwrap();
    bob.contracts
        .respond(&b.id, *request, b.signer, true, Some(&c.id))
        .await
        .unwrap();
    let outcomes = deliver(&[&alice, &bob]).await.unwrap();
    assert!(outcomes.iter().any(|o| matches!(
        o,
        IngestOutcome::Applied { effects, .. } if effects.iter().any(|e| matches!(
            e,
            SideEffect::KeyShareReceived { owner, recipient, .. } if *owner == c.id && *recipient == a.id
        ))
    )));

    let imported = alice.ring.secret(&data.id).expect("owner's key imported");
    assert_eq!(imported.serialize_secret(), data.secret);
    assert_eq!(
        alice.contracts.delegation_status(&a.id, &b.id, "data", None),
        Some(DelegationStatus::Shared)
    );
}

#[tokio::test]
async fn test_request_from_unknown_contract_waits_for_it() {
    init_tracing();
    let alice = TestNode::new();
    let bob = TestNode::new();
    let carol = TestNode::new();
    let a = alice.create_contract(8, "requester", &[]).await.unwrap();
    let b = bob.create_contract(9, "vault", &["data"]).await.unwrap();
    deliver(&[&alice, &bob]).await.unwrap();
    // Carol follows the vault only.
    carol.contracts.ingest(b.genesis.clone()).await.unwrap();

    alice
        .contracts
        .request_keys(&a.id, &b.id, a.signer, "data", None)
        .await
        .unwrap()
        .unwrap();
    let published: Vec<_> = alice.outbox.take().await.into_iter().flatten().collect();
    let (to_requester, to_target): (Vec<_>, Vec<_>) = published.into_iter().partition(|m| m.contract_id == a.id);
    assert_eq!((to_requester.len(), to_target.len()), (1, 1));

    let outcome = carol.contracts.ingest(to_target[0].bytes.clone()).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Parked { .. }));
    assert!(carol.contracts.quarantined(&b.id).await.is_none());
    assert_eq!(carol.contracts.state(&b.id).unwrap().height, 0);

    // Once the requester's log is known, the request applies.
    carol.contracts.ingest(a.genesis.clone()).await.unwrap();
    carol.contracts.ingest(to_requester[0].bytes.clone()).await.unwrap();
    let retried = carol.contracts.retry(&b.id).await.unwrap();
    assert!(matches!(&retried[..], [IngestOutcome::Applied { height: 1, .. }]));
    let target = carol.contracts.state(&b.id).unwrap();
    assert!(target.find_request(&a.id, "data", None).is_some());
}
