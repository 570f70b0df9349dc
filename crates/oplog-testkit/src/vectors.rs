//! Golden test vectors for deterministic verification.
//!
//! Unencrypted messages built from the same inputs must serialize to the
//! same bytes everywhere. The vectors below derive their keys from fixed
//! seeds, so their bytes and CIDs can be compared across implementations.

use std::sync::Arc;

use oplog::{Message, MessageParams, Op, PropSet, Result};
use oplog_keys::{Envelope, KeyRing};

use crate::fixtures::creation_keys;

/// A golden test vector.
#[derive(Debug, Clone)]
pub struct GoldenVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    /// Party whose seeded keys create the contract.
    pub party: u8,
    pub contract_type: &'static str,
    /// Property set after creation, if any.
    pub prop: Option<(&'static str, &'static str)>,
    /// Head bytes of the last message, hex.
    pub expected_head: &'static str,
    /// CID of the last message.
    pub expected_cid: &'static str,
    /// Wire bytes of the last message, hex.
    pub expected_bytes: &'static str,
}

/// Get all golden test vectors.
pub fn all_vectors() -> Vec<GoldenVector> {
    vec![
        GoldenVector {
            name: "creation with sig and enc keys",
            party: 0x42,
            contract_type: "notes",
            prop: None,
            expected_head: "a300010161630200",
            expected_cid: "baga3zracdyqi6thzezdvyoylfxpquovsxwa2zqbmu3opqennjcfhvsvtlousvxq",
            expected_bytes: concat!(
                "a2616848a3000101616302006170590260a16173a361645901cf8261635901c9a2646b6579738258",
                "daa1617058d5a76269647840626167626c7a7261636479716a6361326c77356b74716f363271706a",
                "6567776b6333627a7862776f6e67786a7a7478366661616a6a7063636a746f366575666164646174",
                "617848656432353531393a3635633163616562313031383963356564396431333832646535633738",
                "6530393865643939323136633762383532333530353861366332343438613762636638646e616d65",
                "6373696767707572706f736581637369676972696e674c6576656c006b7065726d697373696f6e73",
                "612a6e616c6c6f776564416374696f6e73612a58d9a1617058d4a76269647840626167626c7a7261",
                "6364797165726d376937326c626433747a3261366875777837367a77656c3566673377337233696c",
                "793336696f656a647737343474776d71646461746178477832353531393a34373063623930653238",
                "62646265383464613166336332633634303835653237646634303961323064383564643835646461",
                "3532626664313964366333393735646e616d6563656e6367707572706f73658163656e636972696e",
                "674c6576656c006b7065726d697373696f6e73612a6e616c6c6f776564416374696f6e73612a6474",
                "797065656e6f746573616b7840626167626c7a7261636479716a6361326c77356b74716f36327170",
                "6a6567776b6333627a7862776f6e67786a7a7478366661616a6a7063636a746f3665756661617358",
                "40396846d8917dad1e2c5c47d8627ac29db2de70e86f837eab27c5983a624329f60d0186d9476967",
                "4a023cf977a513b3f6b3693be08045d805811c53d52b94f00a",
            ),
        },
        GoldenVector {
            name: "creation of another type",
            party: 0x00,
            contract_type: "inbox",
            prop: None,
            expected_head: "a300010161630200",
            expected_cid: "baga3zracdyqkc4ifgwymk42zzx2tcfq3knoo2p4wrqqsr4gj2ldpukl5vu6brxi",
            expected_bytes: concat!(
                "a2616848a3000101616302006170590260a16173a361645901cf8261635901c9a2646b6579738258",
                "daa1617058d5a76269647840626167626c7a7261636479716a7879797468777a63376b7336373370",
                "667237627976716867623470676570636274757661716e6272356c7a6d66327a6461356964646174",
                "617848656432353531393a3466313630646230623634306630303332356638633137386536663566",
                "3736393632646562636639653732623532623965643966383030336361623863613734646e616d65",
                "6373696767707572706f736581637369676972696e674c6576656c006b7065726d697373696f6e73",
                "612a6e616c6c6f776564416374696f6e73612a58d9a1617058d4a76269647840626167626c7a7261",
                "63647971646f746c77687369786a65327a346763726566666e776262697878356c6e7a7236646a74",
                "7466616a616b6a6d7137666671377769646461746178477832353531393a37633962666266376134",
                "34306363393033663531313463393733373235323437383038373064376336313865333237376338",
                "6331663135343261346466623033646e616d6563656e6367707572706f73658163656e636972696e",
                "674c6576656c006b7065726d697373696f6e73612a6e616c6c6f776564416374696f6e73612a6474",
                "79706565696e626f78616b7840626167626c7a7261636479716a7879797468777a63376b73363733",
                "70667237627976716867623470676570636274757661716e6272356c7a6d66327a64613569617358",
                "401a609a7607b34f67befa0da55849e0e9f4c71f97496319918fce9386067a91f7bbff94894759db",
                "e7d4cb47ba3556bbfa012713026ce1c0b3d7e27ab7b8932e09",
            ),
        },
        GoldenVector {
            name: "property set after creation",
            party: 0x42,
            contract_type: "notes",
            prop: Some(("title", "hello")),
            expected_head: "a600010162707302010358270181bcc4021e208f4cf926475c3b0b2ddf0a3ab2bd81acc02ca6dcf811ad488a7acab35ba92ade0458270181bcc4021e208f4cf926475c3b0b2ddf0a3ab2bd81acc02ca6dcf811ad488a7acab35ba92ade0558270181bcc4021e208f4cf926475c3b0b2ddf0a3ab2bd81acc02ca6dcf811ad488a7acab35ba92ade",
            expected_cid: "baga3zracdyqe5olrxa4grbcue7jzm5qf2m3ex77fju3lryqejmlbsuz7z2vmb5q",
            expected_bytes: concat!(
                "a261685887a600010162707302010358270181bcc4021e208f4cf926475c3b0b2ddf0a3ab2bd81ac",
                "c02ca6dcf811ad488a7acab35ba92ade0458270181bcc4021e208f4cf926475c3b0b2ddf0a3ab2bd",
                "81acc02ca6dcf811ad488a7acab35ba92ade0558270181bcc4021e208f4cf926475c3b0b2ddf0a3a",
                "b2bd81acc02ca6dcf811ad488a7acab35ba92ade617058aca16173a36164581c8262707357a2636b",
                "6579657469746c656576616c75656568656c6c6f616b7840626167626c7a7261636479716a636132",
                "6c77356b74716f363271706a6567776b6333627a7862776f6e67786a7a7478366661616a6a706363",
                "6a746f366575666161735840b97e316c0cd282ef0455dd6d476040b56adba7214484e524e98fe3b2",
                "59a6c31a0f67604cecb5b7be304a7d13694748a3037ebee2cb082b6d5ef38db2919a5c0d",
            ),
        },
    ]
}

/// Build the messages of a vector, genesis first.
pub fn messages_from_vector(vector: &GoldenVector) -> Result<Vec<Message>> {
    let (secrets, records) = creation_keys(vector.party, &[])?;
    let ring = Arc::new(KeyRing::new());
    for secret in secrets {
        ring.insert(secret);
    }
    let signer = records[0].id;

    let genesis = Message::create_contract(
        vector.contract_type,
        records.into_iter().map(Envelope::Plain).collect(),
        signer,
        ring.as_ref(),
    )?;
    let mut messages = vec![genesis];

    if let Some((key, value)) = vector.prop {
        let genesis = Message::deserialize(messages[0].serialize()?, ring.clone(), None, None)?;
        let state = oplog::Processor::default().apply(None, &genesis)?.state;
        let op = Op::PropSet(PropSet {
            key: key.into(),
            value: ciborium::value::Value::Text(value.into()),
        });
        messages.push(Message::sign(
            MessageParams::next(&state),
            op,
            &state.keys,
            signer,
            ring.as_ref(),
        )?);
    }
    Ok(messages)
}

/// Check every vector, reporting `(name, matches, cid of last message)`.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    all_vectors()
        .iter()
        .map(|v| match messages_from_vector(v) {
            Ok(messages) => {
                let Some(last) = messages.last() else {
                    return (v.name.to_string(), false, String::new());
                };
                let head = hex::encode(last.head_bytes());
                let bytes = last.serialize().map(hex::encode).unwrap_or_default();
                let cid = last.hash().map(|c| c.to_string()).unwrap_or_default();
                let matches = head == v.expected_head && bytes == v.expected_bytes && cid == v.expected_cid;
                (v.name.to_string(), matches, cid)
            }
            Err(e) => (v.name.to_string(), false, e.to_string()),
        })
        .collect()
}

/// Vectors with their computed bytes, for export to other implementations.
pub fn export_json() -> Result<serde_json::Value> {
    let mut out = Vec::new();
    for vector in all_vectors() {
        let messages = messages_from_vector(&vector)?;
        let mut encoded = Vec::new();
        for message in &messages {
            encoded.push(serde_json::json!({
                "cid": message.hash()?.to_string(),
                "head": hex::encode(message.head_bytes()),
                "bytes": hex::encode(message.serialize()?),
            }));
        }
        out.push(serde_json::json!({
            "name": vector.name,
            "party": vector.party,
            "contractType": vector.contract_type,
            "messages": encoded,
        }));
    }
    Ok(serde_json::Value::Array(out))
}
