//! Cross-contract key delegation.
//!
//! A requester contract asks a target contract for key material:
//!
//! 1. The requester mints a reply key, adds it to its own table and appends
//!    a key request to the target's log. The request carries a signed
//!    [`ReplyWith`] naming the reply key.
//! 2. The target answers with an atomic key share plus acknowledgement, the
//!    shared secrets encrypted to the reply key. Or it denies the request.
//! 3. The requester imports the secrets and revokes the reply key.
//!
//! Per (requester, target) pair this moves `none -> requested -> shared|denied`,
//! and back to `none` once the reply key is revoked.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tracing::{debug, info};

use oplog_core::{Blake3Hash, Cid, ContractId, KeyId, SecretKey};
use oplog_keys::{
    plain_envelope_data, EncryptedData, Envelope, EnvelopeError, KeyPurpose, KeyRecord, KeyRing,
    KeyScope, OpenContext, Scope, SecretKeys, SignedData, Validator,
};

use crate::error::{ProtocolError, Result};
use crate::message::{Message, MessageParams};
use crate::op::{KeyRequest, KeyRequestBody, KeyRequestSeen, KeyShare, Op};
use crate::state::{ContractState, RequestStatus};

const REPLY_KEY_PREFIX: &str = "kr:";

/// Which key the target should encrypt its answer to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyWith {
    pub encryption_key_id: KeyId,
    pub target: ContractId,
}

/// One shared secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedSecret {
    pub name: String,
    pub id: KeyId,
    /// `"<alg>-secret:<hex>"`.
    pub secret: String,
}

/// Plaintext of a key share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedKeyMaterial {
    pub keys: Vec<SharedSecret>,
}

plain_envelope_data!(ReplyWith, SharedKeyMaterial);

/// Delegation state of a (requester, target) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationStatus {
    None,
    Requested,
    Shared,
    Denied,
}

/// Name of the reply key for a request. One pending request per name.
pub fn reply_key_name(target: &ContractId, request: &str, reference: Option<&str>) -> String {
    let digest = Blake3Hash::hash_parts(&[
        request.as_bytes(),
        &[0],
        reference.unwrap_or_default().as_bytes(),
    ]);
    format!("{REPLY_KEY_PREFIX}{target}:{}", &digest.to_hex()[..16])
}

fn reply_with_aad(requester: &ContractId, target: &ContractId) -> Vec<u8> {
    [b"oplog-reply-with:".as_slice(), &requester.0.to_bytes(), &target.0.to_bytes()].concat()
}

fn share_aad(owner: &ContractId, requester: &ContractId, request: Option<&Cid>) -> Vec<u8> {
    let mut aad = [b"oplog-key-share:".as_slice(), &owner.0.to_bytes(), &requester.0.to_bytes()].concat();
    if let Some(request) = request {
        aad.extend_from_slice(&request.to_bytes());
    }
    aad
}

/// The two messages of a key request. They must be published together,
/// key-add first.
#[derive(Debug)]
pub struct KeyRequestMessages {
    pub reply_key: KeyId,
    /// Appended to the requester's log.
    pub key_add: Message,
    /// Appended to the target's log.
    pub key_request: Message,
}

/// Start a key request from `requester` to `target`.
///
/// Returns `None` when a request with the same request string and reference
/// is still outstanding.
pub fn key_request(
    requester: &ContractState,
    target: &ContractState,
    signer: KeyId,
    request: &str,
    reference: Option<&str>,
    ring: &KeyRing,
) -> Result<Option<KeyRequestMessages>> {
    let name = reply_key_name(&target.contract_id, request, reference);
    if requester.keys.current_by_name(&name).is_some() {
        debug!(requester = %requester.contract_id, target = %target.contract_id, %name, "key request already outstanding");
        return Ok(None);
    }

    let signing_key = requester.keys.resolve_current(&signer, KeyPurpose::Sig)?;
    let ring_level = signing_key.record.ring_level;
    let signer = *signing_key.id();

    let reply = SecretKey::generate_encryption();
    let record = KeyRecord::new(name, &reply.public(), [KeyPurpose::Enc])
        .ring_level(ring_level)
        .permissions(Scope::none())
        .allowed_actions(Scope::none());
    let reply_key = ring.insert(reply);

    let key_add = Message::sign(
        MessageParams::next(requester),
        Op::KeyAdd(vec![Envelope::Plain(record)]),
        &requester.keys,
        signer,
        ring,
    )?;

    let reply_with = SignedData::sign(
        &requester.keys,
        signer,
        ReplyWith {
            encryption_key_id: reply_key,
            target: target.contract_id,
        },
        ring,
    )?
    .with_signing_contract(requester.contract_id)
    .to_wire(&reply_with_aad(&requester.contract_id, &target.contract_id))?;

    let body = KeyRequestBody {
        contract_id: requester.contract_id,
        height: requester.height + 1,
        reply_with,
        request: request.to_string(),
        reference: reference.map(str::to_string),
    };
    let request_op = match reference {
        None => KeyRequest::V1(body),
        Some(_) => KeyRequest::V2(Envelope::Plain(body)),
    };
    let payload = SignedData::sign(&requester.keys, signer, Op::KeyRequest(request_op), ring)?
        .with_signing_contract(requester.contract_id);
    let key_request = Message::create(MessageParams::next(target), payload, requester.keys.clone())?;

    info!(
        requester = %requester.contract_id,
        target = %target.contract_id,
        reply_key = %reply_key,
        "key request prepared"
    );
    Ok(Some(KeyRequestMessages {
        reply_key,
        key_add,
        key_request,
    }))
}

/// A key request the target is answering.
#[derive(Clone, Copy)]
pub struct ShareRequest<'a> {
    pub target: &'a ContractState,
    /// State of the requester at or after the request's height.
    pub requester: &'a ContractState,
    /// CID of the key-request message.
    pub request: Cid,
    /// Target key that signs the answer. Needs `ks` and `krs` permissions.
    pub signer: KeyId,
    /// Contract the shared keys belong to, if not the target.
    pub owner: Option<&'a ContractState>,
}

/// Answer a pending key request on the target's log.
///
/// When `approve` is set, the keys selected by the request string are shared:
/// `"*"` selects every current key marked shareable, anything else is a
/// comma-separated list of key names. An approval that selects nothing is
/// sent as a denial.
pub fn respond_to_key_request(
    req: ShareRequest<'_>,
    approve: bool,
    secrets: Arc<dyn SecretKeys>,
) -> Result<Message> {
    let target = req.target;
    let requester = req.requester;
    let entry = target
        .key_requests
        .get(&req.request)
        .ok_or_else(|| ProtocolError::Structural(format!("unknown key request {}", req.request)))?;
    if entry.status != RequestStatus::Pending {
        return Err(ProtocolError::Structural(format!(
            "key request {} was already answered",
            req.request
        )));
    }
    if entry.requester != requester.contract_id {
        return Err(ProtocolError::Format(format!(
            "key request {} came from {}",
            req.request, entry.requester
        )));
    }

    let ctx = OpenContext::new(requester.keys.clone(), entry.requester_height, secrets.clone())
        .for_contract(requester.contract_id)
        .with_aad(reply_with_aad(&requester.contract_id, &target.contract_id));
    let reply = SignedData::<ReplyWith>::from_wire(entry.reply_with.clone(), ctx)
        .value()?
        .clone();
    if reply.target != target.contract_id {
        return Err(ProtocolError::Format("reply-with names another target".into()));
    }

    let owner = req.owner.unwrap_or(target);
    let selected = if approve {
        select_keys(owner, &entry.request)
    } else {
        Vec::new()
    };

    let operation = if selected.is_empty() {
        info!(target = %target.contract_id, request = %req.request, "denying key request");
        Op::KeyRequestSeen(KeyRequestSeen {
            request: req.request,
            success: false,
        })
    } else {
        let mut keys = Vec::with_capacity(selected.len());
        for record in selected {
            let secret = record.open_private(owner.keys.clone(), owner.height, KeyScope::Window, secrets.clone())?;
            keys.push(SharedSecret {
                name: record.name.clone(),
                id: record.id,
                secret: secret.serialize_secret(),
            });
        }
        let shared = keys.len();
        let material = EncryptedData::encrypt(&requester.keys, reply.encryption_key_id, SharedKeyMaterial { keys })?
            .to_wire(&share_aad(&owner.contract_id, &requester.contract_id, Some(&req.request)))?;
        info!(target = %target.contract_id, request = %req.request, shared, "sharing keys");

        Op::Atomic(vec![
            Op::KeyShare(KeyShare {
                contract_id: requester.contract_id,
                foreign_contract_id: req.owner.map(|o| o.contract_id),
                request: Some(req.request),
                keys: material,
            }),
            Op::KeyRequestSeen(KeyRequestSeen {
                request: req.request,
                success: true,
            }),
        ])
    };

    Message::sign(MessageParams::next(target), operation, &target.keys, req.signer, secrets.as_ref())
}

/// Current keys of `owner` selected by `request`. Only keys whose private
/// half is marked shareable are ever selected.
fn select_keys<'a>(owner: &'a ContractState, request: &str) -> Vec<&'a KeyRecord> {
    let shareable = |record: &KeyRecord| record.private.as_ref().is_some_and(|p| p.shareable);
    let selected: Vec<&KeyRecord> = if request.trim() == "*" {
        owner.keys.current().map(|k| &k.record).collect()
    } else {
        request
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .filter_map(|name| owner.keys.current_by_name(name))
            .map(|k| &k.record)
            .collect()
    };
    selected.into_iter().filter(|r| shareable(r)).collect()
}

/// Import the secrets of a key share addressed to `requester`.
///
/// The reply key may already be revoked, so revoked keys of the requester
/// are searched too. Every shared secret must derive its claimed id, and
/// that id must be a key of `owner`.
pub fn import_key_share(
    share: &KeyShare,
    requester: &ContractState,
    owner: &ContractState,
    ring: &KeyRing,
    secrets: Arc<dyn SecretKeys>,
) -> Result<Vec<KeyId>> {
    if share.contract_id != requester.contract_id {
        return Err(ProtocolError::Format(format!(
            "key share is addressed to {}",
            share.contract_id
        )));
    }

    let owner_keys = owner.keys.clone();
    let validator: Validator<SharedKeyMaterial> = Arc::new(move |material: &SharedKeyMaterial| {
        for shared in &material.keys {
            let secret = SecretKey::parse_secret(&shared.secret)?;
            if secret.id() != shared.id {
                return Err(EnvelopeError::Rejected(format!(
                    "shared key {:?} does not derive its id",
                    shared.name
                )));
            }
            if owner_keys.get(&shared.id).is_none() {
                return Err(EnvelopeError::Rejected(format!(
                    "shared key {:?} is not a key of the owner",
                    shared.name
                )));
            }
        }
        Ok(())
    });

    let ctx = OpenContext::new(requester.keys.clone(), requester.height, secrets)
        .for_contract(requester.contract_id)
        .with_scope(KeyScope::IncludeRevoked)
        .with_aad(share_aad(&owner.contract_id, &requester.contract_id, share.request.as_ref()));
    let material = EncryptedData::from_wire(share.keys.clone(), ctx, Some(validator));

    let mut imported = Vec::new();
    for shared in &material.value()?.keys {
        let id = ring.insert_serialized(shared.secret.clone())?;
        info!(requester = %requester.contract_id, key = %id, name = %shared.name, "imported shared key");
        imported.push(id);
    }
    Ok(imported)
}

/// Revoke the reply key of a finished request.
///
/// Returns `None` if no reply key for this request is current.
pub fn complete_key_request(
    requester: &ContractState,
    target: &ContractId,
    request: &str,
    reference: Option<&str>,
    signer: KeyId,
    secrets: &dyn SecretKeys,
) -> Result<Option<Message>> {
    let name = reply_key_name(target, request, reference);
    let Some(reply) = requester.keys.current_by_name(&name) else {
        return Ok(None);
    };
    let message = Message::sign(
        MessageParams::next(requester),
        Op::KeyDel(vec![Envelope::Plain(*reply.id())]),
        &requester.keys,
        signer,
        secrets,
    )?;
    info!(requester = %requester.contract_id, %target, "completing key request");
    Ok(Some(message))
}

/// Where the (requester, target) pair stands for this request.
pub fn status(
    requester: &ContractState,
    target: &ContractState,
    request: &str,
    reference: Option<&str>,
) -> DelegationStatus {
    let name = reply_key_name(&target.contract_id, request, reference);
    if requester.keys.current_by_name(&name).is_none() {
        return DelegationStatus::None;
    }
    match target.find_request(&requester.contract_id, request, reference) {
        Some((_, entry)) => match entry.status {
            RequestStatus::Pending => DelegationStatus::Requested,
            RequestStatus::Shared => DelegationStatus::Shared,
            RequestStatus::Denied => DelegationStatus::Denied,
        },
        None => DelegationStatus::Requested,
    }
}
