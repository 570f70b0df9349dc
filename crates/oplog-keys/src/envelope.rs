//! Signed, encrypted and plain envelopes.
//!
//! An envelope is either outgoing (built locally, sealed when its wire form
//! is requested) or incoming (parsed from bytes, verified or decrypted on the
//! first call to `value()`). Incoming envelopes close over an
//! [`OpenContext`]: the key table snapshot, height and AAD they are checked
//! against. Only successful results are cached, so a missing decryption key
//! can be supplied later and the read retried.
//!
//! Wire form (canonical CBOR):
//!
//! ```text
//! {"p": bstr}                                   plain
//! {"s": {"k": keyId, "d": bstr, "s": bstr, "u"?: meta}}   signed
//! {"e": {"k": keyId, "e": bstr, "n": bstr, "c": bstr}}    encrypted
//! ```
//!
//! Signatures cover `blake3(blake3(aad) || blake3(data))`.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

use oplog_core::canonical::{from_canonical_bytes, to_canonical_bytes};
use oplog_core::crypto::{EncryptionNonce, SealedBox, X25519PublicKey};
use oplog_core::{Blake3Hash, ContractId, Ed25519Signature, KeyId, PublicKey, SecretKey};

use crate::error::{EnvelopeError, Result};
use crate::keyring::SecretKeys;
use crate::record::KeyPurpose;
use crate::table::{ForeignTables, KeyScope, KeyTable};

/// Values that can be written into an envelope.
pub trait Seal {
    /// Canonical bytes of this value. Nested envelopes are sealed under `aad`.
    fn seal(&self, aad: &[u8]) -> Result<Vec<u8>>;
}

/// Values that can be read out of an envelope.
pub trait Open: Sized {
    fn open(bytes: &[u8], ctx: &OpenContext) -> Result<Self>;
}

/// Implement [`Seal`] and [`Open`] for plain serde types.
#[macro_export]
macro_rules! plain_envelope_data {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::envelope::Seal for $ty {
            fn seal(&self, _aad: &[u8]) -> $crate::error::Result<::std::vec::Vec<u8>> {
                $crate::envelope::encode_plain(self)
            }
        }

        impl $crate::envelope::Open for $ty {
            fn open(
                bytes: &[u8],
                _ctx: &$crate::envelope::OpenContext,
            ) -> $crate::error::Result<Self> {
                $crate::envelope::decode_plain(bytes)
            }
        }
    )+};
}

#[doc(hidden)]
pub fn encode_plain<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(to_canonical_bytes(value)?)
}

#[doc(hidden)]
pub fn decode_plain<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    from_canonical_bytes(bytes).map_err(|e| EnvelopeError::Format(e.to_string()))
}

plain_envelope_data!(KeyId);

/// What an incoming envelope is checked against.
#[derive(Clone)]
pub struct OpenContext {
    contract_id: Option<ContractId>,
    keys: Arc<KeyTable>,
    height: u64,
    scope: KeyScope,
    aad: Bytes,
    secrets: Arc<dyn SecretKeys>,
    foreign: Option<Arc<dyn ForeignTables>>,
}

impl OpenContext {
    pub fn new(keys: Arc<KeyTable>, height: u64, secrets: Arc<dyn SecretKeys>) -> Self {
        Self {
            contract_id: None,
            keys,
            height,
            scope: KeyScope::Window,
            aad: Bytes::new(),
            secrets,
            foreign: None,
        }
    }

    pub fn for_contract(mut self, contract_id: ContractId) -> Self {
        self.contract_id = Some(contract_id);
        self
    }

    pub fn with_aad(mut self, aad: impl Into<Bytes>) -> Self {
        self.aad = aad.into();
        self
    }

    pub fn with_scope(mut self, scope: KeyScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_foreign(mut self, foreign: Arc<dyn ForeignTables>) -> Self {
        self.foreign = Some(foreign);
        self
    }

    pub fn contract_id(&self) -> Option<&ContractId> {
        self.contract_id.as_ref()
    }

    pub fn keys(&self) -> &Arc<KeyTable> {
        &self.keys
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn scope(&self) -> KeyScope {
        self.scope
    }

    pub fn aad(&self) -> &[u8] {
        &self.aad
    }

    pub fn secrets(&self) -> &Arc<dyn SecretKeys> {
        &self.secrets
    }

    pub fn foreign(&self) -> Option<&Arc<dyn ForeignTables>> {
        self.foreign.as_ref()
    }
}

impl fmt::Debug for OpenContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenContext")
            .field("contract_id", &self.contract_id)
            .field("height", &self.height)
            .field("scope", &self.scope)
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

/// Metadata carried next to a signature but not covered by it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedMeta {
    /// Contract whose key table holds the signing key, when it is not the
    /// contract the envelope appears in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_contract_id: Option<ContractId>,
}

impl UnsignedMeta {
    pub fn is_empty(&self) -> bool {
        self.signing_contract_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedWire {
    #[serde(rename = "k")]
    pub key_id: KeyId,
    #[serde(rename = "d")]
    pub data: Bytes,
    #[serde(rename = "s")]
    pub signature: Bytes,
    #[serde(rename = "u", default, skip_serializing_if = "UnsignedMeta::is_empty")]
    pub meta: UnsignedMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedWire {
    #[serde(rename = "k")]
    pub key_id: KeyId,
    #[serde(rename = "e")]
    pub ephemeral: Bytes,
    #[serde(rename = "n")]
    pub nonce: Bytes,
    #[serde(rename = "c")]
    pub ciphertext: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeWire {
    #[serde(rename = "p")]
    Plain(Bytes),
    #[serde(rename = "s")]
    Signed(SignedWire),
    #[serde(rename = "e")]
    Encrypted(EncryptedWire),
}

impl EnvelopeWire {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_plain(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_plain(self)
    }
}

/// The digest a signature covers.
pub fn signing_digest(aad: &[u8], data: &[u8]) -> Blake3Hash {
    let aad_hash = Blake3Hash::hash(aad);
    let data_hash = Blake3Hash::hash(data);
    Blake3Hash::hash_parts(&[aad_hash.as_bytes(), data_hash.as_bytes()])
}

/// A value with a detached signature.
pub struct SignedData<T> {
    state: SignedState<T>,
}

enum SignedState<T> {
    Outgoing {
        key_id: KeyId,
        signer: SecretKey,
        value: T,
        meta: UnsignedMeta,
    },
    Incoming {
        wire: SignedWire,
        ctx: OpenContext,
        verified: OnceLock<T>,
    },
}

impl<T> SignedData<T> {
    /// Prepare `value` for signing with `key_id` from `table`.
    ///
    /// A revoked key is replaced by the current `sig` key with the same
    /// name. The signature itself is made when the wire form is produced.
    pub fn sign(table: &KeyTable, key_id: KeyId, value: T, secrets: &dyn SecretKeys) -> Result<Self> {
        let key = table.resolve_current(&key_id, KeyPurpose::Sig)?;
        let key_id = *key.id();
        let signer = secrets
            .secret(&key_id)
            .ok_or(EnvelopeError::SecretUnavailable(key_id))?;
        Ok(Self {
            state: SignedState::Outgoing {
                key_id,
                signer,
                value,
                meta: UnsignedMeta::default(),
            },
        })
    }

    /// Record that the signing key belongs to another contract.
    pub fn with_signing_contract(mut self, contract: ContractId) -> Self {
        if let SignedState::Outgoing { meta, .. } = &mut self.state {
            meta.signing_contract_id = Some(contract);
        }
        self
    }

    /// Wrap an incoming wire form. Nothing is verified yet.
    pub fn from_wire(wire: SignedWire, ctx: OpenContext) -> Self {
        Self {
            state: SignedState::Incoming {
                wire,
                ctx,
                verified: OnceLock::new(),
            },
        }
    }

    /// Id of the signing key.
    pub fn key_id(&self) -> &KeyId {
        match &self.state {
            SignedState::Outgoing { key_id, .. } => key_id,
            SignedState::Incoming { wire, .. } => &wire.key_id,
        }
    }

    pub fn meta(&self) -> &UnsignedMeta {
        match &self.state {
            SignedState::Outgoing { meta, .. } => meta,
            SignedState::Incoming { wire, .. } => &wire.meta,
        }
    }

    pub fn is_outgoing(&self) -> bool {
        matches!(self.state, SignedState::Outgoing { .. })
    }
}

impl<T: Open> SignedData<T> {
    /// The signed value, verifying on first access.
    pub fn value(&self) -> Result<&T> {
        match &self.state {
            SignedState::Outgoing { value, .. } => Ok(value),
            SignedState::Incoming { wire, ctx, verified } => {
                if let Some(value) = verified.get() {
                    return Ok(value);
                }
                let value = verify_wire(wire, ctx)?;
                Ok(verified.get_or_init(|| value))
            }
        }
    }

    pub fn verify(&self) -> Result<()> {
        self.value().map(|_| ())
    }
}

/// Verify a signed wire form against the context.
///
/// A key of another contract is looked up in that contract's latest known
/// table and only its `sig` purpose is checked here. Its validity window
/// depends on the height the signed content names, so the caller checks it
/// with [`KeyTable::authorize_signing`] once the content is read.
fn verify_wire<T: Open>(wire: &SignedWire, ctx: &OpenContext) -> Result<T> {
    let foreign_table;
    let key = match wire.meta.signing_contract_id {
        Some(signer) if ctx.contract_id != Some(signer) => {
            let (table, _) = ctx
                .foreign
                .as_ref()
                .and_then(|f| f.snapshot(&signer))
                .ok_or(EnvelopeError::ForeignStateUnavailable(signer))?;
            foreign_table = table;
            let key = foreign_table
                .get(&wire.key_id)
                .ok_or(EnvelopeError::SignatureKeyNotFound(wire.key_id))?;
            if !key.record.has_purpose(KeyPurpose::Sig) {
                return Err(EnvelopeError::SignatureKeyUnauthorized {
                    key: wire.key_id,
                    height: ctx.height,
                    reason: "key lacks the sig purpose".into(),
                });
            }
            key
        }
        _ => ctx.keys.authorize_signing(&wire.key_id, ctx.height)?,
    };

    let public = key
        .record
        .public_key()
        .map_err(|e| EnvelopeError::Format(e.to_string()))?;
    let signature =
        Ed25519Signature::from_slice(&wire.signature).map_err(|_| EnvelopeError::Signature(wire.key_id))?;

    let digest = signing_digest(&ctx.aad, &wire.data);
    public
        .verify(digest.as_bytes(), &signature)
        .map_err(|_| EnvelopeError::Signature(wire.key_id))?;

    T::open(&wire.data, ctx)
}

impl<T: Seal> SignedData<T> {
    /// Wire form. Outgoing envelopes are signed under `aad`, which must be
    /// non-empty.
    pub fn to_wire(&self, aad: &[u8]) -> Result<SignedWire> {
        match &self.state {
            SignedState::Outgoing {
                key_id,
                signer,
                value,
                meta,
            } => {
                if aad.is_empty() {
                    return Err(EnvelopeError::MissingAad);
                }
                let data = value.seal(aad)?;
                let digest = signing_digest(aad, &data);
                let signature = signer.sign(digest.as_bytes())?;
                Ok(SignedWire {
                    key_id: *key_id,
                    data: data.into(),
                    signature: Bytes::copy_from_slice(signature.as_bytes()),
                    meta: meta.clone(),
                })
            }
            SignedState::Incoming { wire, .. } => Ok(wire.clone()),
        }
    }
}

impl<T: Seal> Seal for SignedData<T> {
    fn seal(&self, aad: &[u8]) -> Result<Vec<u8>> {
        EnvelopeWire::Signed(self.to_wire(aad)?).encode()
    }
}

impl<T: Open> Open for SignedData<T> {
    fn open(bytes: &[u8], ctx: &OpenContext) -> Result<Self> {
        match EnvelopeWire::decode(bytes)? {
            EnvelopeWire::Signed(wire) => Ok(Self::from_wire(wire, ctx.clone())),
            _ => Err(EnvelopeError::Format("expected a signed envelope".into())),
        }
    }
}

impl<T> fmt::Debug for SignedData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            SignedState::Outgoing { key_id, .. } => write!(f, "SignedData::Outgoing({key_id:?})"),
            SignedState::Incoming { wire, verified, .. } => write!(
                f,
                "SignedData::Incoming({:?}, verified={})",
                wire.key_id,
                verified.get().is_some()
            ),
        }
    }
}

/// Extra check run on a decrypted value before it is accepted.
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// A value encrypted to one of a contract's `enc` keys.
pub struct EncryptedData<T> {
    state: EncryptedState<T>,
}

enum EncryptedState<T> {
    Outgoing {
        key_id: KeyId,
        recipient: PublicKey,
        value: T,
    },
    Incoming {
        wire: EncryptedWire,
        ctx: OpenContext,
        validator: Option<Validator<T>>,
        decrypted: OnceLock<T>,
    },
}

impl<T> EncryptedData<T> {
    /// Prepare `value` for encryption to `key_id` from `table`.
    ///
    /// A revoked key is replaced by the current `enc` key with the same name.
    pub fn encrypt(table: &KeyTable, key_id: KeyId, value: T) -> Result<Self> {
        let key = table.resolve_current(&key_id, KeyPurpose::Enc)?;
        let recipient = key
            .record
            .public_key()
            .map_err(|e| EnvelopeError::Format(e.to_string()))?;
        Ok(Self {
            state: EncryptedState::Outgoing {
                key_id: *key.id(),
                recipient,
                value,
            },
        })
    }

    /// Wrap an incoming wire form. Nothing is decrypted yet.
    pub fn from_wire(wire: EncryptedWire, ctx: OpenContext, validator: Option<Validator<T>>) -> Self {
        Self {
            state: EncryptedState::Incoming {
                wire,
                ctx,
                validator,
                decrypted: OnceLock::new(),
            },
        }
    }

    pub fn key_id(&self) -> &KeyId {
        match &self.state {
            EncryptedState::Outgoing { key_id, .. } => key_id,
            EncryptedState::Incoming { wire, .. } => &wire.key_id,
        }
    }
}

impl<T: Open> EncryptedData<T> {
    /// The plaintext value, decrypting on first access.
    pub fn value(&self) -> Result<&T> {
        match &self.state {
            EncryptedState::Outgoing { value, .. } => Ok(value),
            EncryptedState::Incoming {
                wire,
                ctx,
                validator,
                decrypted,
            } => {
                if let Some(value) = decrypted.get() {
                    return Ok(value);
                }
                let value = decrypt_wire(wire, ctx, validator.as_ref())?;
                Ok(decrypted.get_or_init(|| value))
            }
        }
    }

    /// Best-effort read: any failure yields `None`.
    pub fn value_or_none(&self) -> Option<&T> {
        self.value().ok()
    }
}

fn decrypt_wire<T: Open>(
    wire: &EncryptedWire,
    ctx: &OpenContext,
    validator: Option<&Validator<T>>,
) -> Result<T> {
    let key = ctx
        .keys
        .authorize_decryption(&wire.key_id, ctx.height, ctx.scope)?;
    let secret = ctx
        .secrets
        .secret(key.id())
        .ok_or(EnvelopeError::DecryptionKeyNotFound(wire.key_id))?;

    let malformed = |e: oplog_core::CoreError| EnvelopeError::Decryption(e.to_string());
    let sealed = SealedBox {
        ephemeral: X25519PublicKey::from_slice(&wire.ephemeral).map_err(malformed)?,
        nonce: EncryptionNonce::from_slice(&wire.nonce).map_err(malformed)?,
        ciphertext: wire.ciphertext.to_vec(),
    };
    let plaintext = secret.open(&sealed, &ctx.aad).map_err(malformed)?;

    let value = T::open(&plaintext, ctx)?;
    if let Some(validate) = validator {
        validate(&value)?;
    }
    Ok(value)
}

impl<T: Seal> EncryptedData<T> {
    /// Wire form. Outgoing envelopes are encrypted with `aad` bound into the tag.
    pub fn to_wire(&self, aad: &[u8]) -> Result<EncryptedWire> {
        match &self.state {
            EncryptedState::Outgoing {
                key_id,
                recipient,
                value,
            } => {
                let plaintext = value.seal(aad)?;
                let sealed = recipient.seal(&plaintext, aad)?;
                Ok(EncryptedWire {
                    key_id: *key_id,
                    ephemeral: Bytes::copy_from_slice(sealed.ephemeral.as_bytes()),
                    nonce: Bytes::copy_from_slice(sealed.nonce.as_bytes()),
                    ciphertext: sealed.ciphertext.into(),
                })
            }
            EncryptedState::Incoming { wire, .. } => Ok(wire.clone()),
        }
    }
}

impl<T: Seal> Seal for EncryptedData<T> {
    fn seal(&self, aad: &[u8]) -> Result<Vec<u8>> {
        EnvelopeWire::Encrypted(self.to_wire(aad)?).encode()
    }
}

impl<T: Open> Open for EncryptedData<T> {
    fn open(bytes: &[u8], ctx: &OpenContext) -> Result<Self> {
        match EnvelopeWire::decode(bytes)? {
            EnvelopeWire::Encrypted(wire) => Ok(Self::from_wire(wire, ctx.clone(), None)),
            _ => Err(EnvelopeError::Format("expected an encrypted envelope".into())),
        }
    }
}

impl<T> fmt::Debug for EncryptedData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            EncryptedState::Outgoing { key_id, .. } => write!(f, "EncryptedData::Outgoing({key_id:?})"),
            EncryptedState::Incoming { wire, decrypted, .. } => write!(
                f,
                "EncryptedData::Incoming({:?}, decrypted={})",
                wire.key_id,
                decrypted.get().is_some()
            ),
        }
    }
}

/// A value that may be signed, encrypted, both in any nesting, or neither.
///
/// Decrypting an `Encrypted` envelope whose plaintext is a signed envelope
/// yields `Signed` again, so signature checks survive encryption.
pub enum Envelope<T> {
    Plain(T),
    Signed(SignedData<T>),
    Encrypted(Box<EncryptedData<Envelope<T>>>),
}

impl<T> Envelope<T> {
    /// Encrypt an envelope to `key_id` of `table`.
    pub fn encrypted(table: &KeyTable, key_id: KeyId, inner: Envelope<T>) -> Result<Self> {
        Ok(Envelope::Encrypted(Box::new(EncryptedData::encrypt(table, key_id, inner)?)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Plain(_) => "plain",
            Envelope::Signed(_) => "signed",
            Envelope::Encrypted(_) => "encrypted",
        }
    }
}

impl<T: Open> Envelope<T> {
    /// The innermost value, verifying and decrypting as needed.
    pub fn value(&self) -> Result<&T> {
        match self {
            Envelope::Plain(value) => Ok(value),
            Envelope::Signed(signed) => signed.value(),
            Envelope::Encrypted(encrypted) => encrypted.value()?.value(),
        }
    }
}

impl<T: Seal> Seal for Envelope<T> {
    fn seal(&self, aad: &[u8]) -> Result<Vec<u8>> {
        match self {
            Envelope::Plain(value) => EnvelopeWire::Plain(value.seal(aad)?.into()).encode(),
            Envelope::Signed(signed) => signed.seal(aad),
            Envelope::Encrypted(encrypted) => encrypted.seal(aad),
        }
    }
}

impl<T: Open> Open for Envelope<T> {
    fn open(bytes: &[u8], ctx: &OpenContext) -> Result<Self> {
        Ok(match EnvelopeWire::decode(bytes)? {
            EnvelopeWire::Plain(data) => Envelope::Plain(T::open(&data, ctx)?),
            EnvelopeWire::Signed(wire) => Envelope::Signed(SignedData::from_wire(wire, ctx.clone())),
            EnvelopeWire::Encrypted(wire) => {
                Envelope::Encrypted(Box::new(EncryptedData::from_wire(wire, ctx.clone(), None)))
            }
        })
    }
}

impl<T> fmt::Debug for Envelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Plain(_) => f.write_str("Envelope::Plain"),
            Envelope::Signed(signed) => signed.fmt(f),
            Envelope::Encrypted(encrypted) => encrypted.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::KeyRing;
    use crate::record::KeyRecord;
    use oplog_core::{Cid, CONTRACT_DATA_CODEC};
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    crate::plain_envelope_data!(Note);

    fn note(text: &str) -> Note {
        Note { text: text.into() }
    }

    struct Fixture {
        table: KeyTable,
        ring: Arc<KeyRing>,
        sig: KeyId,
        enc: KeyId,
    }

    fn fixture() -> Fixture {
        let ring = Arc::new(KeyRing::new());
        let sig = SecretKey::generate_signing();
        let enc = SecretKey::generate_encryption();
        let table = KeyTable::bootstrap(
            [
                KeyRecord::new("sig", &sig.public(), [KeyPurpose::Sig]),
                KeyRecord::new("enc", &enc.public(), [KeyPurpose::Enc]),
            ],
            0,
        )
        .unwrap();
        Fixture {
            table,
            sig: ring.insert(sig),
            enc: ring.insert(enc),
            ring,
        }
    }

    impl Fixture {
        fn ctx(&self, height: u64, aad: &'static [u8]) -> OpenContext {
            OpenContext::new(Arc::new(self.table.clone()), height, self.ring.clone())
                .with_aad(Bytes::from_static(aad))
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let fx = fixture();
        let signed = SignedData::sign(&fx.table, fx.sig, note("hi"), fx.ring.as_ref()).unwrap();
        let bytes = signed.seal(b"head").unwrap();

        let incoming = SignedData::<Note>::open(&bytes, &fx.ctx(1, b"head")).unwrap();
        assert!(!incoming.is_outgoing());
        assert_eq!(incoming.value().unwrap(), &note("hi"));

        // Different AAD breaks the signature.
        let other = SignedData::<Note>::open(&bytes, &fx.ctx(1, b"tail")).unwrap();
        assert_eq!(other.value().unwrap_err(), EnvelopeError::Signature(fx.sig));
    }

    #[test]
    fn test_signing_requires_aad() {
        let fx = fixture();
        let signed = SignedData::sign(&fx.table, fx.sig, note("hi"), fx.ring.as_ref()).unwrap();
        assert_eq!(signed.to_wire(b"").unwrap_err(), EnvelopeError::MissingAad);
    }

    #[test]
    fn test_tampered_data_fails() {
        let fx = fixture();
        let signed = SignedData::sign(&fx.table, fx.sig, note("hi"), fx.ring.as_ref()).unwrap();
        let mut wire = signed.to_wire(b"head").unwrap();
        wire.data = encode_plain(&note("bye")).unwrap().into();

        let incoming = SignedData::<Note>::from_wire(wire, fx.ctx(1, b"head"));
        assert!(matches!(incoming.value(), Err(EnvelopeError::Signature(_))));
    }

    #[test]
    fn test_signature_outside_window() {
        let mut fx = fixture();
        let signed = SignedData::sign(&fx.table, fx.sig, note("hi"), fx.ring.as_ref()).unwrap();
        let wire = signed.to_wire(b"head").unwrap();

        fx.table.revoke(&fx.sig, 4).unwrap();
        let ok = SignedData::<Note>::from_wire(wire.clone(), fx.ctx(3, b"head"));
        assert!(ok.value().is_ok());

        let late = SignedData::<Note>::from_wire(wire, fx.ctx(4, b"head"));
        assert!(matches!(
            late.value(),
            Err(EnvelopeError::SignatureKeyUnauthorized { height: 4, .. })
        ));
    }

    #[test]
    fn test_signing_substitutes_rotated_key() {
        let mut fx = fixture();
        fx.table.revoke(&fx.sig, 1).unwrap();
        let next = SecretKey::generate_signing();
        fx.table
            .insert(KeyRecord::new("sig", &next.public(), [KeyPurpose::Sig]), 1)
            .unwrap();
        let next_id = fx.ring.insert(next);

        let signed = SignedData::sign(&fx.table, fx.sig, note("hi"), fx.ring.as_ref()).unwrap();
        assert_eq!(signed.key_id(), &next_id);
    }

    #[test]
    fn test_missing_decryption_key_is_retryable() {
        let fx = fixture();
        let encrypted = EncryptedData::encrypt(&fx.table, fx.enc, note("secret")).unwrap();
        let bytes = encrypted.seal(b"head").unwrap();

        let enc_secret = fx.ring.secret(&fx.enc).unwrap();
        fx.ring.remove(&fx.enc);

        let incoming = EncryptedData::<Note>::open(&bytes, &fx.ctx(1, b"head")).unwrap();
        assert_eq!(
            incoming.value().unwrap_err(),
            EnvelopeError::DecryptionKeyNotFound(fx.enc)
        );

        fx.ring.insert(enc_secret);
        assert_eq!(incoming.value().unwrap(), &note("secret"));
    }

    #[test]
    fn test_decrypt_binds_aad() {
        let fx = fixture();
        let encrypted = EncryptedData::encrypt(&fx.table, fx.enc, note("secret")).unwrap();
        let bytes = encrypted.seal(b"head").unwrap();

        let incoming = EncryptedData::<Note>::open(&bytes, &fx.ctx(1, b"other")).unwrap();
        assert!(matches!(incoming.value(), Err(EnvelopeError::Decryption(_))));
    }

    #[test]
    fn test_validator_can_reject() {
        let fx = fixture();
        let wire = EncryptedData::encrypt(&fx.table, fx.enc, note("secret"))
            .unwrap()
            .to_wire(b"head")
            .unwrap();

        let validator: Validator<Note> =
            Arc::new(|n: &Note| Err(EnvelopeError::Rejected(format!("no {}", n.text))));
        let incoming = EncryptedData::from_wire(wire, fx.ctx(1, b"head"), Some(validator));
        assert_eq!(
            incoming.value().unwrap_err(),
            EnvelopeError::Rejected("no secret".into())
        );
        assert!(incoming.value_or_none().is_none());
    }

    #[test]
    fn test_revoked_key_needs_include_revoked_scope() {
        let mut fx = fixture();
        let wire = EncryptedData::encrypt(&fx.table, fx.enc, note("old"))
            .unwrap()
            .to_wire(b"share")
            .unwrap();
        fx.table.revoke(&fx.enc, 2).unwrap();

        let windowed = EncryptedData::<Note>::from_wire(wire.clone(), fx.ctx(5, b"share"), None);
        assert!(matches!(windowed.value(), Err(EnvelopeError::Decryption(_))));

        let revoked = EncryptedData::<Note>::from_wire(
            wire,
            fx.ctx(5, b"share").with_scope(KeyScope::IncludeRevoked),
            None,
        );
        assert_eq!(revoked.value().unwrap(), &note("old"));
    }

    #[test]
    fn test_signed_inside_encrypted_is_rewrapped() {
        let fx = fixture();
        let signed = SignedData::sign(&fx.table, fx.sig, note("nested"), fx.ring.as_ref()).unwrap();
        let envelope = Envelope::encrypted(&fx.table, fx.enc, Envelope::Signed(signed)).unwrap();
        let bytes = envelope.seal(b"head").unwrap();

        let incoming = Envelope::<Note>::open(&bytes, &fx.ctx(1, b"head")).unwrap();
        assert_eq!(incoming.kind(), "encrypted");
        let Envelope::Encrypted(encrypted) = &incoming else {
            panic!("expected encrypted envelope");
        };
        assert_eq!(encrypted.value().unwrap().kind(), "signed");
        assert_eq!(incoming.value().unwrap(), &note("nested"));
    }

    #[test]
    fn test_plain_envelope() {
        let fx = fixture();
        let bytes = Envelope::Plain(note("open")).seal(b"").unwrap();
        let incoming = Envelope::<Note>::open(&bytes, &fx.ctx(0, b"")).unwrap();
        assert_eq!(incoming.value().unwrap(), &note("open"));
        assert!(SignedData::<Note>::open(&bytes, &fx.ctx(0, b"")).is_err());
    }

    struct Tables(HashMap<ContractId, (Arc<KeyTable>, u64)>);

    impl ForeignTables for Tables {
        fn snapshot(&self, contract: &ContractId) -> Option<(Arc<KeyTable>, u64)> {
            self.0.get(contract).cloned()
        }
    }

    #[test]
    fn test_foreign_signer_checked_against_its_table() {
        let home = fixture();
        let foreign = fixture();
        let foreign_id = ContractId::from_cid(Cid::compute(CONTRACT_DATA_CODEC, b"foreign")).unwrap();

        let wire = SignedData::sign(&foreign.table, foreign.sig, note("x"), foreign.ring.as_ref())
            .unwrap()
            .with_signing_contract(foreign_id)
            .to_wire(b"head")
            .unwrap();
        assert_eq!(wire.meta.signing_contract_id, Some(foreign_id));

        // Without the foreign table the key cannot be found yet.
        let unresolved = SignedData::<Note>::from_wire(wire.clone(), home.ctx(1, b"head"));
        assert_eq!(
            unresolved.value().unwrap_err(),
            EnvelopeError::ForeignStateUnavailable(foreign_id)
        );

        let tables = Tables(HashMap::from([(
            foreign_id,
            (Arc::new(foreign.table.clone()), 1),
        )]));
        let resolved = SignedData::<Note>::from_wire(
            wire,
            home.ctx(1, b"head").with_foreign(Arc::new(tables)),
        );
        assert_eq!(resolved.value().unwrap(), &note("x"));
    }
}
