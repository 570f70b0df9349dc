//! Public and secret key material with a stable text serialization.
//!
//! Public keys serialize as `"<alg>:<hex>"` and secrets as
//! `"<alg>-secret:<hex>"`. A key's [`KeyId`] is the CID of its serialized
//! public form, so ids are stable across processes and languages.

use std::fmt;

use crate::crypto::{
    Ed25519PublicKey, Ed25519Signature, Keypair, SealedBox, X25519PublicKey, X25519StaticSecret,
};
use crate::error::{CoreError, Result};
use crate::types::KeyId;

/// Supported key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// Signing.
    Ed25519,
    /// Key agreement for sealing.
    X25519,
}

impl KeyAlgorithm {
    /// Serialization prefix.
    pub const fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::X25519 => "x25519",
        }
    }

    fn parse_prefix(s: &str) -> Result<Self> {
        match s {
            "ed25519" => Ok(KeyAlgorithm::Ed25519),
            "x25519" => Ok(KeyAlgorithm::X25519),
            other => Err(CoreError::InvalidPublicKey(format!("unknown algorithm {other:?}"))),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A public key of any supported algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicKey {
    Ed25519(Ed25519PublicKey),
    X25519(X25519PublicKey),
}

impl PublicKey {
    /// The key's algorithm.
    pub const fn algorithm(&self) -> KeyAlgorithm {
        match self {
            PublicKey::Ed25519(_) => KeyAlgorithm::Ed25519,
            PublicKey::X25519(_) => KeyAlgorithm::X25519,
        }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        match self {
            PublicKey::Ed25519(k) => k.as_bytes(),
            PublicKey::X25519(k) => k.as_bytes(),
        }
    }

    /// Text form, `"<alg>:<hex>"`.
    pub fn serialize(&self) -> String {
        format!("{}:{}", self.algorithm(), hex::encode(self.as_bytes()))
    }

    /// Parse the text form.
    pub fn parse(s: &str) -> Result<Self> {
        let (alg, body) = s
            .split_once(':')
            .ok_or_else(|| CoreError::InvalidPublicKey("missing algorithm prefix".into()))?;
        let bytes = decode_key_hex(body).map_err(CoreError::InvalidPublicKey)?;
        match KeyAlgorithm::parse_prefix(alg)? {
            KeyAlgorithm::Ed25519 => Ok(PublicKey::Ed25519(Ed25519PublicKey(bytes))),
            KeyAlgorithm::X25519 => Ok(PublicKey::X25519(X25519PublicKey(bytes))),
        }
    }

    /// The id of this key.
    pub fn id(&self) -> KeyId {
        KeyId::for_public_key(&self.serialize())
    }

    /// Verify an Ed25519 signature.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<()> {
        match self {
            PublicKey::Ed25519(k) => k.verify(message, signature),
            PublicKey::X25519(_) => Err(mismatch(KeyAlgorithm::Ed25519, self.algorithm())),
        }
    }

    /// Seal `plaintext` to this X25519 key. The key id is bound into the KDF.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox> {
        match self {
            PublicKey::X25519(k) => {
                SealedBox::seal(k, self.id().cid().to_bytes().as_slice(), plaintext, aad)
            }
            PublicKey::Ed25519(_) => Err(mismatch(KeyAlgorithm::X25519, self.algorithm())),
        }
    }
}

/// Secret key material.
#[derive(Clone)]
pub enum SecretKey {
    Signing(Keypair),
    Encryption(X25519StaticSecret),
}

impl SecretKey {
    /// Generate a fresh Ed25519 signing key.
    pub fn generate_signing() -> Self {
        SecretKey::Signing(Keypair::generate())
    }

    /// Generate a fresh X25519 encryption key.
    pub fn generate_encryption() -> Self {
        SecretKey::Encryption(X25519StaticSecret::generate())
    }

    /// Deterministic signing key from a seed.
    pub fn signing_from_seed(seed: [u8; 32]) -> Self {
        SecretKey::Signing(Keypair::from_seed(&seed))
    }

    /// Deterministic encryption key from a seed.
    pub fn encryption_from_seed(seed: [u8; 32]) -> Self {
        SecretKey::Encryption(X25519StaticSecret::from_bytes(seed))
    }

    /// The key's algorithm.
    pub const fn algorithm(&self) -> KeyAlgorithm {
        match self {
            SecretKey::Signing(_) => KeyAlgorithm::Ed25519,
            SecretKey::Encryption(_) => KeyAlgorithm::X25519,
        }
    }

    /// Matching public key.
    pub fn public(&self) -> PublicKey {
        match self {
            SecretKey::Signing(kp) => PublicKey::Ed25519(kp.public_key()),
            SecretKey::Encryption(s) => PublicKey::X25519(s.public_key()),
        }
    }

    /// Id of the matching public key.
    pub fn id(&self) -> KeyId {
        self.public().id()
    }

    /// Text form, `"<alg>-secret:<hex>"`.
    pub fn serialize_secret(&self) -> String {
        let bytes = match self {
            SecretKey::Signing(kp) => kp.seed(),
            SecretKey::Encryption(s) => s.to_bytes(),
        };
        format!("{}-secret:{}", self.algorithm(), hex::encode(bytes))
    }

    /// Parse the secret text form.
    pub fn parse_secret(s: &str) -> Result<Self> {
        let (alg, body) = s
            .split_once("-secret:")
            .ok_or_else(|| CoreError::InvalidSecretKey("missing secret prefix".into()))?;
        let bytes = decode_key_hex(body).map_err(CoreError::InvalidSecretKey)?;
        match KeyAlgorithm::parse_prefix(alg).map_err(|e| CoreError::InvalidSecretKey(e.to_string()))? {
            KeyAlgorithm::Ed25519 => Ok(SecretKey::signing_from_seed(bytes)),
            KeyAlgorithm::X25519 => Ok(SecretKey::encryption_from_seed(bytes)),
        }
    }

    /// Sign with an Ed25519 key.
    pub fn sign(&self, message: &[u8]) -> Result<Ed25519Signature> {
        match self {
            SecretKey::Signing(kp) => Ok(kp.sign(message)),
            SecretKey::Encryption(_) => Err(mismatch(KeyAlgorithm::Ed25519, self.algorithm())),
        }
    }

    /// Open a box sealed to this key's public half.
    pub fn open(&self, sealed: &SealedBox, aad: &[u8]) -> Result<Vec<u8>> {
        match self {
            SecretKey::Encryption(s) => {
                sealed.open(s, self.id().cid().to_bytes().as_slice(), aad)
            }
            SecretKey::Signing(_) => Err(mismatch(KeyAlgorithm::X25519, self.algorithm())),
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({}, {:?})", self.algorithm(), self.id())
    }
}

fn mismatch(expected: KeyAlgorithm, actual: KeyAlgorithm) -> CoreError {
    CoreError::AlgorithmMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

/// Key text is lowercase hex only, so one key has one text form and one id.
fn decode_key_hex(body: &str) -> std::result::Result<[u8; 32], String> {
    if body.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err("key hex must be lowercase".into());
    }
    let bytes = hex::decode(body).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("expected 32 bytes, got {}", b.len()))
}
