//! Error types for envelopes and key authorization.

use oplog_core::{ContractId, CoreError, KeyId};
use thiserror::Error;

/// Errors raised while building, verifying or decrypting envelopes.
///
/// `Clone` so a lazily evaluated envelope can report the same failure to
/// every reader. Only successful results are memoized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Malformed envelope or payload bytes.
    #[error("malformed envelope: {0}")]
    Format(String),

    /// The signature did not verify.
    #[error("invalid signature by key {0}")]
    Signature(KeyId),

    /// The signing key exists but may not sign here.
    #[error("signing key {key} not authorized at height {height}: {reason}")]
    SignatureKeyUnauthorized {
        key: KeyId,
        height: u64,
        reason: String,
    },

    /// The signing key is not in the key table.
    #[error("signing key {0} not found")]
    SignatureKeyNotFound(KeyId),

    /// The signing key belongs to a contract whose state is not known
    /// locally yet.
    #[error("no state for signing contract {0}")]
    ForeignStateUnavailable(ContractId),

    /// Ciphertext invalid, wrong algorithm, or key not usable.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// No secret for this key is available locally. May succeed later.
    #[error("decryption key {0} not available")]
    DecryptionKeyNotFound(KeyId),

    /// Signing was attempted without additional authenticated data.
    #[error("signing requires non-empty additional authenticated data")]
    MissingAad,

    /// No current key could stand in for the requested one.
    #[error("no current {purpose} key can replace {key}")]
    NoCurrentKey { key: KeyId, purpose: String },

    /// The local key ring has no secret for a key we must sign with.
    #[error("secret for key {0} is not available")]
    SecretUnavailable(KeyId),

    /// A validator rejected the decrypted value.
    #[error("decrypted value rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for envelope operations.
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Errors raised by key-table mutations and capability checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermsError {
    /// A capability check failed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A key record is malformed or inconsistent.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The referenced key is not in the table.
    #[error("key not found: {0}")]
    KeyNotFound(KeyId),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Core(#[from] CoreError),
}
