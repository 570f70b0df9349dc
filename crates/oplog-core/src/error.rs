//! Error types for oplog core primitives.

use thiserror::Error;

/// Errors raised by the pure primitives: encoding, identifiers and keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("key algorithm mismatch: expected {expected}, got {actual}")]
    AlgorithmMismatch { expected: String, actual: String },

    #[error("invalid content identifier: {0}")]
    InvalidCid(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("non-canonical encoding")]
    NonCanonical,

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
