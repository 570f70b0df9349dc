//! Error types for operation processing.

use oplog_core::{ContractId, CoreError, KeyId};
use oplog_keys::{EnvelopeError, PermsError};
use thiserror::Error;

/// Coarse classification of a [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed head or payload.
    Format,
    /// Cryptographic signature check failed.
    Signature,
    /// Signing key found but outside its window or missing `sig`.
    SignatureKeyUnauthorized,
    /// Signing key not in the table.
    SignatureKeyNotFound,
    /// Ciphertext invalid or key unusable.
    Decryption,
    /// No local secret for the key. May be resolved by fetching it.
    DecryptionKeyNotFound,
    /// Capability escalation or a disallowed operation.
    Permission,
    /// Structural rule broken, e.g. nested atomics.
    Structural,
    /// An external collaborator failed, or state of another contract is
    /// not available yet.
    Collaborator,
    /// A predecessor of the message has not been applied yet.
    OutOfOrder,
    /// The contract stopped processing after an earlier fatal error.
    Quarantined,
}

/// Errors that can occur while building or applying messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Format(String),

    #[error("structural violation: {0}")]
    Structural(String),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("key authorization error: {0}")]
    Perms(#[from] PermsError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// No prior state is available for a non-creation message.
    #[error("no state for contract {0}")]
    MissingState(ContractId),

    /// The message is ahead of the contract: some earlier height is missing.
    #[error("message at height {got} of contract {contract} arrived before height {expected}")]
    OutOfOrder { contract: ContractId, expected: u64, got: u64 },

    #[error("contract {contract} is quarantined: {reason}")]
    Quarantined { contract: ContractId, reason: String },

    #[error("collaborator failed: {0}")]
    Collaborator(#[from] anyhow::Error),
}

impl ProtocolError {
    /// The error's kind in the protocol taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Format(_) | ProtocolError::Core(_) => ErrorKind::Format,
            ProtocolError::Structural(_) => ErrorKind::Structural,
            ProtocolError::Envelope(e) => envelope_kind(e),
            ProtocolError::Perms(e) => perms_kind(e),
            ProtocolError::MissingState(_) | ProtocolError::Collaborator(_) => ErrorKind::Collaborator,
            ProtocolError::OutOfOrder { .. } => ErrorKind::OutOfOrder,
            ProtocolError::Quarantined { .. } => ErrorKind::Quarantined,
        }
    }

    /// Whether retrying later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DecryptionKeyNotFound | ErrorKind::Collaborator | ErrorKind::OutOfOrder
        )
    }

    /// Whether the error signals a malicious or broken peer, so the
    /// contract's log should not be processed further.
    pub fn is_fatal_for_contract(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Format
                | ErrorKind::Signature
                | ErrorKind::SignatureKeyUnauthorized
                | ErrorKind::SignatureKeyNotFound
                | ErrorKind::Permission
                | ErrorKind::Structural
        )
    }

    /// The key whose secret was missing, for a `DecryptionKeyNotFound` error.
    pub fn missing_key(&self) -> Option<KeyId> {
        match self {
            ProtocolError::Envelope(EnvelopeError::DecryptionKeyNotFound(id))
            | ProtocolError::Perms(PermsError::Envelope(EnvelopeError::DecryptionKeyNotFound(id))) => {
                Some(*id)
            }
            _ => None,
        }
    }
}

fn envelope_kind(e: &EnvelopeError) -> ErrorKind {
    match e {
        EnvelopeError::Format(_) | EnvelopeError::Core(_) => ErrorKind::Format,
        EnvelopeError::Signature(_) => ErrorKind::Signature,
        EnvelopeError::SignatureKeyUnauthorized { .. } => ErrorKind::SignatureKeyUnauthorized,
        EnvelopeError::SignatureKeyNotFound(_) => ErrorKind::SignatureKeyNotFound,
        EnvelopeError::Decryption(_) | EnvelopeError::Rejected(_) => ErrorKind::Decryption,
        EnvelopeError::DecryptionKeyNotFound(_) => ErrorKind::DecryptionKeyNotFound,
        EnvelopeError::ForeignStateUnavailable(_) => ErrorKind::Collaborator,
        EnvelopeError::MissingAad => ErrorKind::Structural,
        EnvelopeError::NoCurrentKey { .. } | EnvelopeError::SecretUnavailable(_) => {
            ErrorKind::Permission
        }
    }
}

fn perms_kind(e: &PermsError) -> ErrorKind {
    match e {
        PermsError::PermissionDenied(_) | PermsError::InvalidKey(_) | PermsError::KeyNotFound(_) => {
            ErrorKind::Permission
        }
        PermsError::Envelope(inner) => envelope_kind(inner),
        PermsError::Core(_) => ErrorKind::Format,
    }
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use oplog_core::SecretKey;

    #[test]
    fn test_missing_key_is_recoverable_not_fatal() {
        let id = SecretKey::generate_encryption().id();
        let err = ProtocolError::from(EnvelopeError::DecryptionKeyNotFound(id));
        assert_eq!(err.kind(), ErrorKind::DecryptionKeyNotFound);
        assert!(err.is_recoverable());
        assert!(!err.is_fatal_for_contract());
        assert_eq!(err.missing_key(), Some(id));

        let terminal = ProtocolError::from(EnvelopeError::Decryption("bad tag".into()));
        assert!(!terminal.is_recoverable());
    }

    #[test]
    fn test_escalation_is_fatal() {
        let err = ProtocolError::from(PermsError::PermissionDenied("ring".into()));
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(err.is_fatal_for_contract());

        let nested = ProtocolError::from(PermsError::Envelope(EnvelopeError::Signature(
            SecretKey::generate_signing().id(),
        )));
        assert_eq!(nested.kind(), ErrorKind::Signature);
    }

    #[test]
    fn test_unknown_foreign_signer_is_recoverable() {
        let contract = ContractId::from_cid(oplog_core::Cid::compute(oplog_core::CONTRACT_DATA_CODEC, b"x")).unwrap();
        let err = ProtocolError::from(EnvelopeError::ForeignStateUnavailable(contract));
        assert_eq!(err.kind(), ErrorKind::Collaborator);
        assert!(err.is_recoverable());
        assert!(!err.is_fatal_for_contract());

        let gap = ProtocolError::OutOfOrder {
            contract,
            expected: 1,
            got: 2,
        };
        assert!(gap.is_recoverable());
        assert!(!gap.is_fatal_for_contract());
    }

    #[test]
    fn test_collaborator_failures() {
        let err = ProtocolError::from(anyhow::anyhow!("connection reset"));
        assert_eq!(err.kind(), ErrorKind::Collaborator);
        assert!(err.is_recoverable());
    }
}
