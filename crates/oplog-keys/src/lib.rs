//! # oplog keys
//!
//! Key authorization and envelopes for oplog contracts.
//!
//! ## Overview
//!
//! Each contract keeps a [`KeyTable`] of authorized keys. A key has a ring
//! level (a capability ceiling), purposes (`sig`, `enc`, `sak`), permission
//! and action scopes, and a validity window in contract heights.
//!
//! Data moves through [`Envelope`]s: plain, signed ([`SignedData`]) or
//! encrypted ([`EncryptedData`]), nested in any order. Incoming envelopes are
//! checked lazily against an [`OpenContext`] (key table snapshot, height,
//! AAD) and cache their result once it succeeds.
//!
//! Mutations of a key table are checked by the functions in [`validate`]
//! before they are applied.

pub mod envelope;
pub mod error;
pub mod keyring;
pub mod record;
pub mod table;
pub mod validate;

pub use envelope::{
    EncryptedData, EncryptedWire, Envelope, EnvelopeWire, Open, OpenContext, Seal, SignedData,
    SignedWire, UnsignedMeta, Validator,
};
pub use error::{EnvelopeError, PermsError};
pub use keyring::{KeyMaterial, KeyRing, NoSecrets, SecretKeys};
pub use record::{ForeignKeyRef, KeyPurpose, KeyRecord, KeyUpdate, PrivateKeyMaterial, Scope};
pub use table::{AuthorizedKey, ForeignTables, KeyScope, KeyTable};
pub use validate::{KeyEffect, PrivateCheck};
