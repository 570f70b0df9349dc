//! # oplog core
//!
//! Pure primitives for oplog: canonical encoding, content identifiers and key
//! material.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over byte strings and keys.
//!
//! ## Key Types
//!
//! - [`Cid`] - Content identifier (blake3 digest tagged with a codec)
//! - [`ContractId`] - CID of a contract's creation message
//! - [`KeyId`] - CID of a serialized public key
//! - [`PublicKey`] / [`SecretKey`] - Ed25519 signing and X25519 sealing keys
//!
//! ## Canonicalization
//!
//! Everything that is hashed or signed is encoded with deterministic CBOR.
//! See the [`canonical`] module.

pub mod canonical;
pub mod cid;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod types;

pub use canonical::{from_canonical_bytes, to_canonical_bytes};
pub use cid::{Cid, CONTRACT_DATA_CODEC, KEY_CODEC};
pub use crypto::{Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair, SealedBox};
pub use error::{CoreError, Result};
pub use keys::{KeyAlgorithm, PublicKey, SecretKey};
pub use types::{ContractId, KeyId};
