//! # oplog
//!
//! Signed, append-only operation logs for contracts, with key delegation
//! between contracts.
//!
//! ## Overview
//!
//! A contract is a log of [`Message`]s. Each message carries a canonical
//! [`MessageHead`] (height, links to the previous head and previous key
//! operation) and a signed [`Operation`]. The first message creates the
//! contract and its identifier is that message's hash.
//!
//! - **Keys**: every contract keeps a key table. Key operations (`ka`, `kd`,
//!   `ku`) change it and are checked against the signer's ring level and
//!   permissions.
//! - **Actions**: application payloads, plain or encrypted. Encrypted actions
//!   whose key is not held locally are deferred, not rejected.
//! - **Delegation**: a contract asks another for keys with a key request;
//!   the answer is a key share encrypted to a single-purpose reply key.
//! - **Replay**: [`Processor`] applies one message to a prior
//!   [`ContractState`] and produces the next one, or fails without touching
//!   the prior state. [`Contracts`] does this for many contracts behind
//!   async per-contract locks.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use oplog::{Contracts, Message, ReplayConfig};
//! use oplog::core::SecretKey;
//! use oplog::keys::{Envelope, KeyPurpose, KeyRecord, KeyRing};
//!
//! async fn example() -> oplog::Result<()> {
//!     let ring = Arc::new(KeyRing::new());
//!     let signing = SecretKey::generate_signing();
//!     let record = KeyRecord::new("sig", &signing.public(), [KeyPurpose::Sig]);
//!     let signer = ring.insert(signing);
//!
//!     let genesis = Message::create_contract("notes", vec![Envelope::Plain(record)], signer, ring.as_ref())?;
//!     let contracts = Contracts::new(ReplayConfig::default(), ring);
//!     contracts.ingest(genesis.serialize()?.clone()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `oplog::core` - encoding, CIDs and key material
//! - `oplog::keys` - key tables, key rings and envelopes

pub mod collab;
pub mod config;
pub mod contracts;
pub mod delegation;
pub mod error;
pub mod head;
pub mod message;
pub mod op;
pub mod process;
pub mod state;

pub use oplog_core as core;
pub use oplog_keys as keys;

pub use collab::{KeyFetcher, MemoryKeyFetcher, MemoryOutbox, MemoryStateSource, NoFetcher, Outbox, OutgoingMessage, StateSource};
pub use config::{ProcessorConfig, ReplayConfig};
pub use contracts::{Contracts, IngestOutcome, Snapshots};
pub use delegation::DelegationStatus;
pub use error::{ErrorKind, ProtocolError, Result};
pub use head::MessageHead;
pub use message::{ForeignSigner, HeadInfo, Message, MessageParams, MessageSigner};
pub use op::{
    ActionData, AtomicOp, KeyRequest, KeyRequestBody, KeyRequestSeen, KeyShare, Op, OpShape, OpType,
    Operation, PropSet,
};
pub use process::{ActionOutcome, Applied, Processor, SideEffect};
pub use state::{ContractState, KeyRequestEntry, RequestStatus};

pub use oplog_core::{Cid, ContractId, KeyId};
