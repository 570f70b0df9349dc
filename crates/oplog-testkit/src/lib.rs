//! # oplog testkit
//!
//! Testing utilities for oplog.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: unencrypted messages from seeded keys, whose bytes
//!   and CIDs must be identical across implementations
//! - **Generators**: proptest strategies for keys, capabilities and operations
//! - **Fixtures**: single-contract logs and multi-party nodes
//!
//! ## Golden Vectors
//!
//! ```rust
//! use oplog_testkit::vectors::{all_vectors, messages_from_vector};
//!
//! for vector in all_vectors() {
//!     let messages = messages_from_vector(&vector).unwrap();
//!     println!("{}: {}", vector.name, messages[0].hash().unwrap());
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use oplog_testkit::generators::Capabilities;
//!
//! proptest! {
//!     #[test]
//!     fn covers_itself(caps: Capabilities) {
//!         prop_assert!(caps.covers(&caps));
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use oplog_testkit::fixtures::TestLog;
//!
//! let log = TestLog::new(1, Vec::new()).unwrap();
//! assert_eq!(log.state.height, 0);
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{creation_keys, deliver, replay, seed, SharedKey, TestContract, TestLog, TestNode};
pub use generators::Capabilities;
pub use vectors::{all_vectors, export_json, messages_from_vector, verify_all_vectors, GoldenVector};
