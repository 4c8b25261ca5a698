//! Multi-version key-value store for optimistic parallel execution of a block.
//!
//! Transactions of a block execute concurrently against a tentative order. Each
//! incarnation runs against a [vistore::VersionIndexedStore] that sees the writes of
//! lower transactions through the shared [mvstore::MultiVersionStore] and records its
//! reads, writes and iterations. After publishing, an incarnation is validated against
//! the current versions; if what it observed changed, its writes become estimates and
//! it is executed again.
//!
//! The [executor::Executor] drives a whole block with a collaborative
//! [scheduler::Scheduler]. Embedders with their own scheduler can use the store
//! directly:
//!
//! ```rust
//! use bytes::Bytes;
//! use mvs_rs::{memdb::MemDb, mvstore::MultiVersionStore, types::Version};
//! use std::sync::Arc;
//!
//! let mvs = Arc::new(MultiVersionStore::new(Arc::new(MemDb::new())));
//!
//! // Transaction 2 writes x
//! let writer = mvs.versioned_indexed_store(Version::new(2, 0));
//! writer.set(Bytes::from("x"), Bytes::from("1")).unwrap();
//! writer.write_to_multiversion_store();
//!
//! // Transaction 5 observes it
//! let reader = mvs.versioned_indexed_store(Version::new(5, 0));
//! assert_eq!(reader.get(b"x").unwrap(), Some(Bytes::from("1")));
//! reader.write_to_multiversion_store();
//! assert!(mvs.validate_transaction_state(5).valid);
//!
//! // Transaction 2 must be re-executed: 5 no longer validates
//! mvs.invalidate(2);
//! let validation = mvs.validate_transaction_state(5);
//! assert!(!validation.valid);
//! assert!(validation.conflicts.contains(&2));
//! ```

pub mod error;
pub mod executor;
pub mod iterator;
pub mod memdb;
pub mod mvstore;
pub mod mvvalue;
pub mod scheduler;
pub mod types;
pub mod vistore;

pub use error::Error;
