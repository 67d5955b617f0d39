//! KV collaborator contract and in-memory implementation
//!
//! The coordinator consumes the underlying distributed KV store as an
//! abstract operation set (`KvStore`): reads, CAS-guarded writes,
//! staged-value mutation, and sub-document operations on metadata
//! documents. `MemoryKvStore` is a linearizable in-process
//! implementation used by the test suite and by embedders without a
//! cluster.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod traits;

pub use memory::MemoryKvStore;
pub use traits::{DocSnapshot, KvStore};
