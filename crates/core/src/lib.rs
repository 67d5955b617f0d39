//! Core types for the Tandem transaction coordinator
//!
//! This crate defines the foundational pieces used throughout the system:
//! - AttemptId / TransactionId / ClientId: uuid-backed identifiers
//! - CollectionRef / DocId / Cas: document addressing and CAS tokens
//! - AttemptState: the monotonic attempt state machine
//! - AtrEntry / StagingMetadata / ClientRecordDoc: persisted layouts
//! - Error: the error taxonomy and `Result` alias
//! - RetryPolicy: the shared backoff policy
//! - TransactionConfig / CleanupConfig: configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use config::{CleanupConfig, TransactionConfig};
pub use error::{Error, Result};
pub use retry::{RetryPolicy, DEFAULT_RETRY_CAP, DEFAULT_RETRY_CEILING, DEFAULT_RETRY_FLOOR};
pub use types::{
    epoch_millis, AtrEntry, AttemptId, AttemptState, Cas, ClientId, ClientRecordDoc,
    ClientRecordEntry, CollectionRef, DocId, DocRecord, OperationType, StagedOperation,
    StagingMetadata, TransactionId,
};
