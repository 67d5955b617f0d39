//! Transaction attempt lifecycle over a distributed KV store
//!
//! This crate holds the protocol core:
//! - `staging`: reads/writes the visible and in-flight state of single
//!   documents, plus the idempotent roll-forward / roll-back helpers
//! - `atr`: pure data access to the Active Transaction Records
//! - `attempt`: the attempt state machine (stage / commit / rollback)
//! - `resolver`: resolution of abandoned attempts, shared with the
//!   cleanup sweeper

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod atr;
pub mod attempt;
pub mod resolver;
pub mod staging;

pub use atr::{AtrStore, ATR_KEY_PREFIX};
pub use attempt::{AttemptContext, AttemptStatus};
pub use resolver::{Resolution, Resolver, SelectionReason};
pub use staging::{crc32_of_body, DocumentStaging};
