//! Lease-based cleanup coordination
//!
//! A fleet of uncoordinated clients partitions cleanup responsibility
//! deterministically through a single shared document:
//! - `client_record`: heartbeat registration, stale-peer eviction, and
//!   the rank-based shard assignment
//! - `sweeper`: the background pass that finds abandoned attempts in
//!   this client's shards and drives them to completion

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client_record;
pub mod sweeper;

pub use client_record::{ClientRecord, ClientRecordDetails, CLIENT_RECORD_KEY};
pub use sweeper::{SweepStats, Sweeper};
