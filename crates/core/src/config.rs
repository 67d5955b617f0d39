//! Configuration for the transaction coordinator
//!
//! Two plain structs with `Default` impls: `TransactionConfig` for the
//! attempt path and `CleanupConfig` for the background machinery. The
//! heartbeat/lease/grace timing constants are an operational tuning
//! choice, not a correctness invariant, so all of them are configurable.

use crate::types::CollectionRef;
use std::time::Duration;

/// Configuration for transaction attempts
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Number of ATR documents per collection (the shard count)
    ///
    /// Attempt placement is `crc32(attemptId) mod num_atrs`, so every
    /// client in a fleet must agree on this value.
    pub num_atrs: usize,

    /// Keyspace holding the ATR documents and the client record
    pub metadata_collection: CollectionRef,

    /// Default expiry for an attempt that does not specify one
    ///
    /// Past this deadline the owner refuses further writes and cedes
    /// resolution to the cleanup sweepers.
    pub expiry: Duration,

    /// Timeout applied to each individual KV operation
    pub kv_timeout: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            num_atrs: 128,
            metadata_collection: CollectionRef::default_in("default"),
            expiry: Duration::from_secs(15),
            kv_timeout: Duration::from_millis(2_500),
        }
    }
}

/// Configuration for the cleanup sweeper and heartbeat loop
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How often the background sweeper scans its owned ATR shards
    pub sweep_interval: Duration,

    /// How often this client refreshes its client-record heartbeat
    ///
    /// Must be comfortably below `client_expiry` or peers will keep
    /// declaring this client dead between heartbeats.
    pub heartbeat_interval: Duration,

    /// Lease duration written with each heartbeat
    ///
    /// A client whose last heartbeat is older than this is treated as
    /// dead by every observer.
    pub client_expiry: Duration,

    /// Extra time a terminal ATR entry lingers before garbage collection
    ///
    /// Measured from the entry's own expiry, so an owner finishing its
    /// last transition never finds the entry already removed.
    pub entry_grace: Duration,

    /// Whether this client keeps sweeping while the manual cleanup
    /// override is active
    ///
    /// The client record persists only the override switch and its
    /// expiry; which single client stays active is designated
    /// operationally by starting it with this flag.
    pub override_holder: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(2_500),
            client_expiry: Duration::from_secs(30),
            entry_grace: Duration::from_secs(60),
            override_holder: false,
        }
    }
}
