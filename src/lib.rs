//! Tandem: client-coordinated multi-document transactions for
//! distributed key-value stores
//!
//! Tandem provides ACID-like multi-document transactions over a KV
//! store that has no native multi-document primitive. Many independent
//! client processes can start, commit, roll back, and — critically —
//! recover each other's abandoned transaction attempts without a
//! central coordinator, using only linearizable single-document
//! compare-and-swap as the synchronization primitive.
//!
//! The moving parts:
//! - Each attempt stages its writes invisibly and tracks progress in an
//!   Active Transaction Record (ATR) entry; one CAS on that entry is
//!   the commit decision.
//! - Every client process runs a background sweeper that finds expired
//!   or orphaned attempts in the ATR shards it owns and drives them to
//!   completion on behalf of their (possibly dead) owner.
//! - Shard ownership is computed locally from a shared heartbeat
//!   document: shard `i` belongs to the live client at rank
//!   `i mod numActiveClients`. No coordination traffic, self-stabilizing
//!   under churn.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use tandem::{
//!     CleanupConfig, CollectionRef, DocId, MemoryKvStore, TransactionConfig, TransactionId,
//!     Transactions,
//! };
//!
//! let kv = Arc::new(MemoryKvStore::new());
//! let txns = Transactions::new(
//!     kv,
//!     TransactionConfig {
//!         metadata_collection: CollectionRef::default_in("travel"),
//!         ..TransactionConfig::default()
//!     },
//!     CleanupConfig::default(),
//! );
//!
//! let doc = DocId::new(CollectionRef::default_in("travel"), "hotel-1");
//! let mut attempt = txns.begin_attempt(TransactionId::new(), None);
//! attempt.stage_insert(&doc, json!({"name": "Sea View"})).unwrap();
//! attempt.commit().unwrap();
//!
//! txns.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub use tandem_cleanup::{ClientRecord, ClientRecordDetails, SweepStats, Sweeper, CLIENT_RECORD_KEY};
pub use tandem_coordinator::{
    crc32_of_body, AtrStore, AttemptContext, AttemptStatus, DocumentStaging, Resolution, Resolver,
    SelectionReason, ATR_KEY_PREFIX,
};
pub use tandem_core::{
    epoch_millis, AtrEntry, AttemptId, AttemptState, Cas, CleanupConfig, ClientId,
    ClientRecordDoc, ClientRecordEntry, CollectionRef, DocId, DocRecord, Error, OperationType,
    Result, RetryPolicy, StagedOperation, StagingMetadata, TransactionConfig, TransactionId,
};
pub use tandem_storage::{DocSnapshot, KvStore, MemoryKvStore};

/// The per-process transaction context
///
/// One `Transactions` instance per client process wires together the
/// KV handle, this process's client identity, the ATR access, the
/// heartbeat loop, and the cleanup sweeper. There are no process-wide
/// singletons: everything hangs off this object and is dropped with
/// it.
pub struct Transactions {
    kv: Arc<dyn KvStore>,
    config: TransactionConfig,
    client_id: ClientId,
    atr: AtrStore,
    client_record: Arc<ClientRecord>,
    sweeper: Arc<Sweeper>,
}

impl Transactions {
    /// Create a context over the given store
    pub fn new(kv: Arc<dyn KvStore>, config: TransactionConfig, cleanup: CleanupConfig) -> Self {
        let client_id = ClientId::new();
        let atr = AtrStore::new(
            kv.clone(),
            config.metadata_collection.clone(),
            config.num_atrs,
        );
        let client_record = Arc::new(ClientRecord::new(
            kv.clone(),
            config.metadata_collection.clone(),
            client_id,
            cleanup.clone(),
        ));
        let resolver = Resolver::new(kv.clone(), atr.clone());
        let sweeper = Arc::new(Sweeper::new(
            atr.clone(),
            resolver,
            Arc::clone(&client_record),
            cleanup,
        ));
        Self {
            kv,
            config,
            client_id,
            atr,
            client_record,
            sweeper,
        }
    }

    /// This process's client id, as registered in the client record
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The KV handle this context runs against
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Begin a new transaction attempt
    ///
    /// `expiry` defaults to the configured attempt expiry. The returned
    /// handle drives staging, commit, and rollback; it is not shared
    /// between threads.
    pub fn begin_attempt(
        &self,
        transaction_id: TransactionId,
        expiry: Option<Duration>,
    ) -> AttemptContext {
        AttemptContext::new(
            transaction_id,
            self.client_id,
            expiry.unwrap_or(self.config.expiry),
            self.kv.clone(),
            self.atr.clone(),
        )
    }

    /// Heartbeat the client record and return the derived details
    pub fn heartbeat(&self) -> Result<ClientRecordDetails> {
        self.client_record.heartbeat()
    }

    /// Run one cleanup pass synchronously
    pub fn run_sweep_once(&self) -> Result<SweepStats> {
        self.sweeper.run_sweep_once()
    }

    /// Start the background cleanup sweeper
    pub fn start_sweeper(&self) {
        self.sweeper.start();
    }

    /// Stop and join the background cleanup sweeper
    pub fn stop_sweeper(&self) {
        self.sweeper.shutdown();
    }

    /// Start the background heartbeat loop
    pub fn start_heartbeat(&self) {
        self.client_record.start();
    }

    /// Stop and join the background heartbeat loop
    pub fn stop_heartbeat(&self) {
        self.client_record.shutdown();
    }

    /// Operator control: pin all cleanup to the designated client
    ///
    /// The override expires automatically at `expires_at_ms` so a
    /// stale override cannot permanently disable distributed cleanup.
    pub fn set_cleanup_override(&self, enabled: bool, expires_at_ms: u64) -> Result<()> {
        self.client_record.set_override(enabled, expires_at_ms)
    }

    /// Remove this client from the client record
    pub fn deregister(&self) -> Result<()> {
        self.client_record.deregister()
    }

    /// Stop background loops and deregister
    ///
    /// Best-effort: a failed deregistration is logged, not surfaced —
    /// peers evict the stale entry after its lease anyway.
    pub fn shutdown(&self) {
        self.sweeper.shutdown();
        self.client_record.shutdown();
        if let Err(e) = self.client_record.deregister() {
            warn!(client_id = %self.client_id, error = %e, "deregistration failed during shutdown");
        }
    }
}
