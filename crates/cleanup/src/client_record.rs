//! Client record / lease partitioner
//!
//! A single well-known document per bucket tracks which client
//! processes are alive. Every client upserts its heartbeat there
//! periodically and evicts peers whose lease lapsed; shard ownership
//! for the cleanup sweep is then computed locally from the sorted
//! membership with no coordination traffic: shard `i` belongs to the
//! client at rank `i mod numActiveClients`.
//!
//! Membership is approximate and eventually consistent. Two clients
//! may transiently both believe they own a shard; that is tolerated
//! because every cleanup action is idempotent and CAS-guarded.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tandem_core::{
    epoch_millis, Cas, CleanupConfig, ClientId, ClientRecordDoc, ClientRecordEntry, CollectionRef,
    DocId, Error, Result, RetryPolicy,
};
use tandem_storage::KvStore;
use tracing::{debug, info, warn};

/// Key of the shared client record document
pub const CLIENT_RECORD_KEY: &str = "_txn:client-record";

/// Derived view of the client record after one heartbeat
///
/// Everything the sweeper needs to partition the ATR shards: the
/// sorted live membership, this client's rank within it, the peers
/// evicted by this heartbeat (their half-finished sweeps get priority
/// attention), and whether the manual override is in force.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecordDetails {
    /// Sorted ids of all currently-live clients (this one included)
    pub active_client_ids: Vec<String>,
    /// This client's rank within `active_client_ids`
    pub index_of_this_client: usize,
    /// Number of live clients
    pub num_active_clients: usize,
    /// Ids evicted by this heartbeat pass
    pub expired_client_ids: Vec<String>,
    /// Whether the manual cleanup override is currently active
    pub override_active: bool,
}

impl ClientRecordDetails {
    /// Whether this client owns the given ATR shard
    pub fn owns_shard(&self, shard: usize) -> bool {
        self.num_active_clients > 0 && shard % self.num_active_clients == self.index_of_this_client
    }

    /// All shards this client owns out of `num_atrs`
    pub fn owned_shards(&self, num_atrs: usize) -> Vec<usize> {
        (0..num_atrs).filter(|s| self.owns_shard(*s)).collect()
    }
}

/// This client's handle on the shared client record
pub struct ClientRecord {
    kv: Arc<dyn KvStore>,
    doc: DocId,
    client_id: ClientId,
    config: CleanupConfig,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClientRecord {
    /// Create a handle for `client_id` over the record in
    /// `metadata_collection`
    pub fn new(
        kv: Arc<dyn KvStore>,
        metadata_collection: CollectionRef,
        client_id: ClientId,
        config: CleanupConfig,
    ) -> Self {
        Self {
            kv,
            doc: DocId::new(metadata_collection, CLIENT_RECORD_KEY),
            client_id,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// This client's id
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Read the record, refreshing transient failures
    fn read_record(&self, policy: &RetryPolicy) -> Result<(ClientRecordDoc, Cas)> {
        let raw = policy.run("client_record.read", || match self.kv.read_doc(&self.doc) {
            Ok(found) => Ok(Some(found)),
            Err(Error::DocNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        })?;

        match raw {
            None => Ok((ClientRecordDoc::default(), Cas::ZERO)),
            Some((value, cas)) => match serde_json::from_value(value) {
                Ok(record) => Ok((record, cas)),
                Err(e) => {
                    // A corrupt record must not brick the fleet: start
                    // over and let the CAS write replace it
                    warn!(doc = %self.doc, error = %e, "client record unparsable, resetting");
                    Ok((ClientRecordDoc::default(), cas))
                }
            },
        }
    }

    /// Heartbeat: upsert this client, evict stale peers, derive details
    ///
    /// One CAS loop over the whole document: read, evict every entry
    /// whose lease lapsed, write our own fresh timestamp, CAS-write
    /// back. Losing the CAS re-reads and repeats, bounded by the fixed
    /// background cap so a heartbeat can never block indefinitely.
    pub fn heartbeat(&self) -> Result<ClientRecordDetails> {
        let policy = RetryPolicy::for_background();
        let mut round = 0u32;
        loop {
            let (mut record, cas) = self.read_record(&policy)?;
            let now = epoch_millis();

            let expired: Vec<String> = record
                .expired_ids(now)
                .into_iter()
                .filter(|id| *id != self.client_id.to_string())
                .collect();
            for id in &expired {
                record.clients.remove(id);
            }

            // A lapsed override is cleared rather than left stale, so a
            // forgotten override can never disable distributed cleanup
            // permanently
            if record.override_enabled && now >= record.override_expires {
                record.override_enabled = false;
                record.override_expires = 0;
            }

            record.clients.insert(
                self.client_id.to_string(),
                ClientRecordEntry {
                    heartbeat_timestamp: now,
                    expiry_duration_ms: self.config.client_expiry.as_millis() as u64,
                },
            );
            let override_active = record.override_active(now);
            let body = serde_json::to_value(&record)?;

            match self.kv.write_doc(&self.doc, cas, body) {
                Ok(_) => {
                    let active_client_ids: Vec<String> = record.clients.keys().cloned().collect();
                    let index_of_this_client = active_client_ids
                        .iter()
                        .position(|id| *id == self.client_id.to_string())
                        .expect("own entry was just inserted");
                    if !expired.is_empty() {
                        info!(
                            client_id = %self.client_id,
                            evicted = expired.len(),
                            "evicted expired clients from client record"
                        );
                    }
                    return Ok(ClientRecordDetails {
                        num_active_clients: active_client_ids.len(),
                        index_of_this_client,
                        active_client_ids,
                        expired_client_ids: expired,
                        override_active,
                    });
                }
                Err(Error::CasMismatch { .. }) if !policy.deadline_passed() => {
                    debug!(client_id = %self.client_id, round, "client record CAS contention");
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(e) if e.is_transient() && !policy.deadline_passed() => {
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove this client's registration on graceful shutdown
    ///
    /// Peers would evict the entry after its lease anyway; this just
    /// lets them reshuffle shard ownership immediately.
    pub fn deregister(&self) -> Result<()> {
        let policy = RetryPolicy::for_background();
        let mut round = 0u32;
        loop {
            let (mut record, cas) = self.read_record(&policy)?;
            if cas.is_zero() || !record.clients.contains_key(&self.client_id.to_string()) {
                return Ok(());
            }
            record.clients.remove(&self.client_id.to_string());

            match self.kv.write_doc(&self.doc, cas, serde_json::to_value(&record)?) {
                Ok(_) => {
                    info!(client_id = %self.client_id, "deregistered from client record");
                    return Ok(());
                }
                Err(Error::CasMismatch { .. }) if !policy.deadline_passed() => {
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(e) if e.is_transient() && !policy.deadline_passed() => {
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Operator control: enable or disable the manual cleanup override
    ///
    /// While enabled and unexpired, all clients except the designated
    /// holder stop sweeping. The expiry bounds the blast radius of a
    /// forgotten override.
    pub fn set_override(&self, enabled: bool, expires_at_ms: u64) -> Result<()> {
        let policy = RetryPolicy::for_background();
        let mut round = 0u32;
        loop {
            let (mut record, cas) = self.read_record(&policy)?;
            record.override_enabled = enabled;
            record.override_expires = if enabled { expires_at_ms } else { 0 };

            match self.kv.write_doc(&self.doc, cas, serde_json::to_value(&record)?) {
                Ok(_) => {
                    info!(enabled, expires_at_ms, "cleanup override updated");
                    return Ok(());
                }
                Err(Error::CasMismatch { .. }) if !policy.deadline_passed() => {
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(e) if e.is_transient() && !policy.deadline_passed() => {
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Start the background heartbeat loop
    ///
    /// One long-lived thread per client process, regardless of how many
    /// attempts it runs. The loop exits promptly after `shutdown()`,
    /// which also joins it.
    pub fn start(self: &Arc<Self>) {
        let record = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.heartbeat_interval;

        let handle = thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                if let Err(e) = record.heartbeat() {
                    warn!(client_id = %record.client_id, error = %e, "heartbeat failed");
                }

                // Sleep in small increments to notice shutdown quickly
                let step = Duration::from_millis(100).min(interval);
                let mut elapsed = Duration::ZERO;
                while elapsed < interval {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(step);
                    elapsed += step;
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Signal the heartbeat loop to stop and join it
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Whether shutdown has been signaled
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
