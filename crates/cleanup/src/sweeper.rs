//! Cleanup sweeper
//!
//! Every client process runs one background sweeper. Each pass
//! heartbeats the client record, computes which ATR shards this client
//! owns, scans them for attempts that are expired or whose owner is
//! dead, and drives each one to its terminal state exactly as the
//! owner would have. Terminal entries past their grace period are
//! garbage-collected from the ATR.
//!
//! Cleanup is best-effort and infinitely retried: failures are logged
//! and picked up again on the next pass, never surfaced to any
//! application caller. A pass is cancellable between entries but never
//! mid-resolution of a single entry.

use crate::client_record::{ClientRecord, ClientRecordDetails};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tandem_core::{epoch_millis, AtrEntry, CleanupConfig, Result, RetryPolicy};
use tandem_coordinator::{AtrStore, Resolution, Resolver, SelectionReason};
use tracing::{debug, info, warn};

/// Counters from one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// ATR shards scanned
    pub shards_scanned: usize,
    /// Non-terminal entries examined
    pub entries_examined: usize,
    /// Entries selected and resolved to COMPLETED
    pub rolled_forward: usize,
    /// Entries selected and resolved to ROLLED_BACK
    pub rolled_back: usize,
    /// Entries another actor resolved first
    pub already_resolved: usize,
    /// Terminal entries garbage-collected
    pub entries_removed: usize,
    /// Failures left for the next pass
    pub failures: usize,
}

impl SweepStats {
    /// Total entries this pass acted on
    pub fn resolved(&self) -> usize {
        self.rolled_forward + self.rolled_back
    }
}

/// Background sweeper for abandoned transaction attempts
pub struct Sweeper {
    atr: AtrStore,
    resolver: Resolver,
    client_record: Arc<ClientRecord>,
    config: CleanupConfig,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Create a sweeper over the given ATR access and client record
    pub fn new(
        atr: AtrStore,
        resolver: Resolver,
        client_record: Arc<ClientRecord>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            atr,
            resolver,
            client_record,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Run one sweep pass synchronously
    ///
    /// Heartbeats first so shard ownership reflects the latest
    /// membership, then scans every owned shard. Per-entry failures are
    /// counted, logged, and retried on the next pass.
    pub fn run_sweep_once(&self) -> Result<SweepStats> {
        let details = self.client_record.heartbeat()?;
        let mut stats = SweepStats::default();

        if details.override_active && !self.config.override_holder {
            debug!("cleanup override active; this client skips sweeping");
            return Ok(stats);
        }

        let shards: Vec<usize> = if details.override_active {
            // Designated holder sweeps everything while the override
            // is in force
            (0..self.atr.num_atrs()).collect()
        } else {
            details.owned_shards(self.atr.num_atrs())
        };

        let now = epoch_millis();
        for shard in shards {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.sweep_shard(shard, now, &details, &mut stats);
            stats.shards_scanned += 1;
        }

        if stats.resolved() > 0 || stats.failures > 0 {
            info!(
                shards = stats.shards_scanned,
                rolled_forward = stats.rolled_forward,
                rolled_back = stats.rolled_back,
                removed = stats.entries_removed,
                failures = stats.failures,
                "sweep pass finished"
            );
        }
        Ok(stats)
    }

    fn sweep_shard(
        &self,
        shard: usize,
        now: u64,
        details: &ClientRecordDetails,
        stats: &mut SweepStats,
    ) {
        let entries = match self.atr.list_entries(shard) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(shard, error = %e, "failed to list ATR entries");
                stats.failures += 1;
                return;
            }
        };

        for (entry, cas) in entries {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }

            if entry.state.is_terminal() {
                if self.past_grace(&entry, now) {
                    match self.atr.remove_entry(&entry.attempt_id, &RetryPolicy::for_background()) {
                        Ok(()) => stats.entries_removed += 1,
                        Err(e) => {
                            warn!(attempt_id = %entry.attempt_id, error = %e, "entry GC failed");
                            stats.failures += 1;
                        }
                    }
                }
                continue;
            }

            stats.entries_examined += 1;
            let Some(reason) = self.selection_reason(&entry, now, details) else {
                continue;
            };

            // Resolution runs to a safe stopping point even if shutdown
            // is signaled meanwhile
            let policy = RetryPolicy::for_background();
            match self.resolver.resolve(&entry, cas, &policy) {
                Ok(resolution) => {
                    info!(
                        attempt_id = %entry.attempt_id,
                        %reason,
                        ?resolution,
                        "cleaned up abandoned attempt"
                    );
                    match resolution {
                        Resolution::RolledForward => stats.rolled_forward += 1,
                        Resolution::RolledBack => stats.rolled_back += 1,
                        Resolution::AlreadyResolved => stats.already_resolved += 1,
                    }
                }
                Err(e) => {
                    // Best-effort: the entry stays put and the next
                    // pass tries again
                    warn!(attempt_id = %entry.attempt_id, %reason, error = %e, "cleanup failed");
                    stats.failures += 1;
                }
            }
        }
    }

    /// Why an entry qualifies for cleanup, if it does
    fn selection_reason(
        &self,
        entry: &AtrEntry,
        now: u64,
        details: &ClientRecordDetails,
    ) -> Option<SelectionReason> {
        if let Some(owner) = entry.client_uuid {
            // Fast path: the owner's lease lapsed, no need to wait out
            // the attempt's own expiry
            if details.expired_client_ids.contains(&owner.to_string()) {
                return Some(SelectionReason::OwnerDead);
            }
        }
        if entry.has_expired(now) {
            return Some(SelectionReason::Expired);
        }
        None
    }

    fn past_grace(&self, entry: &AtrEntry, now: u64) -> bool {
        let grace = self.config.entry_grace.as_millis() as u64;
        now >= entry
            .start_timestamp
            .saturating_add(entry.expiry_duration_ms)
            .saturating_add(grace)
    }

    /// Start the background sweep loop
    ///
    /// One long-lived thread per client process. Pass failures are
    /// logged and retried next interval; the loop never escalates.
    pub fn start(self: &Arc<Self>) {
        let sweeper = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.sweep_interval;

        let handle = thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                // Sleep first so a just-started fleet doesn't stampede
                // the ATRs before doing any work
                let step = Duration::from_millis(100).min(interval);
                let mut elapsed = Duration::ZERO;
                while elapsed < interval {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(step);
                    elapsed += step;
                }

                if let Err(e) = sweeper.run_sweep_once() {
                    warn!(error = %e, "sweep pass failed");
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Signal the sweep loop to stop and join it
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tandem_core::{
        AttemptId, AttemptState, Cas, ClientId, CollectionRef, DocId, DocRecord, OperationType,
        StagedOperation, TransactionId,
    };
    use tandem_coordinator::DocumentStaging;
    use tandem_storage::{KvStore, MemoryKvStore};

    struct Fixture {
        kv: Arc<MemoryKvStore>,
        atr: AtrStore,
        staging: DocumentStaging,
        sweeper: Sweeper,
    }

    fn setup_with(config: CleanupConfig) -> Fixture {
        let kv = Arc::new(MemoryKvStore::new());
        let collection = CollectionRef::default_in("travel");
        let atr = AtrStore::new(kv.clone() as Arc<dyn KvStore>, collection.clone(), 4);
        let client_record = Arc::new(ClientRecord::new(
            kv.clone() as Arc<dyn KvStore>,
            collection,
            ClientId::new(),
            config.clone(),
        ));
        let resolver = Resolver::new(kv.clone() as Arc<dyn KvStore>, atr.clone());
        Fixture {
            staging: DocumentStaging::new(kv.clone() as Arc<dyn KvStore>),
            sweeper: Sweeper::new(atr.clone(), resolver, client_record, config),
            kv,
            atr,
        }
    }

    fn setup() -> Fixture {
        setup_with(CleanupConfig::default())
    }

    /// Plant an abandoned attempt: a staged insert plus an ATR entry in
    /// `state`, with the entry's own expiry already elapsed or not
    fn plant_abandoned(
        fx: &Fixture,
        state: AttemptState,
        owner: ClientId,
        expired: bool,
    ) -> (AttemptId, DocId) {
        let policy = RetryPolicy::for_background();
        let now = epoch_millis();
        let (start, expiry_ms) = if expired {
            (now.saturating_sub(60_000), 1_000)
        } else {
            (now, 600_000)
        };

        let mut entry = AtrEntry::new(AttemptId::new(), TransactionId::new(), owner, start, expiry_ms);
        let doc = DocId::new(
            CollectionRef::default_in("travel"),
            format!("doc-{}", entry.attempt_id),
        );
        entry.record_document(OperationType::Insert, DocRecord::from_doc_id(&doc));

        let op = StagedOperation::Insert(json!({"orphaned": true}));
        let meta = fx.staging.build_metadata(
            entry.attempt_id,
            &fx.atr.doc_id_for(&entry.attempt_id),
            &op,
            None,
        );
        fx.staging.stage(&doc, Cas::ZERO, meta, &policy).unwrap();

        let cas = fx.atr.create_entry(&entry, &policy).unwrap();
        if state == AttemptState::Committed {
            fx.atr
                .transition_state(
                    &entry.attempt_id,
                    cas,
                    AttemptState::Pending,
                    AttemptState::Committed,
                    &policy,
                )
                .unwrap();
        }
        (entry.attempt_id, doc)
    }

    #[test]
    fn test_sweep_rolls_back_expired_pending_attempt() {
        let fx = setup();
        let (attempt_id, doc) = plant_abandoned(&fx, AttemptState::Pending, ClientId::new(), true);

        let stats = fx.sweeper.run_sweep_once().unwrap();
        assert_eq!(stats.rolled_back, 1);
        assert_eq!(stats.failures, 0);

        // No visible document was created
        assert!(fx.kv.get(&doc).unwrap().is_none());
        let (entry, _) = fx.atr.get_entry(&attempt_id).unwrap().unwrap();
        assert_eq!(entry.state, AttemptState::RolledBack);
    }

    #[test]
    fn test_sweep_finishes_expired_committed_attempt() {
        let fx = setup();
        let (attempt_id, doc) = plant_abandoned(&fx, AttemptState::Committed, ClientId::new(), true);

        let stats = fx.sweeper.run_sweep_once().unwrap();
        assert_eq!(stats.rolled_forward, 1);

        let (body, _) = fx.kv.read_doc(&doc).unwrap();
        assert_eq!(body, json!({"orphaned": true}));
        let (entry, _) = fx.atr.get_entry(&attempt_id).unwrap().unwrap();
        assert_eq!(entry.state, AttemptState::Completed);
    }

    #[test]
    fn test_sweep_leaves_live_attempts_alone() {
        let fx = setup();
        let (attempt_id, doc) = plant_abandoned(&fx, AttemptState::Pending, ClientId::new(), false);

        let stats = fx.sweeper.run_sweep_once().unwrap();
        assert_eq!(stats.resolved(), 0);
        assert_eq!(stats.entries_examined, 1);

        let (entry, _) = fx.atr.get_entry(&attempt_id).unwrap().unwrap();
        assert_eq!(entry.state, AttemptState::Pending);
        assert!(fx.kv.get(&doc).unwrap().unwrap().is_staged());
    }

    #[test]
    fn test_dead_owner_fast_path() {
        // The attempt itself has NOT expired, but its owner's client
        // registration has: cleanup may proceed immediately
        let config = CleanupConfig {
            client_expiry: Duration::from_millis(1),
            ..CleanupConfig::default()
        };
        let fx = setup_with(CleanupConfig::default());

        // Register the doomed owner with a tiny lease, then let it lapse
        let owner_record = ClientRecord::new(
            fx.kv.clone() as Arc<dyn KvStore>,
            CollectionRef::default_in("travel"),
            ClientId::new(),
            config,
        );
        owner_record.heartbeat().unwrap();
        let (attempt_id, _) =
            plant_abandoned(&fx, AttemptState::Pending, owner_record.client_id(), false);
        std::thread::sleep(Duration::from_millis(5));

        let stats = fx.sweeper.run_sweep_once().unwrap();
        assert_eq!(stats.rolled_back, 1);

        let (entry, _) = fx.atr.get_entry(&attempt_id).unwrap().unwrap();
        assert_eq!(entry.state, AttemptState::RolledBack);
    }

    #[test]
    fn test_sweep_twice_is_idempotent() {
        let fx = setup();
        let (_, doc) = plant_abandoned(&fx, AttemptState::Committed, ClientId::new(), true);

        let first = fx.sweeper.run_sweep_once().unwrap();
        assert_eq!(first.rolled_forward, 1);

        let second = fx.sweeper.run_sweep_once().unwrap();
        assert_eq!(second.resolved(), 0);
        assert_eq!(second.failures, 0);

        let (body, _) = fx.kv.read_doc(&doc).unwrap();
        assert_eq!(body, json!({"orphaned": true}));
    }

    #[test]
    fn test_terminal_entries_garbage_collected_after_grace() {
        let config = CleanupConfig {
            entry_grace: Duration::ZERO,
            ..CleanupConfig::default()
        };
        let fx = setup_with(config);
        let (attempt_id, _) = plant_abandoned(&fx, AttemptState::Pending, ClientId::new(), true);

        // First pass resolves the entry to ROLLED_BACK
        fx.sweeper.run_sweep_once().unwrap();
        assert!(fx.atr.get_entry(&attempt_id).unwrap().is_some());

        // Second pass removes the terminal entry (grace already passed)
        let stats = fx.sweeper.run_sweep_once().unwrap();
        assert_eq!(stats.entries_removed, 1);
        assert!(fx.atr.get_entry(&attempt_id).unwrap().is_none());
    }

    #[test]
    fn test_terminal_entries_kept_within_grace() {
        let fx = setup(); // default grace: 60s
        let (attempt_id, _) = plant_abandoned(&fx, AttemptState::Pending, ClientId::new(), true);

        fx.sweeper.run_sweep_once().unwrap();
        let stats = fx.sweeper.run_sweep_once().unwrap();
        assert_eq!(stats.entries_removed, 0);
        assert!(fx.atr.get_entry(&attempt_id).unwrap().is_some());
    }

    #[test]
    fn test_override_pauses_non_holder() {
        let fx = setup();
        let (attempt_id, _) = plant_abandoned(&fx, AttemptState::Pending, ClientId::new(), true);

        fx.sweeper
            .client_record
            .set_override(true, epoch_millis() + 60_000)
            .unwrap();

        let stats = fx.sweeper.run_sweep_once().unwrap();
        assert_eq!(stats.shards_scanned, 0);
        assert_eq!(stats.resolved(), 0);
        let (entry, _) = fx.atr.get_entry(&attempt_id).unwrap().unwrap();
        assert_eq!(entry.state, AttemptState::Pending);
    }

    #[test]
    fn test_override_holder_sweeps_all_shards() {
        let config = CleanupConfig {
            override_holder: true,
            ..CleanupConfig::default()
        };
        let fx = setup_with(config);
        let (attempt_id, _) = plant_abandoned(&fx, AttemptState::Pending, ClientId::new(), true);

        fx.sweeper
            .client_record
            .set_override(true, epoch_millis() + 60_000)
            .unwrap();

        let stats = fx.sweeper.run_sweep_once().unwrap();
        assert_eq!(stats.shards_scanned, fx.atr.num_atrs());
        assert_eq!(stats.rolled_back, 1);
        let (entry, _) = fx.atr.get_entry(&attempt_id).unwrap().unwrap();
        assert_eq!(entry.state, AttemptState::RolledBack);
    }

    #[test]
    fn test_sweep_loop_start_and_shutdown() {
        let config = CleanupConfig {
            sweep_interval: Duration::from_millis(10),
            ..CleanupConfig::default()
        };
        let fx = setup_with(config);
        let (attempt_id, _) = plant_abandoned(&fx, AttemptState::Pending, ClientId::new(), true);

        let sweeper = Arc::new(fx.sweeper);
        sweeper.start();
        std::thread::sleep(Duration::from_millis(100));
        sweeper.shutdown();
        assert!(sweeper.is_shutdown());

        let (entry, _) = fx.atr.get_entry(&attempt_id).unwrap().unwrap();
        assert_eq!(entry.state, AttemptState::RolledBack);
    }
}
