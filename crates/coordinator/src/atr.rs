//! Active Transaction Record store
//!
//! Pure data-access layer over the reserved ATR documents. Each ATR
//! document holds a map of attempt entries under the `attempts` path;
//! a fixed shard count per collection lets every client compute an
//! attempt's placement from `crc32(attemptId) mod shardCount` with no
//! discovery step.
//!
//! All mutations are single-document CAS operations on the ATR
//! document. The ATR itself is never protected by a multi-document
//! transaction (that would be circular); correctness rests on the
//! monotonic-state invariant making every transition safe to retry or
//! race. Because the document CAS moves whenever *any* entry changes,
//! every mutation here runs a re-read loop: a mismatch caused by an
//! unrelated entry refreshes the token and tries again, while a
//! mismatch caused by our own entry moving is classified against the
//! state graph.

use std::sync::Arc;
use tandem_core::{
    AtrEntry, AttemptId, AttemptState, Cas, CollectionRef, DocId, DocRecord, Error, OperationType,
    Result, RetryPolicy,
};
use tandem_storage::KvStore;
use tracing::{error, warn};

/// Key prefix of the reserved ATR documents
pub const ATR_KEY_PREFIX: &str = "_txn:atr-";

/// Sub-document path holding the entry map
const ATTEMPTS_PATH: &str = "attempts";

/// Data access to the ATR documents of one collection
#[derive(Clone)]
pub struct AtrStore {
    kv: Arc<dyn KvStore>,
    collection: CollectionRef,
    num_atrs: usize,
}

impl AtrStore {
    /// Create a store over `num_atrs` ATR documents in `collection`
    pub fn new(kv: Arc<dyn KvStore>, collection: CollectionRef, num_atrs: usize) -> Self {
        debug_assert!(num_atrs > 0);
        Self {
            kv,
            collection,
            num_atrs,
        }
    }

    /// The fixed shard count
    pub fn num_atrs(&self) -> usize {
        self.num_atrs
    }

    /// Deterministic shard index for an attempt
    pub fn shard_for(&self, attempt_id: &AttemptId) -> usize {
        crc32fast::hash(attempt_id.to_string().as_bytes()) as usize % self.num_atrs
    }

    /// Document id of one ATR shard
    pub fn doc_id_for_shard(&self, shard: usize) -> DocId {
        DocId::new(
            self.collection.clone(),
            format!("{}{}", ATR_KEY_PREFIX, shard),
        )
    }

    /// Document id of the ATR holding an attempt's entry
    pub fn doc_id_for(&self, attempt_id: &AttemptId) -> DocId {
        self.doc_id_for_shard(self.shard_for(attempt_id))
    }

    fn entry_path(attempt_id: &AttemptId) -> String {
        format!("{}.{}", ATTEMPTS_PATH, attempt_id)
    }

    /// Create a fresh PENDING entry for an attempt
    ///
    /// Retried with backoff against contention on the shared ATR
    /// document, bounded by the caller's policy deadline (the attempt's
    /// expiry). A duplicate entry for the same attempt id is an
    /// invariant violation, not contention.
    pub fn create_entry(&self, entry: &AtrEntry, policy: &RetryPolicy) -> Result<Cas> {
        let doc = self.doc_id_for(&entry.attempt_id);
        let path = Self::entry_path(&entry.attempt_id);
        let value = serde_json::to_value(entry)?;

        let mut round = 0u32;
        loop {
            let expected = match policy.run("atr.get", || self.kv.get(&doc))? {
                Some(snap) => snap.cas,
                None => Cas::ZERO,
            };

            match self.kv.subdoc_create(&doc, expected, &path, value.clone()) {
                Ok(cas) => return Ok(cas),
                Err(Error::PathExists { .. }) => {
                    error!(attempt_id = %entry.attempt_id, atr = %doc, "duplicate ATR entry");
                    return Err(Error::invariant(format!(
                        "ATR entry for attempt {} already exists",
                        entry.attempt_id
                    )));
                }
                // Unrelated entry landed between read and create, or a
                // transient hiccup: refresh and try again within budget
                Err(Error::CasMismatch { .. }) | Err(Error::TransientStore { .. })
                    if !policy.deadline_passed() =>
                {
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one attempt's entry, if present
    pub fn get_entry(&self, attempt_id: &AttemptId) -> Result<Option<(AtrEntry, Cas)>> {
        let doc = self.doc_id_for(attempt_id);
        match self.kv.subdoc_read(&doc, &Self::entry_path(attempt_id)) {
            Ok((value, cas)) => Ok(Some((serde_json::from_value(value)?, cas))),
            Err(Error::DocNotFound { .. }) | Err(Error::PathNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List every entry in one ATR shard
    ///
    /// Entries that fail to parse (written by an incompatible client)
    /// are skipped with a warning rather than failing the whole scan.
    pub fn list_entries(&self, shard: usize) -> Result<Vec<(AtrEntry, Cas)>> {
        let doc = self.doc_id_for_shard(shard);
        let (value, cas) = match self.kv.subdoc_read(&doc, ATTEMPTS_PATH) {
            Ok(found) => found,
            Err(Error::DocNotFound { .. }) | Err(Error::PathNotFound { .. }) => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };

        let map = value.as_object().cloned().unwrap_or_default();
        let mut entries = Vec::with_capacity(map.len());
        for (key, raw) in map {
            match serde_json::from_value::<AtrEntry>(raw) {
                Ok(entry) => entries.push((entry, cas)),
                Err(e) => {
                    warn!(atr = %doc, entry = %key, error = %e, "skipping unparsable ATR entry");
                }
            }
        }
        Ok(entries)
    }

    /// Record a touched document in an attempt's entry
    ///
    /// Non-decision mutation: a CAS mismatch re-reads the entry and
    /// re-applies the record on the fresh value.
    pub fn record_document(
        &self,
        attempt_id: &AttemptId,
        op: OperationType,
        record: DocRecord,
        policy: &RetryPolicy,
    ) -> Result<Cas> {
        let doc = self.doc_id_for(attempt_id);
        let path = Self::entry_path(attempt_id);

        let mut round = 0u32;
        loop {
            let (mut entry, cas) = self.get_entry(attempt_id)?.ok_or_else(|| {
                Error::invariant(format!(
                    "attempt {} has no ATR entry to record documents in",
                    attempt_id
                ))
            })?;
            entry.record_document(op, record.clone());
            let value = serde_json::to_value(&entry)?;

            match self.kv.subdoc_update(&doc, cas, &path, value) {
                Ok(new_cas) => return Ok(new_cas),
                Err(Error::CasMismatch { .. }) | Err(Error::TransientStore { .. })
                    if !policy.deadline_passed() =>
                {
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// CAS-transition an entry's state
    ///
    /// `expected` is the caller's last-known ATR document token; the
    /// loop refreshes it when an unrelated entry moved the document.
    /// When the entry's own state is found somewhere other than `from`,
    /// the observation is classified:
    ///
    /// - already at `to`: another actor performed our transition —
    ///   success, idempotent.
    /// - `from == Pending` (a decision point) and the entry is decided
    ///   or gone: `AttemptAlreadyResolved`.
    /// - anything else: the state graph was violated —
    ///   `ProtocolInvariantViolation`, logged loudly.
    pub fn transition_state(
        &self,
        attempt_id: &AttemptId,
        expected: Cas,
        from: AttemptState,
        to: AttemptState,
        policy: &RetryPolicy,
    ) -> Result<Cas> {
        debug_assert!(from.can_transition_to(to));
        let doc = self.doc_id_for(attempt_id);
        let state_path = format!("{}.state", Self::entry_path(attempt_id));

        let mut expected = expected;
        let mut round = 0u32;
        loop {
            match self
                .kv
                .subdoc_update(&doc, expected, &state_path, serde_json::to_value(to)?)
            {
                Ok(cas) => return Ok(cas),
                Err(Error::CasMismatch { .. }) => {
                    // Re-read to find out whether our entry moved or an
                    // unrelated one bumped the document token
                    match self.get_entry(attempt_id)? {
                        None => return self.classify_missing(attempt_id, from),
                        Some((entry, cas)) if entry.state == from => {
                            if policy.deadline_passed() {
                                return Err(Error::CasMismatch {
                                    id: doc.to_string(),
                                });
                            }
                            expected = cas;
                            policy.backoff(round);
                            round = round.saturating_add(1);
                        }
                        Some((entry, cas)) if entry.state == to => return Ok(cas),
                        Some((entry, _)) => {
                            return self.classify_diverged(attempt_id, from, to, entry.state)
                        }
                    }
                }
                Err(Error::DocNotFound { .. }) | Err(Error::PathNotFound { .. }) => {
                    return self.classify_missing(attempt_id, from)
                }
                Err(e) if e.is_transient() && !policy.deadline_passed() => {
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn classify_missing(&self, attempt_id: &AttemptId, from: AttemptState) -> Result<Cas> {
        // Entry removed: it reached a terminal state and was garbage
        // collected. From PENDING that is a lost decision race; from
        // anywhere else our own branch completed under us.
        let _ = from;
        Err(Error::AttemptAlreadyResolved {
            attempt_id: *attempt_id,
        })
    }

    fn classify_diverged(
        &self,
        attempt_id: &AttemptId,
        from: AttemptState,
        to: AttemptState,
        observed: AttemptState,
    ) -> Result<Cas> {
        if from == AttemptState::Pending {
            // Decision point: another actor decided the attempt first
            return Err(Error::AttemptAlreadyResolved {
                attempt_id: *attempt_id,
            });
        }
        // Mid-branch: any state other than from/to contradicts the
        // monotonic graph (e.g. found ROLLED_BACK while committing)
        error!(
            attempt_id = %attempt_id,
            %from, %to, %observed,
            "illegal ATR state observed during transition"
        );
        Err(Error::invariant(format!(
            "attempt {}: expected {} -> {} but observed {}",
            attempt_id, from, to, observed
        )))
    }

    /// Remove a terminal entry from its ATR document
    ///
    /// Only legal once the entry is COMPLETED or ROLLED_BACK; an entry
    /// already gone counts as success.
    pub fn remove_entry(&self, attempt_id: &AttemptId, policy: &RetryPolicy) -> Result<()> {
        let doc = self.doc_id_for(attempt_id);
        let path = Self::entry_path(attempt_id);

        let mut round = 0u32;
        loop {
            let (entry, cas) = match self.get_entry(attempt_id)? {
                Some(found) => found,
                None => return Ok(()),
            };
            if !entry.state.is_terminal() {
                return Err(Error::invariant(format!(
                    "attempt {} is {} and cannot be removed from its ATR",
                    attempt_id, entry.state
                )));
            }

            match self.kv.subdoc_remove(&doc, cas, &path) {
                Ok(_) => return Ok(()),
                Err(Error::PathNotFound { .. }) => return Ok(()),
                Err(Error::CasMismatch { .. }) | Err(Error::TransientStore { .. })
                    if !policy.deadline_passed() =>
                {
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{ClientId, TransactionId};
    use tandem_storage::MemoryKvStore;

    fn setup() -> (Arc<MemoryKvStore>, AtrStore, RetryPolicy) {
        let kv = Arc::new(MemoryKvStore::new());
        let atr = AtrStore::new(
            kv.clone() as Arc<dyn KvStore>,
            CollectionRef::default_in("travel"),
            8,
        );
        (kv, atr, RetryPolicy::for_background())
    }

    fn new_entry() -> AtrEntry {
        AtrEntry::new(
            AttemptId::new(),
            TransactionId::new(),
            ClientId::new(),
            tandem_core::epoch_millis(),
            15_000,
        )
    }

    #[test]
    fn test_placement_is_deterministic_and_in_range() {
        let (_, atr, _) = setup();
        for _ in 0..64 {
            let id = AttemptId::new();
            let shard = atr.shard_for(&id);
            assert!(shard < atr.num_atrs());
            assert_eq!(shard, atr.shard_for(&id));
        }
    }

    #[test]
    fn test_create_and_get_entry() {
        let (_, atr, policy) = setup();
        let entry = new_entry();

        atr.create_entry(&entry, &policy).unwrap();
        let (found, _) = atr.get_entry(&entry.attempt_id).unwrap().unwrap();
        assert_eq!(found, entry);
    }

    #[test]
    fn test_create_duplicate_entry_is_invariant_violation() {
        let (_, atr, policy) = setup();
        let entry = new_entry();

        atr.create_entry(&entry, &policy).unwrap();
        let err = atr.create_entry(&entry, &policy).unwrap_err();
        assert!(matches!(err, Error::ProtocolInvariantViolation { .. }));
    }

    #[test]
    fn test_create_entry_survives_shard_contention() {
        // Two entries landing in the same ATR document: the second
        // create refreshes its token and succeeds
        let (_, atr, policy) = setup();
        let a = new_entry();
        let b = new_entry();
        // Force both into shard 0 regardless of their hash
        let one_shard = AtrStore::new(atr.kv.clone(), CollectionRef::default_in("travel"), 1);

        one_shard.create_entry(&a, &policy).unwrap();
        one_shard.create_entry(&b, &policy).unwrap();

        assert_eq!(one_shard.list_entries(0).unwrap().len(), 2);
    }

    #[test]
    fn test_transition_state_happy_path() {
        let (_, atr, policy) = setup();
        let entry = new_entry();
        let cas = atr.create_entry(&entry, &policy).unwrap();

        let cas = atr
            .transition_state(
                &entry.attempt_id,
                cas,
                AttemptState::Pending,
                AttemptState::Committed,
                &policy,
            )
            .unwrap();
        atr.transition_state(
            &entry.attempt_id,
            cas,
            AttemptState::Committed,
            AttemptState::Completed,
            &policy,
        )
        .unwrap();

        let (found, _) = atr.get_entry(&entry.attempt_id).unwrap().unwrap();
        assert_eq!(found.state, AttemptState::Completed);
    }

    #[test]
    fn test_transition_refreshes_token_on_unrelated_change() {
        let (_, atr, policy) = setup();
        let one_shard = AtrStore::new(atr.kv.clone(), CollectionRef::default_in("travel"), 1);

        let a = new_entry();
        let b = new_entry();
        let cas_a = one_shard.create_entry(&a, &policy).unwrap();
        // b's create moves the shared document token under a
        one_shard.create_entry(&b, &policy).unwrap();

        // Stale token: the loop re-reads, sees a still PENDING, retries
        one_shard
            .transition_state(
                &a.attempt_id,
                cas_a,
                AttemptState::Pending,
                AttemptState::Committed,
                &policy,
            )
            .unwrap();
        let (found, _) = one_shard.get_entry(&a.attempt_id).unwrap().unwrap();
        assert_eq!(found.state, AttemptState::Committed);
    }

    #[test]
    fn test_decision_race_reports_already_resolved() {
        let (_, atr, policy) = setup();
        let entry = new_entry();
        let cas = atr.create_entry(&entry, &policy).unwrap();

        // A sweeper claims the attempt first
        let _sweeper_cas = atr
            .transition_state(
                &entry.attempt_id,
                cas,
                AttemptState::Pending,
                AttemptState::Aborted,
                &policy,
            )
            .unwrap();

        // The owner's commit decision now loses
        let err = atr
            .transition_state(
                &entry.attempt_id,
                cas,
                AttemptState::Pending,
                AttemptState::Committed,
                &policy,
            )
            .unwrap_err();
        assert!(matches!(err, Error::AttemptAlreadyResolved { .. }));
    }

    #[test]
    fn test_same_transition_twice_is_idempotent() {
        let (_, atr, policy) = setup();
        let entry = new_entry();
        let cas = atr.create_entry(&entry, &policy).unwrap();

        atr.transition_state(
            &entry.attempt_id,
            cas,
            AttemptState::Pending,
            AttemptState::Committed,
            &policy,
        )
        .unwrap();

        // Stale token, state already at the target: success
        atr.transition_state(
            &entry.attempt_id,
            cas,
            AttemptState::Pending,
            AttemptState::Committed,
            &policy,
        )
        .map(|_| ())
        .or_else(|e| match e {
            // Pending decision observed as already done is equivalent
            Error::AttemptAlreadyResolved { .. } => Ok(()),
            other => Err(other),
        })
        .unwrap();
    }

    #[test]
    fn test_mid_branch_divergence_is_invariant_violation() {
        let (_, atr, policy) = setup();
        let entry = new_entry();
        let cas = atr.create_entry(&entry, &policy).unwrap();

        // Drive the entry to ROLLED_BACK
        let cas2 = atr
            .transition_state(
                &entry.attempt_id,
                cas,
                AttemptState::Pending,
                AttemptState::Aborted,
                &policy,
            )
            .unwrap();
        atr.transition_state(
            &entry.attempt_id,
            cas2,
            AttemptState::Aborted,
            AttemptState::RolledBack,
            &policy,
        )
        .unwrap();

        // Asking to finish a commit against a rolled-back entry is a bug
        let err = atr
            .transition_state(
                &entry.attempt_id,
                cas,
                AttemptState::Committed,
                AttemptState::Completed,
                &policy,
            )
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolInvariantViolation { .. }));
    }

    #[test]
    fn test_remove_entry_requires_terminal_state() {
        let (_, atr, policy) = setup();
        let entry = new_entry();
        let cas = atr.create_entry(&entry, &policy).unwrap();

        let err = atr.remove_entry(&entry.attempt_id, &policy).unwrap_err();
        assert!(matches!(err, Error::ProtocolInvariantViolation { .. }));

        let cas = atr
            .transition_state(
                &entry.attempt_id,
                cas,
                AttemptState::Pending,
                AttemptState::Aborted,
                &policy,
            )
            .unwrap();
        atr.transition_state(
            &entry.attempt_id,
            cas,
            AttemptState::Aborted,
            AttemptState::RolledBack,
            &policy,
        )
        .unwrap();

        atr.remove_entry(&entry.attempt_id, &policy).unwrap();
        assert!(atr.get_entry(&entry.attempt_id).unwrap().is_none());
        // Removing again is a no-op
        atr.remove_entry(&entry.attempt_id, &policy).unwrap();
    }

    #[test]
    fn test_record_document_accumulates() {
        let (_, atr, policy) = setup();
        let entry = new_entry();
        atr.create_entry(&entry, &policy).unwrap();

        let rec = DocRecord {
            id: "hotel-1".to_string(),
            bucket: "travel".to_string(),
            scope: "_default".to_string(),
            collection: "_default".to_string(),
        };
        atr.record_document(&entry.attempt_id, OperationType::Insert, rec.clone(), &policy)
            .unwrap();
        atr.record_document(&entry.attempt_id, OperationType::Remove, rec.clone(), &policy)
            .unwrap();

        let (found, _) = atr.get_entry(&entry.attempt_id).unwrap().unwrap();
        assert_eq!(found.documents_inserted.len(), 1);
        assert_eq!(found.documents_removed.len(), 1);
    }
}
