//! Document staging layer
//!
//! Reads and writes the visible and in-flight state of a single
//! document. Staging writes a proposed value into the document's
//! metadata slot, invisible to non-transactional readers; resolution
//! either applies that value (roll forward) or clears it (roll back).
//!
//! The resolution helpers are written as set operations: re-applying
//! them observes "already done" and succeeds, so a race between the
//! owning attempt and a cleanup sweeper cannot corrupt state.

use std::sync::Arc;
use tandem_core::{
    AttemptId, Cas, DocId, Error, OperationType, Result, RetryPolicy, StagedOperation,
    StagingMetadata,
};
use tandem_storage::{DocSnapshot, KvStore};
use tracing::debug;

/// CRC32 of a document body, recorded in staging metadata so
/// non-transactional writers can detect a racing transaction
pub fn crc32_of_body(body: &serde_json::Value) -> u32 {
    crc32fast::hash(body.to_string().as_bytes())
}

/// Staging-layer view of the KV store
#[derive(Clone)]
pub struct DocumentStaging {
    kv: Arc<dyn KvStore>,
}

impl DocumentStaging {
    /// Create a staging layer over the given store
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Read a document's snapshot, retrying transient failures
    pub fn get(&self, id: &DocId, policy: &RetryPolicy) -> Result<Option<DocSnapshot>> {
        policy.run("staging.get", || self.kv.get(id))
    }

    /// Build staging metadata for one mutation of one document
    pub fn build_metadata(
        &self,
        attempt_id: AttemptId,
        atr_doc: &DocId,
        op: &StagedOperation,
        original_body: Option<&serde_json::Value>,
    ) -> StagingMetadata {
        StagingMetadata {
            attempt_id,
            atr_id: atr_doc.key.clone(),
            atr_bucket: atr_doc.collection.bucket.clone(),
            atr_scope: atr_doc.collection.scope.clone(),
            atr_collection: atr_doc.collection.collection.clone(),
            staged_body: op.staged_body().cloned(),
            operation_type: op.operation_type(),
            crc32_of_original_body: original_body.map(crc32_of_body),
        }
    }

    /// Write staging metadata onto a document, CAS-guarded
    ///
    /// A CAS mismatch here is a definitive write-write conflict and is
    /// reported as `ConcurrentModification`; only transient store
    /// failures are retried.
    pub fn stage(
        &self,
        id: &DocId,
        expected: Cas,
        meta: StagingMetadata,
        policy: &RetryPolicy,
    ) -> Result<Cas> {
        policy
            .run("staging.stage", || {
                self.kv.mutate_staged(id, expected, meta.clone())
            })
            .map_err(|e| match e {
                Error::CasMismatch { id } => Error::ConcurrentModification { id },
                other => other,
            })
    }

    /// Apply a document's staged value as its real value (roll forward)
    ///
    /// Idempotent: if the staging metadata is gone, or belongs to a
    /// different attempt (the slot was reused after our resolution
    /// landed), the step is already done and succeeds. A CAS mismatch
    /// between read and apply re-reads and tries again.
    pub fn roll_forward(
        &self,
        id: &DocId,
        attempt_id: AttemptId,
        policy: &RetryPolicy,
    ) -> Result<()> {
        self.resolve_doc(id, attempt_id, policy, |kv, id, cas| kv.commit_staged(id, cas))
    }

    /// Clear a document's staging metadata without applying it (roll back)
    ///
    /// Idempotent with the same tolerance as `roll_forward`. A shadow
    /// document from a staged insert disappears, leaving no visible
    /// document behind.
    pub fn roll_back(&self, id: &DocId, attempt_id: AttemptId, policy: &RetryPolicy) -> Result<()> {
        self.resolve_doc(id, attempt_id, policy, |kv, id, cas| {
            kv.remove_staging(id, cas)
        })
    }

    fn resolve_doc(
        &self,
        id: &DocId,
        attempt_id: AttemptId,
        policy: &RetryPolicy,
        apply: impl Fn(&dyn KvStore, &DocId, Cas) -> Result<Cas>,
    ) -> Result<()> {
        let mut round = 0u32;
        loop {
            let snapshot = policy.run("resolve.get", || self.kv.get(id))?;

            let cas = match snapshot {
                // Document gone: a staged remove was already applied, or
                // a racing resolver finished first
                None => return Ok(()),
                Some(snap) => match &snap.staging {
                    // Staging cleared: already applied
                    None => return Ok(()),
                    // Slot reused by a later attempt: ours was resolved
                    Some(meta) if meta.attempt_id != attempt_id => return Ok(()),
                    Some(_) => snap.cas,
                },
            };

            match policy.run("resolve.apply", || apply(self.kv.as_ref(), id, cas)) {
                Ok(_) => {
                    debug!(doc = %id, attempt_id = %attempt_id, "resolved staged document");
                    return Ok(());
                }
                // Token moved between read and apply: re-read and decide
                // again from the fresh snapshot
                Err(Error::CasMismatch { .. }) if !policy.deadline_passed() => {
                    policy.backoff(round);
                    round = round.saturating_add(1);
                }
                Err(Error::DocNotFound { .. }) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::CollectionRef;
    use tandem_storage::MemoryKvStore;

    fn setup() -> (Arc<MemoryKvStore>, DocumentStaging, RetryPolicy) {
        let kv = Arc::new(MemoryKvStore::new());
        let staging = DocumentStaging::new(kv.clone() as Arc<dyn KvStore>);
        (kv, staging, RetryPolicy::for_background())
    }

    fn doc_id(key: &str) -> DocId {
        DocId::new(CollectionRef::default_in("travel"), key)
    }

    fn atr_doc() -> DocId {
        DocId::new(CollectionRef::default_in("travel"), "_txn:atr-0")
    }

    #[test]
    fn test_crc32_changes_with_body() {
        let a = crc32_of_body(&json!({"a": 1}));
        let b = crc32_of_body(&json!({"a": 2}));
        assert_ne!(a, b);
        assert_eq!(a, crc32_of_body(&json!({"a": 1})));
    }

    #[test]
    fn test_build_metadata_records_atr_location() {
        let (_, staging, _) = setup();
        let attempt_id = AttemptId::new();
        let op = StagedOperation::Replace(json!({"v": 2}));
        let original = json!({"v": 1});

        let meta = staging.build_metadata(attempt_id, &atr_doc(), &op, Some(&original));
        assert_eq!(meta.atr_id, "_txn:atr-0");
        assert_eq!(meta.atr_bucket, "travel");
        assert_eq!(meta.operation_type, OperationType::Replace);
        assert_eq!(meta.crc32_of_original_body, Some(crc32_of_body(&original)));
        assert_eq!(meta.atr_doc_id(), atr_doc());
    }

    #[test]
    fn test_stage_maps_cas_mismatch_to_conflict() {
        let (kv, staging, policy) = setup();
        let id = doc_id("hotel-1");
        let cas = kv.write_doc(&id, Cas::ZERO, json!({"v": 1})).unwrap();

        // Another writer moves the token
        kv.write_doc(&id, cas, json!({"v": 2})).unwrap();

        let op = StagedOperation::Replace(json!({"v": 3}));
        let meta = staging.build_metadata(AttemptId::new(), &atr_doc(), &op, None);
        let err = staging.stage(&id, cas, meta, &policy).unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification { .. }));
    }

    #[test]
    fn test_roll_forward_applies_staged_value() {
        let (kv, staging, policy) = setup();
        let id = doc_id("hotel-1");
        let attempt_id = AttemptId::new();
        let cas = kv.write_doc(&id, Cas::ZERO, json!({"v": 1})).unwrap();

        let op = StagedOperation::Replace(json!({"v": 2}));
        let meta = staging.build_metadata(attempt_id, &atr_doc(), &op, None);
        staging.stage(&id, cas, meta, &policy).unwrap();

        staging.roll_forward(&id, attempt_id, &policy).unwrap();
        let (body, _) = kv.read_doc(&id).unwrap();
        assert_eq!(body, json!({"v": 2}));
    }

    #[test]
    fn test_roll_forward_twice_is_idempotent() {
        let (kv, staging, policy) = setup();
        let id = doc_id("hotel-1");
        let attempt_id = AttemptId::new();
        let cas = kv.write_doc(&id, Cas::ZERO, json!({"v": 1})).unwrap();

        let op = StagedOperation::Replace(json!({"v": 2}));
        let meta = staging.build_metadata(attempt_id, &atr_doc(), &op, None);
        staging.stage(&id, cas, meta, &policy).unwrap();

        staging.roll_forward(&id, attempt_id, &policy).unwrap();
        // Second resolution observes "already applied" and succeeds
        staging.roll_forward(&id, attempt_id, &policy).unwrap();

        let (body, _) = kv.read_doc(&id).unwrap();
        assert_eq!(body, json!({"v": 2}));
    }

    #[test]
    fn test_roll_back_restores_invisibility() {
        let (kv, staging, policy) = setup();
        let id = doc_id("hotel-1");
        let attempt_id = AttemptId::new();
        let cas = kv.write_doc(&id, Cas::ZERO, json!({"v": 1})).unwrap();

        let op = StagedOperation::Remove;
        let meta = staging.build_metadata(attempt_id, &atr_doc(), &op, Some(&json!({"v": 1})));
        staging.stage(&id, cas, meta, &policy).unwrap();

        staging.roll_back(&id, attempt_id, &policy).unwrap();
        let snap = kv.get(&id).unwrap().unwrap();
        assert_eq!(snap.body, Some(json!({"v": 1})));
        assert!(!snap.is_staged());

        // Idempotent
        staging.roll_back(&id, attempt_id, &policy).unwrap();
    }

    #[test]
    fn test_roll_back_staged_insert_leaves_no_document() {
        let (kv, staging, policy) = setup();
        let id = doc_id("hotel-new");
        let attempt_id = AttemptId::new();

        let op = StagedOperation::Insert(json!({"name": "New"}));
        let meta = staging.build_metadata(attempt_id, &atr_doc(), &op, None);
        staging.stage(&id, Cas::ZERO, meta, &policy).unwrap();

        staging.roll_back(&id, attempt_id, &policy).unwrap();
        assert!(kv.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_resolution_skips_foreign_staging() {
        let (kv, staging, policy) = setup();
        let id = doc_id("hotel-1");
        let ours = AttemptId::new();
        let theirs = AttemptId::new();
        let cas = kv.write_doc(&id, Cas::ZERO, json!({"v": 1})).unwrap();

        // A different attempt holds the document now
        let op = StagedOperation::Replace(json!({"v": 9}));
        let meta = staging.build_metadata(theirs, &atr_doc(), &op, None);
        staging.stage(&id, cas, meta, &policy).unwrap();

        // Resolving "ours" must not touch their staging
        staging.roll_forward(&id, ours, &policy).unwrap();
        let snap = kv.get(&id).unwrap().unwrap();
        assert_eq!(snap.staging.as_ref().unwrap().attempt_id, theirs);
        assert_eq!(snap.body, Some(json!({"v": 1})));
    }
}
