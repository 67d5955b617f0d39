//! Attempt state machine
//!
//! Drives one transaction attempt through staging, commit, and
//! rollback, persisting progress into its ATR entry. The local states
//! mirror the persisted ones with one addition, `NotStarted`: before
//! the first document is staged the attempt has no ATR entry and exists
//! only in this process.
//!
//! ## Commit sequence
//!
//! ```text
//! 1. check expiry (cooperative soft deadline)
//! 2. CAS ATR entry PENDING -> COMMITTED   (THE DECISION POINT)
//! 3. roll forward each staged document    (idempotent, race-safe)
//! 4. CAS ATR entry COMMITTED -> COMPLETED
//! ```
//!
//! Once step 2 succeeds the transaction is durably decided: even if
//! this process dies immediately after, a cleanup sweeper finishes
//! steps 3 and 4 from the ATR entry alone. Losing the CAS at step 2
//! means another actor already resolved the attempt and surfaces as
//! `AttemptAlreadyResolved`, not a client error. Rollback mirrors the
//! sequence down the PENDING -> ABORTED -> ROLLED_BACK branch.

use crate::atr::AtrStore;
use crate::staging::DocumentStaging;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{
    epoch_millis, AtrEntry, AttemptId, AttemptState, Cas, ClientId, DocId, DocRecord, Error,
    Result, RetryPolicy, StagedOperation, TransactionId,
};
use tandem_storage::KvStore;
use tracing::{debug, info, warn};

/// Client-local status of a transaction attempt
///
/// `NotStarted` has no persisted counterpart; the remaining states
/// track the ATR entry as this process last knew it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    /// No document staged yet; no ATR entry exists
    NotStarted,
    /// ATR entry created; documents are being staged
    Pending,
    /// Commit decided; staged values being applied
    Committed,
    /// Commit fully applied
    Completed,
    /// Rollback decided; staging being cleared
    Aborted,
    /// Rollback fully applied
    RolledBack,
}

impl AttemptStatus {
    /// Whether the attempt may still accept staging calls
    pub fn accepts_writes(&self) -> bool {
        matches!(self, AttemptStatus::NotStarted | AttemptStatus::Pending)
    }
}

/// One execution try of a transaction body
///
/// Created via the facade's `begin_attempt`; not `Clone` and not shared
/// between threads — each attempt runs on its own logical task, and the
/// only in-process mutable state is this context's CAS cache.
pub struct AttemptContext {
    attempt_id: AttemptId,
    transaction_id: TransactionId,
    client_id: ClientId,
    status: AttemptStatus,

    kv: Arc<dyn KvStore>,
    staging: DocumentStaging,
    atr: AtrStore,

    start: Instant,
    start_timestamp: u64,
    expiry: Duration,

    /// Last-known ATR document token, refreshed by every ATR mutation
    atr_cas: Cas,
    /// Last-known CAS per document touched within this attempt
    doc_cas: HashMap<DocId, Cas>,
    staged: Vec<DocId>,
}

impl AttemptContext {
    /// Begin a new attempt for `transaction_id`
    pub fn new(
        transaction_id: TransactionId,
        client_id: ClientId,
        expiry: Duration,
        kv: Arc<dyn KvStore>,
        atr: AtrStore,
    ) -> Self {
        let attempt_id = AttemptId::new();
        debug!(%attempt_id, %transaction_id, ?expiry, "beginning attempt");
        Self {
            attempt_id,
            transaction_id,
            client_id,
            status: AttemptStatus::NotStarted,
            staging: DocumentStaging::new(kv.clone()),
            kv,
            atr,
            start: Instant::now(),
            start_timestamp: epoch_millis(),
            expiry,
            atr_cas: Cas::ZERO,
            doc_cas: HashMap::new(),
            staged: Vec::new(),
        }
    }

    /// This attempt's id
    pub fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }

    /// The logical transaction this attempt belongs to
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Current client-local status
    pub fn status(&self) -> AttemptStatus {
        self.status
    }

    /// Number of documents staged so far
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Absolute deadline of this attempt
    pub fn deadline(&self) -> Instant {
        self.start + self.expiry
    }

    /// Whether the attempt's expiry has elapsed
    pub fn is_expired(&self) -> bool {
        self.start.elapsed() >= self.expiry
    }

    fn check_expiry(&self) -> Result<()> {
        if self.is_expired() {
            return Err(Error::AttemptExpired {
                attempt_id: self.attempt_id,
            });
        }
        Ok(())
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::for_attempt(self.deadline())
    }

    // === Reads ===

    /// Read a document within this attempt
    ///
    /// Read-your-writes: a document this attempt already staged returns
    /// its staged body. Otherwise the committed body is returned and
    /// the document's CAS is cached for a later staging call.
    pub fn get(&mut self, id: &DocId) -> Result<Option<serde_json::Value>> {
        self.check_expiry()?;
        let snapshot = self.staging.get(id, &self.policy())?;

        match snapshot {
            None => {
                self.doc_cas.insert(id.clone(), Cas::ZERO);
                Ok(None)
            }
            Some(snap) => {
                self.doc_cas.insert(id.clone(), snap.cas);
                match snap.staging {
                    Some(meta) if meta.attempt_id == self.attempt_id => Ok(meta.staged_body),
                    // A foreign attempt's staged value stays invisible
                    _ => Ok(snap.body),
                }
            }
        }
    }

    // === Staging ===

    /// Stage an insert of a new document
    pub fn stage_insert(&mut self, id: &DocId, body: serde_json::Value) -> Result<()> {
        self.stage(id, StagedOperation::Insert(body))
    }

    /// Stage a replacement of an existing document's body
    pub fn stage_replace(&mut self, id: &DocId, body: serde_json::Value) -> Result<()> {
        self.stage(id, StagedOperation::Replace(body))
    }

    /// Stage a removal of an existing document
    pub fn stage_remove(&mut self, id: &DocId) -> Result<()> {
        self.stage(id, StagedOperation::Remove)
    }

    /// Stage one mutation against one document
    ///
    /// On the first staging call the PENDING ATR entry is created
    /// (placement computed from the attempt id, creation retried with
    /// backoff bounded by the attempt expiry). The target document's
    /// current CAS must match this attempt's last-known CAS; a foreign
    /// staging or a moved token fails fast with
    /// `ConcurrentModification` so the whole attempt can be retried.
    pub fn stage(&mut self, id: &DocId, op: StagedOperation) -> Result<()> {
        self.check_expiry()?;
        if !self.status.accepts_writes() {
            return Err(Error::invariant(format!(
                "attempt {} is {:?} and cannot stage documents",
                self.attempt_id, self.status
            )));
        }

        self.ensure_pending()?;
        let policy = self.policy();

        // Snapshot the document and work out the expected token
        let snapshot = self.staging.get(id, &policy)?;
        if let Some(snap) = &snapshot {
            if let Some(meta) = &snap.staging {
                if meta.attempt_id != self.attempt_id {
                    // Write-write conflict: another attempt holds the doc
                    return Err(Error::ConcurrentModification { id: id.to_string() });
                }
            }
        }

        let expected = match (&op, &snapshot) {
            (StagedOperation::Insert(_), None) => Cas::ZERO,
            (StagedOperation::Insert(_), Some(snap)) => {
                if snap.body.is_some() {
                    // The document exists: another writer won the insert
                    return Err(Error::ConcurrentModification { id: id.to_string() });
                }
                // Re-staging our own shadow document
                snap.cas
            }
            (_, None) => return Err(Error::DocNotFound { id: id.to_string() }),
            (_, Some(snap)) => {
                if let Some(cached) = self.doc_cas.get(id) {
                    if *cached != snap.cas {
                        // The document moved since this attempt read it
                        return Err(Error::ConcurrentModification { id: id.to_string() });
                    }
                }
                snap.cas
            }
        };

        let original_body = snapshot.as_ref().and_then(|s| s.body.as_ref());
        let atr_doc = self.atr.doc_id_for(&self.attempt_id);
        let meta = self
            .staging
            .build_metadata(self.attempt_id, &atr_doc, &op, original_body);

        let new_cas = self.staging.stage(id, expected, meta, &policy)?;

        // Record the touched document in the ATR entry so cleanup can
        // revisit it without us
        self.atr_cas = self.atr.record_document(
            &self.attempt_id,
            op.operation_type(),
            DocRecord::from_doc_id(id),
            &policy,
        )?;

        self.doc_cas.insert(id.clone(), new_cas);
        if !self.staged.contains(id) {
            self.staged.push(id.clone());
        }
        debug!(attempt_id = %self.attempt_id, doc = %id, op = %op.operation_type(), "staged document");
        Ok(())
    }

    /// Create the PENDING ATR entry on the first staging call
    fn ensure_pending(&mut self) -> Result<()> {
        if self.status == AttemptStatus::Pending {
            return Ok(());
        }
        let entry = AtrEntry::new(
            self.attempt_id,
            self.transaction_id,
            self.client_id,
            self.start_timestamp,
            self.expiry.as_millis() as u64,
        );
        self.atr_cas = self.atr.create_entry(&entry, &self.policy())?;
        self.status = AttemptStatus::Pending;
        info!(
            attempt_id = %self.attempt_id,
            atr = %self.atr.doc_id_for(&self.attempt_id),
            "attempt PENDING"
        );
        Ok(())
    }

    // === Commit ===

    /// Commit this attempt
    ///
    /// Requires a PENDING attempt with at least one staged document.
    /// After the PENDING→COMMITTED CAS lands the transaction is decided
    /// even if this process now crashes; the remaining steps are
    /// idempotent and may race a cleanup sweeper freely.
    pub fn commit(&mut self) -> Result<()> {
        self.check_expiry()?;
        if self.status != AttemptStatus::Pending || self.staged.is_empty() {
            return Err(Error::invariant(format!(
                "commit requires a pending attempt with staged documents (attempt {} is {:?} with {} staged)",
                self.attempt_id,
                self.status,
                self.staged.len()
            )));
        }

        let policy = self.policy();

        // THE DECISION POINT: losing this CAS means a sweeper already
        // resolved the attempt
        match self.atr.transition_state(
            &self.attempt_id,
            self.atr_cas,
            AttemptState::Pending,
            AttemptState::Committed,
            &policy,
        ) {
            Ok(cas) => self.atr_cas = cas,
            Err(e @ Error::AttemptAlreadyResolved { .. }) => {
                warn!(attempt_id = %self.attempt_id, "commit decision lost to another actor");
                self.status = AttemptStatus::Aborted;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.status = AttemptStatus::Committed;
        info!(attempt_id = %self.attempt_id, "attempt COMMITTED");

        // Apply every staged document; a racing sweeper applying the
        // same documents is indistinguishable from success
        for doc in self.staged.clone() {
            self.check_expiry()?;
            self.staging.roll_forward(&doc, self.attempt_id, &policy)?;
        }

        self.check_expiry()?;
        self.atr_cas = self.atr.transition_state(
            &self.attempt_id,
            self.atr_cas,
            AttemptState::Committed,
            AttemptState::Completed,
            &policy,
        )?;
        self.status = AttemptStatus::Completed;
        info!(attempt_id = %self.attempt_id, docs = self.staged.len(), "attempt COMPLETED");
        Ok(())
    }

    // === Rollback ===

    /// Roll back this attempt
    ///
    /// Legal only before the commit decision. A NotStarted attempt has
    /// nothing persisted and resolves locally. Rollback after COMMITTED
    /// is refused as an invariant violation: the transaction is already
    /// decided.
    pub fn rollback(&mut self) -> Result<()> {
        match self.status {
            AttemptStatus::NotStarted => {
                self.status = AttemptStatus::RolledBack;
                return Ok(());
            }
            AttemptStatus::Pending => {}
            AttemptStatus::Committed | AttemptStatus::Completed => {
                return Err(Error::invariant(format!(
                    "attempt {} is already committed and cannot be rolled back",
                    self.attempt_id
                )));
            }
            AttemptStatus::Aborted | AttemptStatus::RolledBack => {
                return Err(Error::AttemptAlreadyResolved {
                    attempt_id: self.attempt_id,
                });
            }
        }
        self.check_expiry()?;

        let policy = self.policy();

        match self.atr.transition_state(
            &self.attempt_id,
            self.atr_cas,
            AttemptState::Pending,
            AttemptState::Aborted,
            &policy,
        ) {
            Ok(cas) => self.atr_cas = cas,
            Err(e @ Error::AttemptAlreadyResolved { .. }) => {
                self.status = AttemptStatus::Aborted;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.status = AttemptStatus::Aborted;
        info!(attempt_id = %self.attempt_id, "attempt ABORTED");

        for doc in self.staged.clone() {
            self.staging.roll_back(&doc, self.attempt_id, &policy)?;
        }

        self.atr_cas = self.atr.transition_state(
            &self.attempt_id,
            self.atr_cas,
            AttemptState::Aborted,
            AttemptState::RolledBack,
            &policy,
        )?;
        self.status = AttemptStatus::RolledBack;
        info!(attempt_id = %self.attempt_id, "attempt ROLLED_BACK");
        Ok(())
    }

    /// The KV handle this attempt runs against
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }
}
