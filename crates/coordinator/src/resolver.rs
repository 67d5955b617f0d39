//! Resolution of decided or abandoned attempts
//!
//! A sweeper resolving an ATR entry performs exactly the steps the
//! owning attempt would: COMMITTED entries are rolled forward to
//! COMPLETED, PENDING and ABORTED entries are rolled back to
//! ROLLED_BACK. Every step is CAS-guarded and idempotent, so a race
//! with the original owner (which may wake up and drive its own
//! commit or rollback) cannot corrupt state: whichever actor's CAS
//! lands first wins, and the loser observes "already resolved".

use crate::atr::AtrStore;
use crate::staging::DocumentStaging;
use std::fmt;
use std::sync::Arc;
use tandem_core::{AtrEntry, AttemptState, Cas, Error, Result, RetryPolicy};
use tandem_storage::KvStore;
use tracing::{debug, info};

/// Why the sweeper selected an entry for resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// The entry's own expiry elapsed
    Expired,
    /// The owning client's registration expired in the client record
    OwnerDead,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionReason::Expired => write!(f, "expired"),
            SelectionReason::OwnerDead => write!(f, "owner dead"),
        }
    }
}

/// Outcome of resolving one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The entry was COMMITTED; its staged values were applied
    RolledForward,
    /// The entry was PENDING or ABORTED; its staging was cleared
    RolledBack,
    /// Another actor finished the entry first
    AlreadyResolved,
}

/// Drives an abandoned attempt to its terminal state
#[derive(Clone)]
pub struct Resolver {
    staging: DocumentStaging,
    atr: AtrStore,
}

impl Resolver {
    /// Create a resolver over the given store and ATR access
    pub fn new(kv: Arc<dyn KvStore>, atr: AtrStore) -> Self {
        Self {
            staging: DocumentStaging::new(kv),
            atr,
        }
    }

    /// Resolve one entry on behalf of its (possibly dead) owner
    ///
    /// The direction is chosen by the entry's state: a decided commit
    /// is finished, everything else is rolled back. `cas` is the ATR
    /// document token under which `entry` was read.
    pub fn resolve(&self, entry: &AtrEntry, cas: Cas, policy: &RetryPolicy) -> Result<Resolution> {
        let mut state = entry.state;
        let mut cas = cas;
        loop {
            match state {
                AttemptState::Completed | AttemptState::RolledBack => {
                    return Ok(Resolution::AlreadyResolved)
                }
                AttemptState::Committed => return self.roll_forward(entry, cas, policy),
                AttemptState::Aborted => return self.roll_back(entry, cas, policy),
                AttemptState::Pending => {
                    // Claim the attempt for rollback. Losing this CAS
                    // means the owner (or another sweeper) got there
                    // first: re-read and follow whatever was decided.
                    match self.atr.transition_state(
                        &entry.attempt_id,
                        cas,
                        AttemptState::Pending,
                        AttemptState::Aborted,
                        policy,
                    ) {
                        Ok(new_cas) => {
                            debug!(attempt_id = %entry.attempt_id, "claimed abandoned attempt for rollback");
                            state = AttemptState::Aborted;
                            cas = new_cas;
                        }
                        Err(Error::AttemptAlreadyResolved { .. }) => {
                            match self.atr.get_entry(&entry.attempt_id)? {
                                None => return Ok(Resolution::AlreadyResolved),
                                Some((fresh, fresh_cas)) => {
                                    state = fresh.state;
                                    cas = fresh_cas;
                                }
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Finish committing a decided entry
    fn roll_forward(&self, entry: &AtrEntry, cas: Cas, policy: &RetryPolicy) -> Result<Resolution> {
        for (_, record) in entry.all_documents() {
            self.staging
                .roll_forward(&record.doc_id(), entry.attempt_id, policy)?;
        }

        match self.atr.transition_state(
            &entry.attempt_id,
            cas,
            AttemptState::Committed,
            AttemptState::Completed,
            policy,
        ) {
            Ok(_) => {
                info!(attempt_id = %entry.attempt_id, docs = entry.document_count(), "rolled attempt forward");
                Ok(Resolution::RolledForward)
            }
            // Entry finished (and possibly collected) under us: the
            // documents are applied either way
            Err(Error::AttemptAlreadyResolved { .. }) => Ok(Resolution::RolledForward),
            Err(e) => Err(e),
        }
    }

    /// Finish rolling back a claimed entry
    fn roll_back(&self, entry: &AtrEntry, cas: Cas, policy: &RetryPolicy) -> Result<Resolution> {
        for (_, record) in entry.all_documents() {
            self.staging
                .roll_back(&record.doc_id(), entry.attempt_id, policy)?;
        }

        match self.atr.transition_state(
            &entry.attempt_id,
            cas,
            AttemptState::Aborted,
            AttemptState::RolledBack,
            policy,
        ) {
            Ok(_) => {
                info!(attempt_id = %entry.attempt_id, docs = entry.document_count(), "rolled attempt back");
                Ok(Resolution::RolledBack)
            }
            Err(Error::AttemptAlreadyResolved { .. }) => Ok(Resolution::RolledBack),
            Err(e) => Err(e),
        }
    }
}
