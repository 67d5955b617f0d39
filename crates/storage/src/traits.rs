//! Abstract contract consumed from the KV collaborator
//!
//! The coordinator never talks to a concrete store; it is written
//! against `KvStore`, an abstract operation set keyed by document id
//! plus revision token. A real cluster client implements this trait
//! over its wire protocol; `MemoryKvStore` implements it in-process
//! for tests and embedders.
//!
//! Every operation is a linearizable single-document action. CAS
//! expectations are mandatory: `Cas::ZERO` means "the document must not
//! exist", anything else must equal the document's current token or the
//! operation fails with `CasMismatch`. Errors are classified per the
//! retry policy: transient outcomes may be retried by the caller,
//! terminal ones propagate.

use serde_json::Value;
use tandem_core::{Cas, DocId, Result, StagingMetadata};

/// Point-in-time view of a document
///
/// `body` is what non-transactional readers see; `staging` is the
/// in-flight metadata held by at most one attempt. A document staged
/// for insert has staging but no body yet (a "shadow" document that
/// disappears again if the attempt rolls back).
#[derive(Debug, Clone, PartialEq)]
pub struct DocSnapshot {
    /// Committed, reader-visible body; None for a staged-insert shadow
    pub body: Option<Value>,
    /// Current CAS token
    pub cas: Cas,
    /// In-flight staging metadata, if an attempt holds the document
    pub staging: Option<StagingMetadata>,
}

impl DocSnapshot {
    /// Whether any attempt currently holds this document
    pub fn is_staged(&self) -> bool {
        self.staging.is_some()
    }
}

/// Abstract single-document operation set of the underlying KV store
///
/// All methods block until the store answers or the operation times
/// out; a timeout surfaces as `Error::TransientStore`.
pub trait KvStore: Send + Sync {
    /// Read a document's visible and staged state
    ///
    /// Returns `Ok(None)` when the document does not exist at all (no
    /// body and no staging).
    fn get(&self, id: &DocId) -> Result<Option<DocSnapshot>>;

    /// Write staging metadata onto a document
    ///
    /// `expected == Cas::ZERO` creates a shadow document (staged
    /// insert); the document must not exist. Otherwise `expected` must
    /// match the current token. The visible body is untouched.
    fn mutate_staged(&self, id: &DocId, expected: Cas, staging: StagingMetadata) -> Result<Cas>;

    /// Apply a document's staged value as its real value
    ///
    /// Insert/replace stagings become the visible body; a staged remove
    /// deletes the document. Staging metadata is cleared either way.
    fn commit_staged(&self, id: &DocId, expected: Cas) -> Result<Cas>;

    /// Clear a document's staging metadata without applying it
    ///
    /// A shadow document (staged insert) disappears entirely, leaving
    /// no visible document behind.
    fn remove_staging(&self, id: &DocId, expected: Cas) -> Result<Cas>;

    /// Read a whole metadata document (ATR, client record)
    fn read_doc(&self, id: &DocId) -> Result<(Value, Cas)>;

    /// CAS-write a whole metadata document
    ///
    /// `expected == Cas::ZERO` creates the document, failing with
    /// `CasMismatch` if it already exists.
    fn write_doc(&self, id: &DocId, expected: Cas, body: Value) -> Result<Cas>;

    /// Create a value at a sub-document path
    ///
    /// `expected == Cas::ZERO` creates the containing document as well.
    /// Fails with `PathExists` if the path is already populated.
    fn subdoc_create(&self, id: &DocId, expected: Cas, path: &str, value: Value) -> Result<Cas>;

    /// Read the value at a sub-document path along with the document CAS
    fn subdoc_read(&self, id: &DocId, path: &str) -> Result<(Value, Cas)>;

    /// Upsert the value at a sub-document path
    fn subdoc_update(&self, id: &DocId, expected: Cas, path: &str, value: Value) -> Result<Cas>;

    /// Remove the value at a sub-document path
    ///
    /// Fails with `PathNotFound` if the path is not populated.
    fn subdoc_remove(&self, id: &DocId, expected: Cas, path: &str) -> Result<Cas>;
}
