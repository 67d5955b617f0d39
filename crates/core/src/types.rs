//! Core types for the transaction coordinator
//!
//! This module defines the foundational types:
//! - AttemptId / TransactionId / ClientId: uuid-backed identifiers
//! - CollectionRef / DocId: location of a document in the KV store
//! - Cas: opaque compare-and-swap token
//! - AttemptState: the persisted attempt state machine
//! - AtrEntry / StagingMetadata / DocRecord / ClientRecordDoc: the
//!   persisted layouts shared with other client implementations
//!
//! The serde field names on the persisted layouts are an interop
//! contract: a mixed-version fleet reads each other's records, so they
//! must not change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier using UUID v4
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from a string representation
            ///
            /// Accepts standard UUID format. Returns None if the string
            /// is not a valid UUID.
            pub fn from_string(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id! {
    /// Unique identifier for one execution try of a transaction body
    ///
    /// A transaction may involve multiple attempts if earlier ones fail
    /// and are retried by the application; each gets a fresh AttemptId.
    AttemptId
}

uuid_id! {
    /// Identifier shared by all attempts of one logical transaction
    TransactionId
}

uuid_id! {
    /// Identifier of one client process, registered in the client record
    ClientId
}

// ============================================================================
// Document location
// ============================================================================

/// Bucket/scope/collection triple locating a keyspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionRef {
    /// Bucket name (top-level isolation)
    pub bucket: String,
    /// Scope name
    pub scope: String,
    /// Collection name
    pub collection: String,
}

impl CollectionRef {
    /// Create a new collection reference
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// Collection with "_default" scope and collection in the given bucket
    pub fn default_in(bucket: impl Into<String>) -> Self {
        Self::new(bucket, "_default", "_default")
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Full address of a document: collection plus key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocId {
    /// Keyspace holding the document
    pub collection: CollectionRef,
    /// Document key within the collection
    pub key: String,
}

impl DocId {
    /// Create a new document id
    pub fn new(collection: CollectionRef, key: impl Into<String>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

// ============================================================================
// CAS token
// ============================================================================

/// Opaque compare-and-swap token
///
/// Changes on every successful write of a document. Only equality is
/// meaningful to callers; the numeric content is an artifact of the
/// store. `Cas::ZERO` is the "document must not exist" sentinel used
/// when creating documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cas(u64);

impl Cas {
    /// The "document must not exist" sentinel
    pub const ZERO: Cas = Cas(0);

    /// Wrap a raw token value
    pub fn from_raw(raw: u64) -> Self {
        Cas(raw)
    }

    /// Raw token value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is the must-not-exist sentinel
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

// ============================================================================
// Attempt state machine
// ============================================================================

/// Persisted state of a transaction attempt
///
/// State transitions are monotonic and one-directional per attempt:
///
/// - `Pending` → `Committed` → `Completed` (commit path)
/// - `Pending` → `Aborted` → `RolledBack` (rollback path)
///
/// No other transition is legal. An entry past `Completed` or
/// `RolledBack` is terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    /// Attempt is staging documents; outcome undecided
    Pending,
    /// Commit decided; staged values are being applied
    Committed,
    /// Commit fully applied to every touched document
    Completed,
    /// Rollback decided; staging metadata is being cleared
    Aborted,
    /// Rollback fully applied; no staged value remains
    RolledBack,
}

impl AttemptState {
    /// Whether this state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::RolledBack)
    }

    /// Whether the outcome of the attempt has been decided
    ///
    /// Once decided, a sweeper drives the entry the rest of the way down
    /// the same branch; the decision itself never flips.
    pub fn is_decided(&self) -> bool {
        !matches!(self, AttemptState::Pending)
    }

    /// Whether `next` is a legal direct successor of this state
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        matches!(
            (self, next),
            (AttemptState::Pending, AttemptState::Committed)
                | (AttemptState::Pending, AttemptState::Aborted)
                | (AttemptState::Committed, AttemptState::Completed)
                | (AttemptState::Aborted, AttemptState::RolledBack)
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptState::Pending => "PENDING",
            AttemptState::Committed => "COMMITTED",
            AttemptState::Completed => "COMPLETED",
            AttemptState::Aborted => "ABORTED",
            AttemptState::RolledBack => "ROLLED_BACK",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Staged operations
// ============================================================================

/// Kind of mutation an attempt staged on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Create a document that did not exist
    Insert,
    /// Replace an existing document's body
    Replace,
    /// Remove an existing document
    Remove,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationType::Insert => "insert",
            OperationType::Replace => "replace",
            OperationType::Remove => "remove",
        };
        write!(f, "{}", s)
    }
}

/// A staged mutation with its proposed body
///
/// Tagged variant consumed by a single resolution function; `Remove`
/// carries no body.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedOperation {
    /// Create the document with this body
    Insert(serde_json::Value),
    /// Replace the document's body with this value
    Replace(serde_json::Value),
    /// Remove the document
    Remove,
}

impl StagedOperation {
    /// The operation kind of this staged mutation
    pub fn operation_type(&self) -> OperationType {
        match self {
            StagedOperation::Insert(_) => OperationType::Insert,
            StagedOperation::Replace(_) => OperationType::Replace,
            StagedOperation::Remove => OperationType::Remove,
        }
    }

    /// The proposed body, if the operation carries one
    pub fn staged_body(&self) -> Option<&serde_json::Value> {
        match self {
            StagedOperation::Insert(body) | StagedOperation::Replace(body) => Some(body),
            StagedOperation::Remove => None,
        }
    }
}

// ============================================================================
// Persisted layouts (interop contract)
// ============================================================================

/// Staging metadata held on a document while an attempt owns it
///
/// Invisible to non-transactional readers; present only between staging
/// and resolution. `crc32_of_original_body` lets non-transactional
/// writers detect that they are racing an in-flight transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingMetadata {
    /// Attempt that staged this document
    pub attempt_id: AttemptId,
    /// Key of the ATR document tracking the attempt
    pub atr_id: String,
    /// Bucket of the ATR document
    pub atr_bucket: String,
    /// Scope of the ATR document
    pub atr_scope: String,
    /// Collection of the ATR document
    pub atr_collection: String,
    /// Proposed new body; absent for staged removes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_body: Option<serde_json::Value>,
    /// Kind of staged mutation
    pub operation_type: OperationType,
    /// CRC32 of the body as it was when staging began; absent for inserts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crc32_of_original_body: Option<u32>,
}

impl StagingMetadata {
    /// Location of the ATR document this staging points back to
    pub fn atr_doc_id(&self) -> DocId {
        DocId::new(
            CollectionRef::new(
                self.atr_bucket.clone(),
                self.atr_scope.clone(),
                self.atr_collection.clone(),
            ),
            self.atr_id.clone(),
        )
    }
}

/// Reference to a touched document recorded in an ATR entry
///
/// Enough to revisit the document during commit, rollback, or cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    /// Document key
    pub id: String,
    /// Bucket holding the document
    pub bucket: String,
    /// Scope holding the document
    pub scope: String,
    /// Collection holding the document
    pub collection: String,
}

impl DocRecord {
    /// Build a record from a document id
    pub fn from_doc_id(id: &DocId) -> Self {
        Self {
            id: id.key.clone(),
            bucket: id.collection.bucket.clone(),
            scope: id.collection.scope.clone(),
            collection: id.collection.collection.clone(),
        }
    }

    /// Reconstruct the document id this record points at
    pub fn doc_id(&self) -> DocId {
        DocId::new(
            CollectionRef::new(self.bucket.clone(), self.scope.clone(), self.collection.clone()),
            self.id.clone(),
        )
    }
}

/// One attempt's entry inside an ATR document
///
/// Created as `Pending` when the attempt stages its first document,
/// mutated only by the owning attempt or (after expiry) a cleanup
/// sweeper, and garbage-collected after completion plus a grace period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtrEntry {
    /// Attempt this entry tracks
    pub attempt_id: AttemptId,
    /// Logical transaction the attempt belongs to
    pub transaction_id: TransactionId,
    /// Current persisted state
    pub state: AttemptState,
    /// Epoch milliseconds when the attempt started
    pub start_timestamp: u64,
    /// How long after start the attempt may keep writing
    pub expiry_duration_ms: u64,
    /// Documents staged for insert
    #[serde(default)]
    pub documents_inserted: Vec<DocRecord>,
    /// Documents staged for replace
    #[serde(default)]
    pub documents_replaced: Vec<DocRecord>,
    /// Documents staged for remove
    #[serde(default)]
    pub documents_removed: Vec<DocRecord>,
    /// Client process that owns the attempt
    ///
    /// Additive field: entries written by clients that do not record it
    /// still clean up via the normal expiry path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uuid: Option<ClientId>,
}

impl AtrEntry {
    /// Create a fresh PENDING entry for an attempt starting now
    pub fn new(
        attempt_id: AttemptId,
        transaction_id: TransactionId,
        client_uuid: ClientId,
        start_timestamp: u64,
        expiry_duration_ms: u64,
    ) -> Self {
        Self {
            attempt_id,
            transaction_id,
            state: AttemptState::Pending,
            start_timestamp,
            expiry_duration_ms,
            documents_inserted: Vec::new(),
            documents_replaced: Vec::new(),
            documents_removed: Vec::new(),
            client_uuid: Some(client_uuid),
        }
    }

    /// Whether the attempt's own expiry has elapsed at `now_ms`
    pub fn has_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.start_timestamp.saturating_add(self.expiry_duration_ms)
    }

    /// The doc-record list for one operation type
    pub fn documents_for(&self, op: OperationType) -> &[DocRecord] {
        match op {
            OperationType::Insert => &self.documents_inserted,
            OperationType::Replace => &self.documents_replaced,
            OperationType::Remove => &self.documents_removed,
        }
    }

    /// Record a touched document under its operation type
    pub fn record_document(&mut self, op: OperationType, record: DocRecord) {
        let list = match op {
            OperationType::Insert => &mut self.documents_inserted,
            OperationType::Replace => &mut self.documents_replaced,
            OperationType::Remove => &mut self.documents_removed,
        };
        if !list.contains(&record) {
            list.push(record);
        }
    }

    /// All touched documents with their operation types
    pub fn all_documents(&self) -> impl Iterator<Item = (OperationType, &DocRecord)> {
        self.documents_inserted
            .iter()
            .map(|r| (OperationType::Insert, r))
            .chain(
                self.documents_replaced
                    .iter()
                    .map(|r| (OperationType::Replace, r)),
            )
            .chain(
                self.documents_removed
                    .iter()
                    .map(|r| (OperationType::Remove, r)),
            )
    }

    /// Total number of touched documents
    pub fn document_count(&self) -> usize {
        self.documents_inserted.len() + self.documents_replaced.len() + self.documents_removed.len()
    }
}

/// One client's registration inside the client record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecordEntry {
    /// Epoch milliseconds of the client's last heartbeat
    pub heartbeat_timestamp: u64,
    /// How long after the heartbeat the registration stays valid
    pub expiry_duration_ms: u64,
}

impl ClientRecordEntry {
    /// Whether this registration has gone stale at `now_ms`
    pub fn has_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.heartbeat_timestamp.saturating_add(self.expiry_duration_ms)
    }
}

/// The shared client record document, one per bucket
///
/// Every active client upserts itself here on a periodic heartbeat; a
/// client absent or stale beyond its expiry is treated as dead by all
/// observers without explicit deregistration. Membership is approximate
/// and eventually consistent, so cleanup actions derived from it must
/// be idempotent and safe to race.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecordDoc {
    /// Registered clients keyed by client uuid string
    #[serde(default)]
    pub clients: BTreeMap<String, ClientRecordEntry>,
    /// Manual cleanup override switch
    #[serde(default)]
    pub override_enabled: bool,
    /// Epoch milliseconds at which the override lapses
    #[serde(default)]
    pub override_expires: u64,
}

impl ClientRecordDoc {
    /// Client ids whose registration has expired at `now_ms`
    pub fn expired_ids(&self, now_ms: u64) -> Vec<String> {
        self.clients
            .iter()
            .filter(|(_, entry)| entry.has_expired(now_ms))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether the manual override is currently in force
    pub fn override_active(&self, now_ms: u64) -> bool {
        self.override_enabled && now_ms < self.override_expires
    }
}

/// Current time as epoch milliseconds
pub fn epoch_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
