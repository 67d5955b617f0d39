//! In-memory KV store
//!
//! A linearizable, in-process implementation of the `KvStore` contract
//! used by the test suite and by embedders that want the coordinator
//! without a real cluster. Every operation takes exclusive access to
//! the target document through the map's per-entry lock, so the
//! CAS-check-then-mutate sequence is atomic per document.

use crate::traits::{DocSnapshot, KvStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tandem_core::{Cas, DocId, Error, Result, StagingMetadata};

/// One stored document: visible body, staging slot, revision token
#[derive(Debug, Clone)]
struct StoredDoc {
    body: Option<Value>,
    staging: Option<StagingMetadata>,
    cas: Cas,
}

/// In-memory implementation of the KV contract
///
/// # Example
///
/// ```
/// use tandem_storage::{KvStore, MemoryKvStore};
/// use tandem_core::{Cas, CollectionRef, DocId};
/// use serde_json::json;
///
/// let store = MemoryKvStore::new();
/// let id = DocId::new(CollectionRef::default_in("travel"), "hotel-1");
/// let cas = store.write_doc(&id, Cas::ZERO, json!({"name": "Sea View"})).unwrap();
/// let (body, read_cas) = store.read_doc(&id).unwrap();
/// assert_eq!(body, json!({"name": "Sea View"}));
/// assert_eq!(read_cas, cas);
/// ```
pub struct MemoryKvStore {
    docs: DashMap<DocId, StoredDoc>,
    cas_counter: AtomicU64,
}

impl MemoryKvStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
            cas_counter: AtomicU64::new(1),
        }
    }

    fn next_cas(&self) -> Cas {
        Cas::from_raw(self.cas_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Number of documents currently stored (shadow documents included)
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether the store holds no documents
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn check_cas(doc: &StoredDoc, id: &DocId, expected: Cas) -> Result<()> {
        if doc.cas != expected {
            return Err(Error::CasMismatch { id: id.to_string() });
        }
        Ok(())
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, id: &DocId) -> Result<Option<DocSnapshot>> {
        Ok(self.docs.get(id).map(|doc| DocSnapshot {
            body: doc.body.clone(),
            cas: doc.cas,
            staging: doc.staging.clone(),
        }))
    }

    fn mutate_staged(&self, id: &DocId, expected: Cas, staging: StagingMetadata) -> Result<Cas> {
        match self.docs.entry(id.clone()) {
            Entry::Vacant(vacant) => {
                if !expected.is_zero() {
                    return Err(Error::CasMismatch { id: id.to_string() });
                }
                let cas = self.next_cas();
                vacant.insert(StoredDoc {
                    body: None,
                    staging: Some(staging),
                    cas,
                });
                Ok(cas)
            }
            Entry::Occupied(mut occupied) => {
                Self::check_cas(occupied.get(), id, expected)?;
                let cas = self.next_cas();
                let doc = occupied.get_mut();
                doc.staging = Some(staging);
                doc.cas = cas;
                Ok(cas)
            }
        }
    }

    fn commit_staged(&self, id: &DocId, expected: Cas) -> Result<Cas> {
        match self.docs.entry(id.clone()) {
            Entry::Vacant(_) => Err(Error::DocNotFound { id: id.to_string() }),
            Entry::Occupied(mut occupied) => {
                Self::check_cas(occupied.get(), id, expected)?;
                let staging = occupied.get().staging.clone().ok_or_else(|| {
                    Error::invariant(format!("commit_staged on {} without staging", id))
                })?;

                let cas = self.next_cas();
                match staging.staged_body {
                    Some(body) => {
                        let doc = occupied.get_mut();
                        doc.body = Some(body);
                        doc.staging = None;
                        doc.cas = cas;
                    }
                    // Staged remove: the document disappears
                    None => {
                        occupied.remove();
                    }
                }
                Ok(cas)
            }
        }
    }

    fn remove_staging(&self, id: &DocId, expected: Cas) -> Result<Cas> {
        match self.docs.entry(id.clone()) {
            Entry::Vacant(_) => Err(Error::DocNotFound { id: id.to_string() }),
            Entry::Occupied(mut occupied) => {
                Self::check_cas(occupied.get(), id, expected)?;
                let cas = self.next_cas();
                if occupied.get().body.is_none() {
                    // Shadow document from a staged insert: no visible
                    // document is left behind
                    occupied.remove();
                } else {
                    let doc = occupied.get_mut();
                    doc.staging = None;
                    doc.cas = cas;
                }
                Ok(cas)
            }
        }
    }

    fn read_doc(&self, id: &DocId) -> Result<(Value, Cas)> {
        let doc = self
            .docs
            .get(id)
            .ok_or_else(|| Error::DocNotFound { id: id.to_string() })?;
        let body = doc
            .body
            .clone()
            .ok_or_else(|| Error::DocNotFound { id: id.to_string() })?;
        Ok((body, doc.cas))
    }

    fn write_doc(&self, id: &DocId, expected: Cas, body: Value) -> Result<Cas> {
        match self.docs.entry(id.clone()) {
            Entry::Vacant(vacant) => {
                if !expected.is_zero() {
                    return Err(Error::CasMismatch { id: id.to_string() });
                }
                let cas = self.next_cas();
                vacant.insert(StoredDoc {
                    body: Some(body),
                    staging: None,
                    cas,
                });
                Ok(cas)
            }
            Entry::Occupied(mut occupied) => {
                Self::check_cas(occupied.get(), id, expected)?;
                let cas = self.next_cas();
                let doc = occupied.get_mut();
                doc.body = Some(body);
                doc.cas = cas;
                Ok(cas)
            }
        }
    }

    fn subdoc_create(&self, id: &DocId, expected: Cas, path: &str, value: Value) -> Result<Cas> {
        match self.docs.entry(id.clone()) {
            Entry::Vacant(vacant) => {
                if !expected.is_zero() {
                    return Err(Error::CasMismatch { id: id.to_string() });
                }
                let mut body = Value::Object(Map::new());
                set_path(&mut body, path, value);
                let cas = self.next_cas();
                vacant.insert(StoredDoc {
                    body: Some(body),
                    staging: None,
                    cas,
                });
                Ok(cas)
            }
            Entry::Occupied(mut occupied) => {
                Self::check_cas(occupied.get(), id, expected)?;
                let doc = occupied.get_mut();
                let body = doc.body.get_or_insert_with(|| Value::Object(Map::new()));
                if lookup_path(body, path).is_some() {
                    return Err(Error::PathExists {
                        id: id.to_string(),
                        path: path.to_string(),
                    });
                }
                set_path(body, path, value);
                let cas = self.next_cas();
                doc.cas = cas;
                Ok(cas)
            }
        }
    }

    fn subdoc_read(&self, id: &DocId, path: &str) -> Result<(Value, Cas)> {
        let doc = self
            .docs
            .get(id)
            .ok_or_else(|| Error::DocNotFound { id: id.to_string() })?;
        let body = doc
            .body
            .as_ref()
            .ok_or_else(|| Error::DocNotFound { id: id.to_string() })?;
        let value = lookup_path(body, path).ok_or_else(|| Error::PathNotFound {
            id: id.to_string(),
            path: path.to_string(),
        })?;
        Ok((value.clone(), doc.cas))
    }

    fn subdoc_update(&self, id: &DocId, expected: Cas, path: &str, value: Value) -> Result<Cas> {
        match self.docs.entry(id.clone()) {
            Entry::Vacant(_) => Err(Error::DocNotFound { id: id.to_string() }),
            Entry::Occupied(mut occupied) => {
                Self::check_cas(occupied.get(), id, expected)?;
                let doc = occupied.get_mut();
                let body = doc.body.get_or_insert_with(|| Value::Object(Map::new()));
                set_path(body, path, value);
                let cas = self.next_cas();
                doc.cas = cas;
                Ok(cas)
            }
        }
    }

    fn subdoc_remove(&self, id: &DocId, expected: Cas, path: &str) -> Result<Cas> {
        match self.docs.entry(id.clone()) {
            Entry::Vacant(_) => Err(Error::DocNotFound { id: id.to_string() }),
            Entry::Occupied(mut occupied) => {
                Self::check_cas(occupied.get(), id, expected)?;
                let doc = occupied.get_mut();
                let body = doc.body.as_mut().ok_or_else(|| Error::DocNotFound {
                    id: id.to_string(),
                })?;
                if !remove_path(body, path) {
                    return Err(Error::PathNotFound {
                        id: id.to_string(),
                        path: path.to_string(),
                    });
                }
                let cas = self.next_cas();
                doc.cas = cas;
                Ok(cas)
            }
        }
    }
}

// ============================================================================
// Dotted-path helpers
// ============================================================================

fn lookup_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(body: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = body;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just ensured object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current
        .as_object_mut()
        .expect("just ensured object")
        .insert(segments[segments.len() - 1].to_string(), value);
}

fn remove_path(body: &mut Value, path: &str) -> bool {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = body;
    for segment in &segments[..segments.len() - 1] {
        match current.as_object_mut().and_then(|o| o.get_mut(*segment)) {
            Some(next) => current = next,
            None => return false,
        }
    }
    current
        .as_object_mut()
        .and_then(|o| o.remove(segments[segments.len() - 1]))
        .is_some()
}
