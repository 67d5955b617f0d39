//! Contract tests driven through `Arc<dyn KvStore>`, the way every
//! consumer sees the store.

use serde_json::json;
use std::sync::Arc;
use tandem_core::{
    AttemptId, Cas, CollectionRef, DocId, Error, OperationType, StagingMetadata,
};
use tandem_storage::{KvStore, MemoryKvStore};

fn store() -> Arc<dyn KvStore> {
    Arc::new(MemoryKvStore::new())
}

fn doc_id(key: &str) -> DocId {
    DocId::new(CollectionRef::default_in("travel"), key)
}

fn staging(attempt_id: AttemptId, body: Option<serde_json::Value>, op: OperationType) -> StagingMetadata {
    StagingMetadata {
        attempt_id,
        atr_id: "_txn:atr-0".to_string(),
        atr_bucket: "travel".to_string(),
        atr_scope: "_default".to_string(),
        atr_collection: "_default".to_string(),
        staged_body: body,
        operation_type: op,
        crc32_of_original_body: None,
    }
}

#[test]
fn test_full_staging_lifecycle_through_trait_object() {
    let kv = store();
    let id = doc_id("hotel-1");
    let attempt = AttemptId::new();

    // Create, stage a replace, commit the staged value
    let cas = kv.write_doc(&id, Cas::ZERO, json!({"price": 100})).unwrap();
    let cas = kv
        .mutate_staged(
            &id,
            cas,
            staging(attempt, Some(json!({"price": 200})), OperationType::Replace),
        )
        .unwrap();

    let snap = kv.get(&id).unwrap().unwrap();
    assert_eq!(snap.body, Some(json!({"price": 100})));
    assert_eq!(snap.staging.as_ref().unwrap().attempt_id, attempt);

    kv.commit_staged(&id, cas).unwrap();
    let snap = kv.get(&id).unwrap().unwrap();
    assert_eq!(snap.body, Some(json!({"price": 200})));
    assert!(snap.staging.is_none());
}

#[test]
fn test_subdoc_lifecycle_on_metadata_document() {
    let kv = store();
    let id = doc_id("_txn:atr-3");

    let cas = kv
        .subdoc_create(&id, Cas::ZERO, "attempts.a1", json!({"state": "PENDING"}))
        .unwrap();
    let cas = kv
        .subdoc_update(&id, cas, "attempts.a1.state", json!("COMMITTED"))
        .unwrap();

    let (value, _) = kv.subdoc_read(&id, "attempts.a1.state").unwrap();
    assert_eq!(value, json!("COMMITTED"));

    kv.subdoc_remove(&id, cas, "attempts.a1").unwrap();
    assert!(matches!(
        kv.subdoc_read(&id, "attempts.a1"),
        Err(Error::PathNotFound { .. })
    ));
}

#[test]
fn test_concurrent_staging_single_winner() {
    // Many attempts race to stage the same document from the same
    // token; the store's CAS admits exactly one
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let id = doc_id("contended");
    let cas = kv.write_doc(&id, Cas::ZERO, json!({"v": 0})).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let kv = Arc::clone(&kv);
            let id = id.clone();
            std::thread::spawn(move || {
                kv.mutate_staged(
                    &id,
                    cas,
                    staging(AttemptId::new(), Some(json!({"v": 1})), OperationType::Replace),
                )
                .is_ok()
            })
        })
        .collect();

    let winners: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap() as usize)
        .sum();
    assert_eq!(winners, 1);

    let snap = kv.get(&id).unwrap().unwrap();
    assert!(snap.staging.is_some());
    assert_eq!(snap.body, Some(json!({"v": 0})));
}
