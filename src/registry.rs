//! Label registry: the source of truth mapping numeric label ids to names.
//!
//! The whole registry is one document whose fields are stringified ids
//! mapping to label names, plus an `_id` field used only to address the
//! document. Id allocation is a guarded merge into that document, so two
//! writers can never be handed the same id no matter how they interleave.

use crate::document_store::{Document, DocumentStore, DocumentStoreError, Filter, Patch};
use crate::key_generator::ObjectKeyGenerator;
use crate::object_store::{ObjectStore, PutOptions};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Collection holding the registry document.
pub const REGISTRY_COLLECTION: &str = "labels";

/// Addressing field and value of the singleton registry document.
const ID_FIELD: &str = "_id";
const REGISTRY_DOC_ID: &str = "labels";

/// Numeric label identifier. Ids are allocated contiguously from zero.
pub type LabelId = u32;

/// Errors that can occur reading or mutating the registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("registry is empty; no labels have been added yet")]
    RegistryEmpty,

    #[error("label id allocation contended {attempts} times; try again")]
    AllocationConflict { attempts: u32 },

    #[error("registry record is malformed: {reason}")]
    MalformedRecord { reason: String },
}

impl From<DocumentStoreError> for RegistryError {
    fn from(e: DocumentStoreError) -> Self {
        match e {
            DocumentStoreError::Decode(reason) => RegistryError::MalformedRecord { reason },
            other => RegistryError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Result of a successful [`LabelRegistry::add_label`] call.
///
/// `namespace_created` is false when the registry write landed but the
/// object-store marker write did not. The registry entry is kept rather than
/// rolled back; `reason` carries the store error so the caller can retry the
/// marker by re-adding the label.
#[derive(Debug, Clone, PartialEq)]
pub struct AddLabelOutcome {
    pub id: LabelId,
    pub registry_updated: bool,
    pub namespace_created: bool,
    pub reason: Option<String>,
}

/// The label registry. Owns id allocation; everything else reads it through
/// [`crate::label_cache::LabelCache`].
pub struct LabelRegistry {
    store: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    keys: ObjectKeyGenerator,
    allocation_retries: u32,
}

impl LabelRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        keys: ObjectKeyGenerator,
        allocation_retries: u32,
    ) -> Self {
        Self {
            store,
            objects,
            keys,
            allocation_retries: allocation_retries.max(1),
        }
    }

    /// Read the full id to name mapping from the registry document.
    #[instrument(skip(self))]
    pub async fn fetch_all(&self) -> Result<BTreeMap<LabelId, String>, RegistryError> {
        let address = Filter::new().field_eq(ID_FIELD, REGISTRY_DOC_ID);
        match self.store.find_one(REGISTRY_COLLECTION, &address).await? {
            Some(doc) => parse_registry_doc(&doc),
            None => Err(RegistryError::RegistryEmpty),
        }
    }

    /// Allocate the next id for `name`, persist it, and create the label's
    /// object-store namespace.
    ///
    /// The namespace marker is written only after the registry write
    /// succeeds, and a marker failure does not roll the registry entry back;
    /// it is reported through the outcome instead.
    #[instrument(skip(self, name), fields(label = %name))]
    pub async fn add_label(&self, name: &str) -> Result<AddLabelOutcome, RegistryError> {
        let id = self.allocate_id(name).await?;
        metrics::counter!("curator.labels.added").increment(1);
        info!(id, "Label added to registry");

        let marker_key = self.keys.namespace_marker(name);
        match self
            .objects
            .put_object(&marker_key, Vec::new(), &PutOptions::default())
            .await
        {
            Ok(()) => Ok(AddLabelOutcome {
                id,
                registry_updated: true,
                namespace_created: true,
                reason: None,
            }),
            Err(e) => {
                warn!(key = %marker_key, error = %e, "Label namespace marker write failed");
                Ok(AddLabelOutcome {
                    id,
                    registry_updated: true,
                    namespace_created: false,
                    reason: Some(e.to_string()),
                })
            }
        }
    }

    /// Guarded-write allocation loop.
    ///
    /// Each attempt re-reads the document and then merges `{max + 1: name}`
    /// in, guarded on that field still being absent. Zero modifications
    /// means another writer took the id first, so the loop re-reads and
    /// tries the next one. No lock is held across any of this, and the
    /// namespace write in `add_label` happens entirely outside it.
    async fn allocate_id(&self, name: &str) -> Result<LabelId, RegistryError> {
        let address = Filter::new().field_eq(ID_FIELD, REGISTRY_DOC_ID);

        for attempt in 1..=self.allocation_retries {
            let existing = self.store.find_one(REGISTRY_COLLECTION, &address).await?;

            let Some(doc) = existing else {
                // No document yet: create it with this label as id 0. Losing
                // the creation race to another writer surfaces as a duplicate
                // insert, which is just contention.
                let mut doc = Document::new();
                doc.insert(ID_FIELD.to_string(), REGISTRY_DOC_ID.into());
                doc.insert("0".to_string(), name.into());
                match self.store.insert_one(REGISTRY_COLLECTION, doc).await {
                    Ok(()) => return Ok(0),
                    Err(DocumentStoreError::DuplicateDocument { .. }) => {
                        record_contention(attempt);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            let labels = parse_registry_doc(&doc)?;
            if labels.values().any(|existing| existing == name) {
                warn!("Label name already registered; allocating another id for it");
            }

            let next = labels.keys().next_back().map_or(0, |max| max + 1);
            let guard = address.clone().field_absent(next.to_string());
            let patch = Patch::new().set(next.to_string(), name);

            match self
                .store
                .update_one(REGISTRY_COLLECTION, &guard, &patch)
                .await?
            {
                1 => return Ok(next),
                _ => record_contention(attempt),
            }
        }

        metrics::counter!("curator.allocation.exhausted").increment(1);
        Err(RegistryError::AllocationConflict {
            attempts: self.allocation_retries,
        })
    }
}

fn record_contention(attempt: u32) {
    metrics::counter!("curator.allocation.conflicts").increment(1);
    debug!(attempt, "Label id allocation contended; retrying");
}

fn parse_registry_doc(doc: &Document) -> Result<BTreeMap<LabelId, String>, RegistryError> {
    let mut labels = BTreeMap::new();
    for (field, value) in doc {
        if field == ID_FIELD {
            continue;
        }
        let id: LabelId = field.parse().map_err(|_| RegistryError::MalformedRecord {
            reason: format!("non-numeric id field {field:?}"),
        })?;
        let name = value.as_str().ok_or_else(|| RegistryError::MalformedRecord {
            reason: format!("label {id} has a non-string name"),
        })?;
        labels.insert(id, name.to_string());
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::memory::MemoryDocumentStore;
    use crate::document_store::MockDocumentStore;
    use crate::object_store::memory::MemoryObjectStore;
    use crate::object_store::ObjectAcl;
    use serde_json::json;

    fn registry_with(
        store: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        retries: u32,
    ) -> LabelRegistry {
        LabelRegistry::new(store, objects, ObjectKeyGenerator::new("images"), retries)
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_add_label_to_empty_registry_starts_at_zero() {
        let store = Arc::new(MemoryDocumentStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let registry = registry_with(store.clone(), objects.clone(), 5);

        let outcome = registry.add_label("cat").await.unwrap();

        assert_eq!(
            outcome,
            AddLabelOutcome {
                id: 0,
                registry_updated: true,
                namespace_created: true,
                reason: None,
            }
        );

        let docs = store.documents(REGISTRY_COLLECTION);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get("_id"), Some(&json!("labels")));
        assert_eq!(docs[0].get("0"), Some(&json!("cat")));

        let puts = objects.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].key, "images/cat/");
        assert!(puts[0].body.is_empty());
        assert_eq!(puts[0].acl, ObjectAcl::Private);
    }

    #[tokio::test]
    async fn test_sequential_adds_return_contiguous_ids() {
        let store = Arc::new(MemoryDocumentStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let registry = registry_with(store, objects, 5);

        let mut ids = Vec::new();
        for name in ["cat", "dog", "bird"] {
            ids.push(registry.add_label(name).await.unwrap().id);
        }
        assert_eq!(ids, vec![0, 1, 2]);

        let labels = registry.fetch_all().await.unwrap();
        assert_eq!(labels.get(&0).map(String::as_str), Some("cat"));
        assert_eq!(labels.get(&1).map(String::as_str), Some("dog"));
        assert_eq!(labels.get(&2).map(String::as_str), Some("bird"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_allocate_distinct_ids() {
        let store = Arc::new(MemoryDocumentStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let registry = Arc::new(registry_with(store, objects, 64));

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.add_label(&format!("label-{i}")).await.unwrap().id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();

        let expected: Vec<LabelId> = (0..16).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_allocation_retries_after_losing_the_id_race() {
        let mut store = MockDocumentStore::new();
        let mut seq = mockall::Sequence::new();

        let before = doc(json!({"_id": "labels", "0": "cat"}));
        let after = doc(json!({"_id": "labels", "0": "cat", "1": "dog"}));

        store
            .expect_find_one()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(Some(before.clone())));
        // Another writer claims id 1 between the read and the guarded write.
        store
            .expect_update_one()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, guard, _| guard.absent_fields() == ["1".to_string()])
            .returning(|_, _, _| Ok(0));
        store
            .expect_find_one()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(Some(after.clone())));
        store
            .expect_update_one()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, guard, _| guard.absent_fields() == ["2".to_string()])
            .returning(|_, _, _| Ok(1));

        let objects = Arc::new(MemoryObjectStore::new());
        let registry = registry_with(Arc::new(store), objects, 5);

        let outcome = registry.add_label("dog").await.unwrap();
        assert_eq!(outcome.id, 2);
    }

    #[tokio::test]
    async fn test_allocation_conflict_after_exhausting_retries() {
        let mut store = MockDocumentStore::new();
        let contended = doc(json!({"_id": "labels", "0": "cat"}));

        store
            .expect_find_one()
            .times(3)
            .returning(move |_, _| Ok(Some(contended.clone())));
        store.expect_update_one().times(3).returning(|_, _, _| Ok(0));

        let objects = Arc::new(MemoryObjectStore::new());
        let registry = registry_with(Arc::new(store), objects.clone(), 3);

        let err = registry.add_label("dog").await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::AllocationConflict { attempts: 3 }
        ));
        assert!(objects.puts().is_empty());
    }

    #[tokio::test]
    async fn test_lost_creation_race_retries_against_new_document() {
        let mut store = MockDocumentStore::new();
        let mut seq = mockall::Sequence::new();

        store
            .expect_find_one()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        // Another writer created the document first.
        store
            .expect_insert_one()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|collection, _| {
                Err(DocumentStoreError::DuplicateDocument {
                    collection: collection.to_string(),
                })
            });
        let created = doc(json!({"_id": "labels", "0": "cat"}));
        store
            .expect_find_one()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(Some(created.clone())));
        store
            .expect_update_one()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(1));

        let objects = Arc::new(MemoryObjectStore::new());
        let registry = registry_with(Arc::new(store), objects, 5);

        let outcome = registry.add_label("dog").await.unwrap();
        assert_eq!(outcome.id, 1);
    }

    #[tokio::test]
    async fn test_marker_write_failure_is_reported_not_rolled_back() {
        let store = Arc::new(MemoryDocumentStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        objects.fail_keys_containing("/cat/");
        let registry = registry_with(store, objects, 5);

        let outcome = registry.add_label("cat").await.unwrap();

        assert_eq!(outcome.id, 0);
        assert!(outcome.registry_updated);
        assert!(!outcome.namespace_created);
        assert!(outcome.reason.unwrap().contains("images/cat/"));

        let labels = registry.fetch_all().await.unwrap();
        assert_eq!(labels.get(&0).map(String::as_str), Some("cat"));
    }

    #[tokio::test]
    async fn test_duplicate_names_get_distinct_ids() {
        let store = Arc::new(MemoryDocumentStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let registry = registry_with(store, objects, 5);

        let first = registry.add_label("cat").await.unwrap();
        let second = registry.add_label("cat").await.unwrap();

        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);

        let labels = registry.fetch_all().await.unwrap();
        assert_eq!(labels.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_all_on_missing_document_is_registry_empty() {
        let store = Arc::new(MemoryDocumentStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let registry = registry_with(store, objects, 5);

        let err = registry.fetch_all().await.unwrap_err();
        assert!(matches!(err, RegistryError::RegistryEmpty));
    }

    #[tokio::test]
    async fn test_fetch_all_when_store_is_down() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_unavailable(true);
        let objects = Arc::new(MemoryObjectStore::new());
        let registry = registry_with(store, objects, 5);

        let err = registry.fetch_all().await.unwrap_err();
        assert!(matches!(err, RegistryError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_malformed_registry_document_is_classified() {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .insert_one(
                REGISTRY_COLLECTION,
                doc(json!({"_id": "labels", "zero": "cat"})),
            )
            .await
            .unwrap();
        let objects = Arc::new(MemoryObjectStore::new());
        let registry = registry_with(store, objects, 5);

        let err = registry.fetch_all().await.unwrap_err();
        assert!(matches!(err, RegistryError::MalformedRecord { .. }));
    }

    #[test]
    fn test_parse_registry_doc_skips_only_the_id_field() {
        let labels =
            parse_registry_doc(&doc(json!({"_id": "labels", "0": "cat", "1": "dog"}))).unwrap();
        assert_eq!(labels.len(), 2);

        let err = parse_registry_doc(&doc(json!({"_id": "labels", "0": 7}))).unwrap_err();
        assert!(matches!(err, RegistryError::MalformedRecord { .. }));
    }
}
