//! Explicitly-refreshed read view of the label registry.
//!
//! The cache is populated only by [`LabelCache::refresh`]; a resolution miss
//! never triggers a registry read. Callers that need freshness refresh first.
//! Reads always see a complete snapshot, either the one from before a
//! concurrent refresh or the one from after it.

use crate::registry::{LabelId, LabelRegistry, RegistryError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, instrument};

/// A label entry resolved from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLabel {
    pub id: LabelId,
    pub name: String,
}

/// An immutable copy of the registry's id to name mapping, taken at the most
/// recent refresh.
#[derive(Debug, Clone)]
pub struct LabelSnapshot {
    labels: BTreeMap<LabelId, String>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl LabelSnapshot {
    fn unpopulated() -> Self {
        Self {
            labels: BTreeMap::new(),
            refreshed_at: None,
        }
    }

    pub fn labels(&self) -> &BTreeMap<LabelId, String> {
        &self.labels
    }

    /// When the snapshot was taken; `None` until the first refresh.
    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    /// Look up a label by name. When the same name is registered under
    /// several ids, the smallest id wins.
    pub fn resolve(&self, name: &str) -> Option<ResolvedLabel> {
        self.labels
            .iter()
            .find(|(_, candidate)| candidate.as_str() == name)
            .map(|(id, candidate)| ResolvedLabel {
                id: *id,
                name: candidate.clone(),
            })
    }
}

/// Read-through cache over [`LabelRegistry`] with explicit refresh.
pub struct LabelCache {
    registry: Arc<LabelRegistry>,
    snapshot: RwLock<Arc<LabelSnapshot>>,
}

impl LabelCache {
    /// Create an unpopulated cache. Every resolve misses until the first
    /// refresh, even if the registry already has labels.
    pub fn new(registry: Arc<LabelRegistry>) -> Self {
        Self {
            registry,
            snapshot: RwLock::new(Arc::new(LabelSnapshot::unpopulated())),
        }
    }

    /// Replace the snapshot with a fresh registry read.
    ///
    /// On a registry error the current snapshot is kept, so a transient
    /// outage cannot wipe a previously good view.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let labels = self.registry.fetch_all().await?;
        let count = labels.len();

        let snapshot = Arc::new(LabelSnapshot {
            labels,
            refreshed_at: Some(Utc::now()),
        });
        // The lock is only held for the swap, never across the registry read.
        *self.snapshot.write().unwrap() = snapshot;

        metrics::gauge!("curator.labels.cached").set(count as f64);
        debug!(count, "Label cache refreshed");
        Ok(())
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<LabelSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// Resolve a label name against the current snapshot.
    pub fn resolve(&self, name: &str) -> Option<ResolvedLabel> {
        self.snapshot().resolve(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::memory::MemoryDocumentStore;
    use crate::key_generator::ObjectKeyGenerator;
    use crate::object_store::memory::MemoryObjectStore;

    struct Fixture {
        store: Arc<MemoryDocumentStore>,
        registry: Arc<LabelRegistry>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = Arc::new(LabelRegistry::new(
            store.clone(),
            Arc::new(MemoryObjectStore::new()),
            ObjectKeyGenerator::new("images"),
            5,
        ));
        Fixture { store, registry }
    }

    #[tokio::test]
    async fn test_resolve_misses_until_first_refresh() {
        let fx = fixture();
        fx.registry.add_label("cat").await.unwrap();

        let cache = LabelCache::new(fx.registry.clone());
        assert_eq!(cache.resolve("cat"), None);
        assert_eq!(cache.snapshot().refreshed_at(), None);

        cache.refresh().await.unwrap();
        assert_eq!(
            cache.resolve("cat"),
            Some(ResolvedLabel {
                id: 0,
                name: "cat".to_string(),
            })
        );
        assert!(cache.snapshot().refreshed_at().is_some());
    }

    #[tokio::test]
    async fn test_snapshot_is_stale_until_refreshed_again() {
        let fx = fixture();
        fx.registry.add_label("cat").await.unwrap();

        let cache = LabelCache::new(fx.registry.clone());
        cache.refresh().await.unwrap();

        fx.registry.add_label("dog").await.unwrap();
        assert_eq!(cache.resolve("dog"), None);

        cache.refresh().await.unwrap();
        assert_eq!(cache.resolve("dog").map(|label| label.id), Some(1));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let fx = fixture();
        fx.registry.add_label("cat").await.unwrap();

        let cache = LabelCache::new(fx.registry.clone());
        cache.refresh().await.unwrap();

        fx.store.set_unavailable(true);
        let err = cache.refresh().await.unwrap_err();
        assert!(matches!(err, RegistryError::StoreUnavailable(_)));

        assert_eq!(cache.resolve("cat").map(|label| label.id), Some(0));
    }

    #[tokio::test]
    async fn test_refresh_on_empty_registry_surfaces_the_error() {
        let fx = fixture();
        let cache = LabelCache::new(fx.registry.clone());

        let err = cache.refresh().await.unwrap_err();
        assert!(matches!(err, RegistryError::RegistryEmpty));
        assert_eq!(cache.snapshot().refreshed_at(), None);
    }

    #[tokio::test]
    async fn test_duplicate_names_resolve_to_smallest_id() {
        let fx = fixture();
        fx.registry.add_label("cat").await.unwrap();
        fx.registry.add_label("cat").await.unwrap();

        let cache = LabelCache::new(fx.registry.clone());
        cache.refresh().await.unwrap();

        assert_eq!(cache.resolve("cat").map(|label| label.id), Some(0));
        assert_eq!(cache.snapshot().labels().len(), 2);
    }
}
