//! Ingestion pipeline: content validation, label resolution, and object
//! upload with per-item outcome aggregation.
//!
//! The pipeline owns no persistent state. Labels come from the cache
//! snapshot and bytes go to the object store under generated keys. Every
//! failure is folded into a structured outcome for the caller; nothing here
//! aborts a batch.

use crate::config::IngestConfig;
use crate::key_generator::ObjectKeyGenerator;
use crate::label_cache::{LabelCache, ResolvedLabel};
use crate::object_store::{ObjectAcl, ObjectStore, PutOptions};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// One inbound file to ingest.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Why an item was not stored
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("content type {provided} is not accepted")]
    InvalidContentType { provided: String },

    #[error("label not found")]
    LabelNotFound,

    #[error("object store write failed: {message}")]
    StoreWriteFailed { message: String },
}

/// Per-item result of an upload call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub filename: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl UploadOutcome {
    fn stored(filename: String, key: String) -> Self {
        Self {
            filename,
            accepted: true,
            stored_key: Some(key),
            reason: None,
        }
    }

    fn rejected(filename: String, reason: RejectReason) -> Self {
        Self {
            filename,
            accepted: false,
            stored_key: None,
            reason: Some(reason),
        }
    }

    /// Whether this item was skipped by the content-type gate.
    pub fn skipped_for_content_type(&self) -> bool {
        matches!(
            self.reason,
            Some(RejectReason::InvalidContentType { .. })
        )
    }
}

/// Orchestrates validation, resolution, naming, and storage for uploads.
pub struct IngestionPipeline {
    cache: Arc<LabelCache>,
    objects: Arc<dyn ObjectStore>,
    keys: ObjectKeyGenerator,
    accepted_content_types: Vec<String>,
    upload_concurrency: usize,
    acl: ObjectAcl,
}

impl IngestionPipeline {
    pub fn new(
        cache: Arc<LabelCache>,
        objects: Arc<dyn ObjectStore>,
        keys: ObjectKeyGenerator,
        config: &IngestConfig,
    ) -> Self {
        Self {
            cache,
            objects,
            keys,
            accepted_content_types: config.accepted_content_types.clone(),
            upload_concurrency: config.upload_concurrency.max(1),
            acl: if config.public_read {
                ObjectAcl::PublicRead
            } else {
                ObjectAcl::Private
            },
        }
    }

    /// Ingest a single file under `label`.
    ///
    /// The content-type gate runs before label resolution, and a resolution
    /// miss never contacts the object store.
    #[instrument(skip(self, item), fields(label = %label, filename = %item.filename))]
    pub async fn upload_one(&self, label: &str, item: UploadItem) -> UploadOutcome {
        if !self.accepts(&item.content_type) {
            return self.reject_content_type(item);
        }

        let Some(resolved) = self.cache.resolve(label) else {
            metrics::counter!("curator.images.rejected").increment(1);
            debug!("Rejecting upload for unknown label");
            return UploadOutcome::rejected(item.filename, RejectReason::LabelNotFound);
        };

        self.store_item(&resolved, item).await
    }

    /// Ingest a batch of files under one label.
    ///
    /// The label is resolved once. When it cannot be resolved the whole
    /// batch is rejected uniformly, without evaluating content types. When it
    /// resolves, items are evaluated independently and uploaded with bounded
    /// concurrency; one item's failure never skips its siblings. The outcome
    /// list always matches the input order and length.
    #[instrument(skip(self, items), fields(label = %label, count = items.len()))]
    pub async fn upload_many(&self, label: &str, items: Vec<UploadItem>) -> Vec<UploadOutcome> {
        let Some(resolved) = self.cache.resolve(label) else {
            metrics::counter!("curator.images.rejected").increment(items.len() as u64);
            debug!("Rejecting batch for unknown label");
            return items
                .into_iter()
                .map(|item| UploadOutcome::rejected(item.filename, RejectReason::LabelNotFound))
                .collect();
        };

        // Completion order is arbitrary, so outcomes are tagged with their
        // input index and reordered before returning.
        let mut outcomes: Vec<(usize, UploadOutcome)> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let resolved = resolved.clone();
                async move { (index, self.evaluate_item(&resolved, item).await) }
            })
            .buffer_unordered(self.upload_concurrency)
            .collect()
            .await;

        outcomes.sort_unstable_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    fn accepts(&self, content_type: &str) -> bool {
        self.accepted_content_types
            .iter()
            .any(|accepted| accepted.eq_ignore_ascii_case(content_type))
    }

    async fn evaluate_item(&self, resolved: &ResolvedLabel, item: UploadItem) -> UploadOutcome {
        if !self.accepts(&item.content_type) {
            return self.reject_content_type(item);
        }
        self.store_item(resolved, item).await
    }

    fn reject_content_type(&self, item: UploadItem) -> UploadOutcome {
        metrics::counter!("curator.images.skipped").increment(1);
        debug!(
            filename = %item.filename,
            content_type = %item.content_type,
            "Skipping item with unaccepted content type"
        );
        UploadOutcome::rejected(
            item.filename,
            RejectReason::InvalidContentType {
                provided: item.content_type,
            },
        )
    }

    async fn store_item(&self, resolved: &ResolvedLabel, item: UploadItem) -> UploadOutcome {
        let UploadItem {
            filename,
            content_type,
            content,
        } = item;

        let key = self.keys.object_key(&resolved.name, &content_type);
        let size_bytes = content.len();
        let options = PutOptions {
            content_type: Some(content_type),
            acl: self.acl,
        };

        let started = Instant::now();
        match self.objects.put_object(&key, content, &options).await {
            Ok(()) => {
                metrics::counter!("curator.images.stored").increment(1);
                metrics::counter!("curator.bytes.uploaded").increment(size_bytes as u64);
                metrics::histogram!("curator.upload.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                debug!(key = %key, "Image stored");
                UploadOutcome::stored(filename, key)
            }
            Err(e) => {
                metrics::counter!("curator.images.failed").increment(1);
                warn!(key = %key, error = %e, "Image upload failed");
                UploadOutcome::rejected(
                    filename,
                    RejectReason::StoreWriteFailed {
                        message: e.to_string(),
                    },
                )
            }
        }
    }
}
