//! Curator Ingestion Service
//!
//! Image ingestion and label registry service for the Curator dataset
//! platform. This service maintains a numeric label registry in PostgreSQL,
//! stores uploaded images in S3 under per-label namespaces, and serves a
//! JSON API for label management and single or bulk image ingestion.
//!
//! ## Features
//!
//! - **Race-Free Id Allocation**: Label ids are allocated with a guarded
//!   merge into the registry document, so concurrent writers always receive
//!   distinct, contiguous ids
//! - **Explicit Label Cache**: Uploads resolve labels against an immutable
//!   snapshot that only changes when a caller refreshes it
//! - **Collision-Resistant Object Keys**: Every stored image gets a fresh
//!   UUID-based key inside its label's namespace
//! - **Per-Item Batch Outcomes**: Bulk uploads report one outcome per file,
//!   in request order, with a tagged reason for every rejection
//!
//! ## Architecture
//!
//! ```text
//! HTTP API                    S3 Bucket                PostgreSQL
//! ┌──────────────┐           ┌──────────────┐         ┌──────────────┐
//! │ POST labels  │           │ images/      │         │ documents    │
//! │ POST images  │           │   {label}/   │         │  (registry)  │
//! └──────────────┘           │   {uuid}.ext │         └──────────────┘
//!        │                   └──────────────┘                ▲
//!        ▼                          ▲                        │
//! ┌──────────────┐                  │                        │
//! │ Ingestion    │──────────────────┤                        │
//! │ Pipeline     │                  │                        │
//! └──────────────┘                  │                        │
//!        │                          │                        │
//!        ▼                          │                        │
//! ┌──────────────┐           ┌──────────────┐                │
//! │ Label        │◀──────────│ Label        │────────────────┘
//! │ Cache        │  refresh  │ Registry     │
//! └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod document_store;
pub mod key_generator;
pub mod label_cache;
pub mod object_store;
pub mod pipeline;
pub mod registry;

pub use api::{AppState, ErrorResponse};
pub use config::Config;
pub use document_store::{
    Document, DocumentStore, DocumentStoreError, Filter, Patch, PostgresDocumentStore,
};
pub use key_generator::ObjectKeyGenerator;
pub use label_cache::{LabelCache, LabelSnapshot, ResolvedLabel};
pub use object_store::{ObjectAcl, ObjectStore, ObjectStoreError, PutOptions, S3ObjectStore};
pub use pipeline::{IngestionPipeline, RejectReason, UploadItem, UploadOutcome};
pub use registry::{AddLabelOutcome, LabelId, LabelRegistry, RegistryError};
