//! Document-oriented storage contract backing the label registry.
//!
//! The registry talks to its store through a deliberately small surface:
//! `find_one`, `update_one`, and `insert_one` over JSON documents. Filters
//! support field-equality and field-absence conditions; the absence condition
//! is what lets the registry express its compare-and-swap id allocation as a
//! single guarded update.

use crate::config::RegistryStoreConfig;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// A stored document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, Value>;

/// Errors that can occur talking to the document store
#[derive(Error, Debug)]
pub enum DocumentStoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate document in collection {collection}")]
    DuplicateDocument { collection: String },

    #[error("failed to decode document: {0}")]
    Decode(String),
}

/// Selection criteria for `find_one` / `update_one`.
///
/// A document matches when every equality condition holds and none of the
/// listed fields are present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    eq: Vec<(String, Value)>,
    absent: Vec<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value`.
    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((field.into(), value.into()));
        self
    }

    /// Require `field` to be absent from the document.
    pub fn field_absent(mut self, field: impl Into<String>) -> Self {
        self.absent.push(field.into());
        self
    }

    /// The equality conditions as one JSON object, for containment queries.
    pub fn eq_object(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (field, value) in &self.eq {
            object.insert(field.clone(), value.clone());
        }
        Value::Object(object)
    }

    /// Fields required to be absent.
    pub fn absent_fields(&self) -> &[String] {
        &self.absent
    }
}

/// A set-merge patch: each field is written into the document, replacing any
/// existing value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    set: Vec<(String, Value)>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `field` to `value`.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((field.into(), value.into()));
        self
    }

    /// The patch as one JSON object, for merge operators.
    pub fn set_object(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (field, value) in &self.set {
            object.insert(field.clone(), value.clone());
        }
        Value::Object(object)
    }
}

/// Document store collaborator contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Return the first document in `collection` matching `filter`, if any.
    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, DocumentStoreError>;

    /// Merge `patch` into at most one document matching `filter`.
    ///
    /// Returns the number of documents modified (0 or 1). A zero count with a
    /// guard filter means the guard no longer held when the write was applied.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64, DocumentStoreError>;

    /// Insert a new document into `collection`.
    ///
    /// Fails with [`DocumentStoreError::DuplicateDocument`] when a document
    /// with the same `_id` already exists in the collection.
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
    ) -> Result<(), DocumentStoreError>;
}

/// PostgreSQL-backed document store.
///
/// Documents live in a single `documents` table with a JSONB column; a unique
/// index on `(collection, doc->>'_id')` rejects concurrent creation of the
/// same document.
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    /// Connect to PostgreSQL with a connection pool
    pub async fn connect(config: &RegistryStoreConfig) -> Result<Self, DocumentStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .map_err(|e| DocumentStoreError::Unavailable(e.to_string()))?;

        info!("Connected to registry database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), DocumentStoreError> {
        info!("Running registry database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DocumentStoreError::Unavailable(format!("migration failed: {e}")))?;

        info!("Registry database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self, filter), fields(collection = %collection))]
    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, DocumentStoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM documents
            WHERE collection = $1 AND doc @> $2 AND NOT (doc ?| $3)
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(collection)
        .bind(filter.eq_object())
        .bind(filter.absent_fields().to_vec())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DocumentStoreError::Unavailable(e.to_string()))?;

        match row {
            Some(row) => {
                let doc: Value = row
                    .try_get("doc")
                    .map_err(|e| DocumentStoreError::Decode(e.to_string()))?;
                match doc {
                    Value::Object(map) => Ok(Some(map)),
                    other => Err(DocumentStoreError::Decode(format!(
                        "expected a JSON object, got {other}"
                    ))),
                }
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, filter, patch), fields(collection = %collection))]
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64, DocumentStoreError> {
        // FOR UPDATE makes the guard sound under READ COMMITTED: a writer that
        // blocks on the row lock re-checks the filter against the committed
        // row version and reports zero modifications when the guard no longer
        // holds.
        let result = sqlx::query(
            r#"
            UPDATE documents SET doc = doc || $4
            WHERE ctid IN (
                SELECT ctid FROM documents
                WHERE collection = $1 AND doc @> $2 AND NOT (doc ?| $3)
                ORDER BY id
                LIMIT 1
                FOR UPDATE
            )
            "#,
        )
        .bind(collection)
        .bind(filter.eq_object())
        .bind(filter.absent_fields().to_vec())
        .bind(patch.set_object())
        .execute(&self.pool)
        .await
        .map_err(|e| DocumentStoreError::Unavailable(e.to_string()))?;

        debug!(
            modified = result.rows_affected(),
            "Applied document update"
        );

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, document), fields(collection = %collection))]
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
    ) -> Result<(), DocumentStoreError> {
        let result = sqlx::query("INSERT INTO documents (collection, doc) VALUES ($1, $2)")
            .bind(collection)
            .bind(Value::Object(document))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(DocumentStoreError::DuplicateDocument {
                    collection: collection.to_string(),
                })
            }
            Err(e) => Err(DocumentStoreError::Unavailable(e.to_string())),
        }
    }
}
