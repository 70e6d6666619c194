use crate::config::ApiConfig;
use crate::document_store::PostgresDocumentStore;
use crate::label_cache::LabelCache;
use crate::pipeline::{IngestionPipeline, UploadItem, UploadOutcome};
use crate::registry::{AddLabelOutcome, LabelId, LabelRegistry, RegistryError};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<LabelRegistry>,
    pub cache: Arc<LabelCache>,
    pub pipeline: Arc<IngestionPipeline>,
    pub documents: Arc<PostgresDocumentStore>,
    pub max_batch_items: usize,
}

/// One file in an upload request
#[derive(Debug, Serialize, Deserialize)]
pub struct FileUpload {
    /// Original filename, echoed back in the outcome
    pub filename: String,
    /// Declared content type
    pub content_type: String,
    /// File bytes, base64-encoded
    #[serde(with = "base64_serde")]
    pub content: Vec<u8>,
}

impl From<FileUpload> for UploadItem {
    fn from(file: FileUpload) -> Self {
        Self {
            filename: file.filename,
            content_type: file.content_type,
            content: file.content,
        }
    }
}

/// Single upload request
#[derive(Debug, Deserialize)]
pub struct SingleUploadRequest {
    /// Label to file the image under
    pub label: String,
    /// The file to store
    pub file: FileUpload,
}

/// Bulk upload request
#[derive(Debug, Deserialize)]
pub struct BulkUploadRequest {
    /// Label to file every image under
    pub label: String,
    /// The files to store
    pub files: Vec<FileUpload>,
}

/// Label listing response
#[derive(Debug, Serialize)]
pub struct LabelListResponse {
    pub labels: BTreeMap<LabelId, String>,
    pub count: usize,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Response for a newly added label
#[derive(Debug, Serialize)]
pub struct AddLabelResponse {
    pub id: LabelId,
    pub name: String,
    pub registry_updated: bool,
    pub namespace_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Single upload response
#[derive(Debug, Serialize)]
pub struct SingleUploadResponse {
    pub label: String,
    pub label_id: Option<LabelId>,
    pub outcome: UploadOutcome,
}

/// Bulk upload response
#[derive(Debug, Serialize)]
pub struct BulkUploadResponse {
    pub label: String,
    pub label_id: Option<LabelId>,
    /// Per-item outcomes, in request order
    pub results: Vec<UploadOutcome>,
    /// Filenames skipped by the content-type gate
    pub skipped: Vec<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/labels", get(list_labels))
        .route("/api/v1/labels/:name", post(add_label))
        .route("/api/v1/images", post(upload_image))
        .route("/api/v1/images/bulk", post(bulk_upload_images))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "curator"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check registry store connectivity
    match sqlx::query("SELECT 1")
        .fetch_one(state.documents.pool())
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "registry_store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "registry_store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// List all labels, refreshing the cache snapshot first
#[instrument(skip(state))]
async fn list_labels(
    State(state): State<AppState>,
) -> Result<Json<LabelListResponse>, (StatusCode, Json<ErrorResponse>)> {
    state.cache.refresh().await.map_err(|e| {
        error!(error = %e, "Failed to refresh label cache");
        registry_error_response(&e)
    })?;

    let snapshot = state.cache.snapshot();
    Ok(Json(LabelListResponse {
        labels: snapshot.labels().clone(),
        count: snapshot.labels().len(),
        refreshed_at: snapshot.refreshed_at(),
    }))
}

/// Add a label to the registry
#[instrument(skip(state, name), fields(label = %name))]
async fn add_label(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<AddLabelResponse>), (StatusCode, Json<ErrorResponse>)> {
    let outcome = state.registry.add_label(&name).await.map_err(|e| {
        error!(error = %e, "Failed to add label");
        registry_error_response(&e)
    })?;

    // Uploads resolve through the cache snapshot, so pull the new label into
    // it right away. A failed refresh only delays visibility.
    if let Err(e) = state.cache.refresh().await {
        warn!(error = %e, "Label added but cache refresh failed");
    }

    let AddLabelOutcome {
        id,
        registry_updated,
        namespace_created,
        reason,
    } = outcome;

    Ok((
        StatusCode::CREATED,
        Json(AddLabelResponse {
            id,
            name,
            registry_updated,
            namespace_created,
            reason,
        }),
    ))
}

/// Upload a single image
#[instrument(skip(state, request), fields(label = %request.label, filename = %request.file.filename))]
async fn upload_image(
    State(state): State<AppState>,
    Json(request): Json<SingleUploadRequest>,
) -> Json<SingleUploadResponse> {
    let label_id = state.cache.resolve(&request.label).map(|label| label.id);
    let outcome = state
        .pipeline
        .upload_one(&request.label, request.file.into())
        .await;

    Json(SingleUploadResponse {
        label: request.label,
        label_id,
        outcome,
    })
}

/// Upload a batch of images under one label
#[instrument(skip(state, request), fields(label = %request.label, count = request.files.len()))]
async fn bulk_upload_images(
    State(state): State<AppState>,
    Json(request): Json<BulkUploadRequest>,
) -> Result<Json<BulkUploadResponse>, (StatusCode, Json<ErrorResponse>)> {
    if request.files.len() > state.max_batch_items {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("Maximum {} files per batch", state.max_batch_items),
                code: "BATCH_TOO_LARGE".to_string(),
            }),
        ));
    }

    let label_id = state.cache.resolve(&request.label).map(|label| label.id);
    let items: Vec<UploadItem> = request.files.into_iter().map(Into::into).collect();
    let results = state.pipeline.upload_many(&request.label, items).await;
    let skipped = skipped_filenames(&results);

    Ok(Json(BulkUploadResponse {
        label: request.label,
        label_id,
        results,
        skipped,
    }))
}

/// Filenames rejected by the content-type gate, for quick caller triage
fn skipped_filenames(outcomes: &[UploadOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|outcome| outcome.skipped_for_content_type())
        .map(|outcome| outcome.filename.clone())
        .collect()
}

fn registry_error_response(e: &RegistryError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match e {
        RegistryError::StoreUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE")
        }
        RegistryError::RegistryEmpty => (StatusCode::NOT_FOUND, "REGISTRY_EMPTY"),
        RegistryError::AllocationConflict { .. } => (StatusCode::CONFLICT, "ALLOCATION_CONFLICT"),
        RegistryError::MalformedRecord { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "MALFORMED_REGISTRY")
        }
    };

    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Start the ingestion API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ingestion API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
