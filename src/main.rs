mod api;
mod config;
mod document_store;
mod key_generator;
mod label_cache;
mod object_store;
mod pipeline;
mod registry;

use anyhow::{Context, Result};
use api::{start_api_server, AppState};
use config::Config;
use document_store::PostgresDocumentStore;
use key_generator::ObjectKeyGenerator;
use label_cache::LabelCache;
use object_store::S3ObjectStore;
use pipeline::IngestionPipeline;
use registry::LabelRegistry;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Curator ingestion service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let documents = Arc::new(
        PostgresDocumentStore::connect(&config.registry)
            .await
            .context("Failed to connect to registry store")?,
    );

    // Run migrations if enabled
    if config.registry.run_migrations {
        documents
            .run_migrations()
            .await
            .context("Failed to run registry store migrations")?;
    }

    let objects = Arc::new(S3ObjectStore::new(&config.s3).await);
    let keys = ObjectKeyGenerator::new(config.s3.key_prefix.clone());

    let registry = Arc::new(LabelRegistry::new(
        documents.clone(),
        objects.clone(),
        keys.clone(),
        config.registry.allocation_retries,
    ));

    let cache = Arc::new(LabelCache::new(registry.clone()));

    // Warm the cache; an empty registry is fine until the first label lands.
    if let Err(e) = cache.refresh().await {
        warn!(error = %e, "Starting with an unpopulated label cache");
    }

    let pipeline = Arc::new(IngestionPipeline::new(
        cache.clone(),
        objects.clone(),
        keys,
        &config.ingest,
    ));

    // Create API state
    let state = AppState {
        registry,
        cache,
        pipeline,
        documents,
        max_batch_items: config.ingest.max_batch_items,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Curator service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down curator service");

    api_handle.abort();

    info!("Curator service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
