//! reposcan-worker: runs the embedding worker loop against PostgreSQL.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use reposcan_db::{create_pool_with_config, Database, PoolConfig, QueueConfig};
use reposcan_inference::HttpEmbeddingBackend;
use reposcan_jobs::{defaults, DispatcherConfig, JobWorker, PipelineContext, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: info for the reposcan crates)
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "reposcan_worker=info,reposcan_jobs=info,reposcan_db=info,reposcan_inference=info".into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("reposcan-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let worker_config = WorkerConfig::from_env();
    if !worker_config.enabled {
        info!("JOB_WORKER_ENABLED is off, exiting");
        return Ok(());
    }

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| defaults::DATABASE_URL.to_string());
    let pool = create_pool_with_config(&database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to database")?;
    let db = Database::with_queue_config(pool, QueueConfig::from_env());
    db.migrate().await.context("failed to run migrations")?;

    let engine = HttpEmbeddingBackend::from_env().context("invalid embedding configuration")?;
    if let Err(e) = engine.health_check().await {
        warn!(
            error = %e,
            url = %engine.config().base_url,
            "Embedding server health check failed"
        );
    }

    let ctx = PipelineContext::from_database(&db, Arc::new(engine));
    let worker = JobWorker::new(ctx, DispatcherConfig::from_env(), worker_config);
    let handle = worker.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    handle.shutdown().await?;
    handle.join().await?;
    reposcan_db::log_pool_metrics(db.pool());
    Ok(())
}
