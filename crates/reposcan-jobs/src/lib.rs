//! # reposcan-jobs
//!
//! Batch dispatcher and worker loop for the reposcan analysis queue.
//!
//! This crate provides:
//! - [`BatchDispatcher`]: claims a batch, embeds it in one inference call,
//!   and records a per-job outcome
//! - [`JobWorker`]: drives the dispatcher with idle and failure backoff
//! - [`PipelineContext`]: the collaborators both of them share
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use reposcan_db::Database;
//! use reposcan_inference::HttpEmbeddingBackend;
//! use reposcan_jobs::{DispatcherConfig, JobWorker, PipelineContext, WorkerConfig};
//!
//! let db = Database::connect("postgres://...").await?;
//! let engine = Arc::new(HttpEmbeddingBackend::from_env()?);
//! let ctx = PipelineContext::from_database(&db, engine);
//!
//! let worker = JobWorker::new(ctx, DispatcherConfig::from_env(), WorkerConfig::from_env());
//! let handle = worker.start();
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! handle.join().await?;
//! ```

pub mod context;
pub mod dispatcher;
pub mod worker;

// Re-export core types
pub use reposcan_core::*;

pub use context::PipelineContext;
pub use dispatcher::{build_input_text, BatchDispatcher, BatchReport, DispatcherConfig, PassOutcome};
pub use worker::{JobWorker, WorkerConfig, WorkerEvent, WorkerHandle};
