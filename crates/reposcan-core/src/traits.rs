//! Core traits for reposcan abstractions.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy. PostgreSQL and in-memory backends both implement the
//! storage traits, so the dispatcher and worker never see which one is
//! in use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// JOB QUEUE TRAITS
// =============================================================================

/// Durable work queue with exclusive batch claims.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue a job for `(work_item_id, task_kind)`.
    ///
    /// If a job already exists for the pair it is returned unchanged and
    /// nothing is written. New jobs are rejected with `Error::QueueFull`
    /// once the pending backlog reaches the configured ceiling. The work
    /// item is not looked up; a job whose record never resolves is left to
    /// lease reclaim by the dispatcher.
    async fn enqueue(&self, work_item_id: Uuid, task_kind: TaskKind, priority: i32)
        -> Result<QueueJob>;

    /// Claim up to `max_count` pending jobs of `task_kind`.
    ///
    /// Jobs come back ordered by priority (highest first), then by creation
    /// time (oldest first). Each returned job is `processing`, with its
    /// attempt counter incremented. Concurrent callers never receive the
    /// same job.
    async fn claim_batch(&self, task_kind: TaskKind, max_count: usize) -> Result<Vec<QueueJob>>;

    /// Finish a `processing` job: `failed` when `error` is given, else `completed`.
    async fn complete(&self, job_id: Uuid, error: Option<&str>) -> Result<()>;

    /// Return abandoned `processing` jobs to `pending`, or fail them once
    /// they have been claimed `max_attempts` times.
    ///
    /// Fails with `Error::InvalidInput` when `lease` reaches back past the
    /// earliest representable timestamp.
    async fn reclaim_expired(
        &self,
        task_kind: TaskKind,
        lease: Duration,
        max_attempts: i32,
    ) -> Result<ReclaimOutcome>;

    /// Get a job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<QueueJob>>;

    /// Get the job for a `(work_item_id, task_kind)` pair.
    async fn find(&self, work_item_id: Uuid, task_kind: TaskKind) -> Result<Option<QueueJob>>;

    /// Count pending jobs, optionally restricted to one task kind.
    async fn pending_count(&self, task_kind: Option<TaskKind>) -> Result<i64>;

    /// Handle notified whenever a new job is queued.
    fn job_notify(&self) -> Arc<Notify>;
}

// =============================================================================
// EMBEDDING CACHE TRAITS
// =============================================================================

/// Passive store of computed embeddings keyed by (work item, model).
#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    /// Get the cached vector, if any.
    async fn get(&self, work_item_id: Uuid, model_id: &str) -> Result<Option<Vector>>;

    /// Get the full cached row including its input text.
    async fn get_entry(&self, work_item_id: Uuid, model_id: &str) -> Result<Option<Embedding>>;

    /// Insert or overwrite the embedding for `(work_item_id, model_id)`.
    async fn put(
        &self,
        work_item_id: Uuid,
        model_id: &str,
        vector: &Vector,
        input_text: &str,
    ) -> Result<()>;

    /// Number of embeddings stored for a model.
    async fn count_for_model(&self, model_id: &str) -> Result<i64>;
}

// =============================================================================
// WORK RECORD TRAITS
// =============================================================================

/// Source of the records that jobs refer to.
#[async_trait]
pub trait WorkRecordStore: Send + Sync {
    /// Resolve many records in one round trip. Missing ids are absent
    /// from the returned map.
    async fn resolve(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, WorkRecord>>;

    /// Insert or update a record keyed on `full_name`, returning its id.
    async fn upsert(&self, record: NewWorkRecord) -> Result<Uuid>;

    /// Look up a record by its identity key.
    async fn get_by_full_name(&self, full_name: &str) -> Result<Option<WorkRecord>>;
}

// =============================================================================
// INFERENCE TRAITS
// =============================================================================

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for the given texts.
    ///
    /// Returns one vector per input text, in input order. Whole-batch
    /// failures surface as `Error::InferenceUnavailable` or
    /// `Error::InferenceTimeout`.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>>;

    /// Get the expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}
