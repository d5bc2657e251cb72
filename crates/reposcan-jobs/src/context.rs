//! Shared collaborators for the dispatcher and worker.

use std::sync::Arc;

use reposcan_core::{EmbeddingBackend, EmbeddingCache, JobQueue, WorkRecordStore};
use reposcan_db::{Database, MemoryStore};

/// Handles to the queue, record store, cache, and inference engine.
///
/// Built once at startup and cloned into every component that needs it.
#[derive(Clone)]
pub struct PipelineContext {
    pub queue: Arc<dyn JobQueue>,
    pub records: Arc<dyn WorkRecordStore>,
    pub cache: Arc<dyn EmbeddingCache>,
    pub engine: Arc<dyn EmbeddingBackend>,
}

impl PipelineContext {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        records: Arc<dyn WorkRecordStore>,
        cache: Arc<dyn EmbeddingCache>,
        engine: Arc<dyn EmbeddingBackend>,
    ) -> Self {
        Self {
            queue,
            records,
            cache,
            engine,
        }
    }

    /// Wire the PostgreSQL implementations from `db`.
    pub fn from_database(db: &Database, engine: Arc<dyn EmbeddingBackend>) -> Self {
        Self::new(
            Arc::new(db.jobs.clone()),
            Arc::new(db.repositories.clone()),
            Arc::new(db.embeddings.clone()),
            engine,
        )
    }

    /// Use one in-memory store for the queue, records, and cache.
    pub fn in_memory(store: MemoryStore, engine: Arc<dyn EmbeddingBackend>) -> Self {
        Self::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store),
            engine,
        )
    }
}
