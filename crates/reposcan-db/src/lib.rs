//! # reposcan-db
//!
//! PostgreSQL storage layer for the reposcan analysis pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - A persistent job queue with row-locking batch claims
//! - An embedding cache on pgvector with per-model dimension checks
//! - Work record (repository) storage
//! - An in-memory backend with the same semantics, for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use reposcan_db::{Database, JobQueue, TaskKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/repo_cache").await?;
//!
//!     let job = db.jobs.enqueue(repository_id, TaskKind::Embedding, 5).await?;
//!     println!("Queued job: {}", job.id);
//!     Ok(())
//! }
//! ```
pub mod embeddings;
pub mod jobs;
pub mod memory;
pub mod pool;
pub mod repositories;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use reposcan_core::*;

pub use embeddings::PgEmbeddingCache;
pub use jobs::{PgJobQueue, QueueConfig};
pub use memory::MemoryStore;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use repositories::PgWorkRecordStore;

/// Database context holding all storage handles over one pool.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Persistent processing queue.
    pub jobs: PgJobQueue,
    /// Embedding cache keyed by (work item, model).
    pub embeddings: PgEmbeddingCache,
    /// Repository records that jobs refer to.
    pub repositories: PgWorkRecordStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self::with_queue_config(pool, QueueConfig::default())
    }

    /// Create a new Database instance with explicit queue limits.
    pub fn with_queue_config(pool: sqlx::Pool<sqlx::Postgres>, queue: QueueConfig) -> Self {
        Self {
            jobs: PgJobQueue::with_config(pool.clone(), queue),
            embeddings: PgEmbeddingCache::new(pool.clone()),
            repositories: PgWorkRecordStore::new(pool.clone()),
            pool,
        }
    }

    /// Connect to a database with default pool settings.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
