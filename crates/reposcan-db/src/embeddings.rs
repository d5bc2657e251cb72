//! Embedding cache implementation on PostgreSQL + pgvector.

use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::trace;
use uuid::Uuid;

use reposcan_core::{Embedding, EmbeddingCache, Error, Result};

/// PostgreSQL implementation of [`EmbeddingCache`].
#[derive(Clone)]
pub struct PgEmbeddingCache {
    pool: Pool<Postgres>,
}

impl PgEmbeddingCache {
    /// Create a new cache over the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Register `model_id` with `dimension` on first use and verify it after.
    async fn check_dimension(
        tx: &mut Transaction<'_, Postgres>,
        model_id: &str,
        dimension: usize,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO embedding_models (model_name, dimension) VALUES ($1, $2)
             ON CONFLICT (model_name) DO NOTHING",
        )
        .bind(model_id)
        .bind(dimension as i32)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;

        let registered: i32 =
            sqlx::query_scalar("SELECT dimension FROM embedding_models WHERE model_name = $1")
                .bind(model_id)
                .fetch_one(&mut **tx)
                .await
                .map_err(Error::Database)?;

        if registered as usize != dimension {
            return Err(Error::DimensionMismatch {
                model: model_id.to_string(),
                expected: registered as usize,
                actual: dimension,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingCache for PgEmbeddingCache {
    async fn get(&self, work_item_id: Uuid, model_id: &str) -> Result<Option<Vector>> {
        let vector: Option<Vector> = sqlx::query_scalar(
            "SELECT embedding FROM embeddings WHERE repository_id = $1 AND model_name = $2",
        )
        .bind(work_item_id)
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(vector)
    }

    async fn get_entry(&self, work_item_id: Uuid, model_id: &str) -> Result<Option<Embedding>> {
        let row = sqlx::query(
            "SELECT repository_id, model_name, embedding, input_text, created_at, updated_at
             FROM embeddings
             WHERE repository_id = $1 AND model_name = $2",
        )
        .bind(work_item_id)
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| Embedding {
            work_item_id: row.get("repository_id"),
            model_id: row.get("model_name"),
            vector: row.get("embedding"),
            input_text: row.get("input_text"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn put(
        &self,
        work_item_id: Uuid,
        model_id: &str,
        vector: &Vector,
        input_text: &str,
    ) -> Result<()> {
        let dimension = vector.as_slice().len();
        if dimension == 0 {
            return Err(Error::InvalidInput("embedding vector is empty".into()));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        Self::check_dimension(&mut tx, model_id, dimension).await?;

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO embeddings (repository_id, model_name, embedding, input_text, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             ON CONFLICT (repository_id, model_name)
             DO UPDATE SET embedding = EXCLUDED.embedding,
                           input_text = EXCLUDED.input_text,
                           updated_at = EXCLUDED.updated_at",
        )
        .bind(work_item_id)
        .bind(model_id)
        .bind(vector)
        .bind(input_text)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        trace!(
            subsystem = "database",
            component = "cache",
            op = "put",
            work_item_id = %work_item_id,
            model = model_id,
            "Stored embedding"
        );
        Ok(())
    }

    async fn count_for_model(&self, model_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE model_name = $1")
                .bind(model_id)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count)
    }
}
