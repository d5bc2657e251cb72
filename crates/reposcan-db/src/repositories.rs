//! Work record (repository) storage on PostgreSQL.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use reposcan_core::{new_v7, Error, NewWorkRecord, Result, WorkRecord, WorkRecordStore};

const RECORD_COLUMNS: &str = "id, full_name, owner, name, description, language, topics, \
     stars, forks, created_at, updated_at, api_data, readme_content, fetched_at";

/// PostgreSQL implementation of [`WorkRecordStore`].
#[derive(Clone)]
pub struct PgWorkRecordStore {
    pool: Pool<Postgres>,
}

impl PgWorkRecordStore {
    /// Create a new store over the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record_row(row: &sqlx::postgres::PgRow) -> WorkRecord {
        WorkRecord {
            id: row.get("id"),
            full_name: row.get("full_name"),
            owner: row.get("owner"),
            name: row.get("name"),
            description: row.get("description"),
            language: row.get("language"),
            topics: row.get("topics"),
            stars: row.get("stars"),
            forks: row.get("forks"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            api_data: row.get("api_data"),
            readme_content: row.get("readme_content"),
            fetched_at: row.get("fetched_at"),
        }
    }
}

#[async_trait]
impl WorkRecordStore for PgWorkRecordStore {
    async fn resolve(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, WorkRecord>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM repositories WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .iter()
            .map(Self::parse_record_row)
            .map(|record| (record.id, record))
            .collect())
    }

    async fn upsert(&self, record: NewWorkRecord) -> Result<Uuid> {
        if record.full_name.trim().is_empty() {
            return Err(Error::InvalidInput("full_name must not be empty".into()));
        }

        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO repositories (
                 id, full_name, owner, name, description, language, topics,
                 stars, forks, created_at, updated_at, api_data, readme_content, fetched_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (full_name)
             DO UPDATE SET
                 description = EXCLUDED.description,
                 language = EXCLUDED.language,
                 topics = EXCLUDED.topics,
                 stars = EXCLUDED.stars,
                 forks = EXCLUDED.forks,
                 updated_at = EXCLUDED.updated_at,
                 api_data = EXCLUDED.api_data,
                 readme_content = EXCLUDED.readme_content,
                 fetched_at = EXCLUDED.fetched_at
             RETURNING id",
        )
        .bind(new_v7())
        .bind(&record.full_name)
        .bind(&record.owner)
        .bind(&record.name)
        .bind(&record.description)
        .bind(&record.language)
        .bind(&record.topics)
        .bind(record.stars)
        .bind(record.forks)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(&record.api_data)
        .bind(&record.readme_content)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }

    async fn get_by_full_name(&self, full_name: &str) -> Result<Option<WorkRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM repositories WHERE full_name = $1"
        ))
        .bind(full_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.as_ref().map(Self::parse_record_row))
    }
}
