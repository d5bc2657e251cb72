//! Job queue implementation on PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use reposcan_core::{
    defaults, lease_cutoff, new_v7, Error, JobQueue, JobStatus, QueueJob, ReclaimOutcome, Result,
    TaskKind,
};

/// Column list for queue rows, enums cast to text for parsing.
const JOB_COLUMNS: &str = "id, repository_id, task_type::text AS task_type, priority, \
     status::text AS status, attempts, created_at, processing_started_at, \
     processing_completed_at, error_message";

/// Same as [`JOB_COLUMNS`], qualified for `UPDATE processing_queue q ... FROM`.
const JOB_COLUMNS_Q: &str = "q.id, q.repository_id, q.task_type::text AS task_type, q.priority, \
     q.status::text AS status, q.attempts, q.created_at, q.processing_started_at, \
     q.processing_completed_at, q.error_message";

/// Advisory lock key held for the duration of an enqueue transaction.
const ENQUEUE_LOCK_KEY: i64 = 0x7265_706f_7363_616e;

/// Queue limits.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Pending jobs allowed before enqueue starts rejecting new work.
    pub max_depth: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: defaults::QUEUE_MAX_DEPTH,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `QUEUE_MAX_DEPTH` | `1000` | Pending-job ceiling for enqueue |
    pub fn from_env() -> Self {
        let max_depth = std::env::var("QUEUE_MAX_DEPTH")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults::QUEUE_MAX_DEPTH)
            .max(1);
        Self { max_depth }
    }

    /// Set the pending-job ceiling.
    pub fn with_max_depth(mut self, max_depth: i64) -> Self {
        self.max_depth = max_depth;
        self
    }
}

/// PostgreSQL implementation of [`JobQueue`].
#[derive(Clone)]
pub struct PgJobQueue {
    pool: Pool<Postgres>,
    config: QueueConfig,
    /// Notify handle for waking idle workers on enqueue.
    notify: Arc<Notify>,
}

impl PgJobQueue {
    /// Create a new queue with default limits.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self::with_config(pool, QueueConfig::default())
    }

    /// Create a new queue with explicit limits.
    pub fn with_config(pool: Pool<Postgres>, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Queue limits in effect.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Parse a queue row into a [`QueueJob`].
    fn parse_job_row(row: &sqlx::postgres::PgRow) -> Result<QueueJob> {
        let task_kind: String = row.get("task_type");
        let status: String = row.get("status");
        Ok(QueueJob {
            id: row.get("id"),
            work_item_id: row.get("repository_id"),
            task_kind: task_kind.parse()?,
            priority: row.get("priority"),
            status: status.parse()?,
            attempts: row.get("attempts"),
            created_at: row.get("created_at"),
            processing_started_at: row.get("processing_started_at"),
            processing_completed_at: row.get("processing_completed_at"),
            error_message: row.get("error_message"),
        })
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        work_item_id: Uuid,
        task_kind: TaskKind,
        priority: i32,
    ) -> Result<QueueJob> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Serializes count-and-insert so concurrent enqueuers cannot overshoot
        // the depth ceiling. Released on commit or rollback.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ENQUEUE_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let existing = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_queue
             WHERE repository_id = $1 AND task_type = $2::task_type"
        ))
        .bind(work_item_id)
        .bind(task_kind.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if let Some(row) = existing {
            tx.commit().await.map_err(Error::Database)?;
            debug!(
                subsystem = "database",
                component = "queue",
                op = "enqueue",
                work_item_id = %work_item_id,
                task_kind = %task_kind,
                "Job already queued; enqueue is a no-op"
            );
            return Self::parse_job_row(&row);
        }

        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processing_queue WHERE status = 'pending'::queue_status",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if depth >= self.config.max_depth {
            warn!(
                subsystem = "database",
                component = "queue",
                op = "enqueue",
                depth,
                limit = self.config.max_depth,
                "Queue at capacity, rejecting job"
            );
            return Err(Error::QueueFull {
                depth,
                limit: self.config.max_depth,
            });
        }

        let inserted = sqlx::query(&format!(
            "INSERT INTO processing_queue (id, repository_id, task_type, priority, created_at)
             VALUES ($1, $2, $3::task_type, $4, $5)
             ON CONFLICT (repository_id, task_type) DO NOTHING
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(work_item_id)
        .bind(task_kind.as_str())
        .bind(priority)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let (row, is_new) = match inserted {
            Some(row) => (row, true),
            None => {
                let row = sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM processing_queue
                     WHERE repository_id = $1 AND task_type = $2::task_type"
                ))
                .bind(work_item_id)
                .bind(task_kind.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(Error::Database)?;
                (row, false)
            }
        };

        tx.commit().await.map_err(Error::Database)?;

        let job = Self::parse_job_row(&row)?;
        if is_new {
            debug!(
                subsystem = "database",
                component = "queue",
                op = "enqueue",
                job_id = %job.id,
                work_item_id = %work_item_id,
                task_kind = %task_kind,
                priority,
                "Job queued"
            );
            self.notify.notify_waiters();
        }
        Ok(job)
    }

    async fn claim_batch(&self, task_kind: TaskKind, max_count: usize) -> Result<Vec<QueueJob>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        // SKIP LOCKED lets concurrent claimers pass over each other's rows
        // instead of queueing on the row locks.
        let rows = sqlx::query(&format!(
            "WITH next AS (
                 SELECT id FROM processing_queue
                 WHERE status = 'pending'::queue_status AND task_type = $1::task_type
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE processing_queue q
             SET status = 'processing'::queue_status,
                 processing_started_at = $3,
                 attempts = q.attempts + 1
             FROM next
             WHERE q.id = next.id
             RETURNING {JOB_COLUMNS_Q}"
        ))
        .bind(task_kind.as_str())
        .bind(max_count as i64)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut jobs = rows
            .iter()
            .map(Self::parse_job_row)
            .collect::<Result<Vec<_>>>()?;

        // RETURNING does not preserve the subquery order.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        debug!(
            subsystem = "database",
            component = "queue",
            op = "claim_batch",
            task_kind = %task_kind,
            claimed = jobs.len(),
            "Claimed batch"
        );
        Ok(jobs)
    }

    async fn complete(&self, job_id: Uuid, error: Option<&str>) -> Result<()> {
        let target = if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };

        let updated = sqlx::query(
            "UPDATE processing_queue
             SET status = $1::queue_status, processing_completed_at = $2, error_message = $3
             WHERE id = $4 AND status = 'processing'::queue_status",
        )
        .bind(target.as_str())
        .bind(Utc::now())
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status::text FROM processing_queue WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        match current {
            None => Err(Error::JobNotFound(job_id)),
            Some(status) => Err(Error::InvalidTransition {
                job_id,
                from: status.parse()?,
                to: target,
            }),
        }
    }

    async fn reclaim_expired(
        &self,
        task_kind: TaskKind,
        lease: Duration,
        max_attempts: i32,
    ) -> Result<ReclaimOutcome> {
        let now = Utc::now();
        let cutoff = lease_cutoff(now, lease)?;

        let statuses: Vec<String> = sqlx::query_scalar(
            "WITH expired AS (
                 SELECT id FROM processing_queue
                 WHERE status = 'processing'::queue_status
                   AND task_type = $1::task_type
                   AND processing_started_at <= $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE processing_queue q
             SET status = CASE WHEN q.attempts < $3
                               THEN 'pending'::queue_status
                               ELSE 'failed'::queue_status END,
                 processing_started_at = CASE WHEN q.attempts < $3
                                              THEN NULL
                                              ELSE q.processing_started_at END,
                 processing_completed_at = CASE WHEN q.attempts < $3 THEN NULL ELSE $4::timestamptz END,
                 error_message = CASE WHEN q.attempts < $3
                                      THEN q.error_message
                                      ELSE 'lease expired after ' || q.attempts || ' attempts' END
             FROM expired
             WHERE q.id = expired.id
             RETURNING q.status::text",
        )
        .bind(task_kind.as_str())
        .bind(cutoff)
        .bind(max_attempts)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut outcome = ReclaimOutcome::default();
        for status in &statuses {
            match status.as_str() {
                "pending" => outcome.requeued += 1,
                _ => outcome.failed += 1,
            }
        }

        if !outcome.is_empty() {
            info!(
                subsystem = "database",
                component = "queue",
                op = "reclaim",
                task_kind = %task_kind,
                requeued = outcome.requeued,
                failed = outcome.failed,
                "Reclaimed jobs with expired leases"
            );
            if outcome.requeued > 0 {
                self.notify.notify_waiters();
            }
        }
        Ok(outcome)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<QueueJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_queue WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn find(&self, work_item_id: Uuid, task_kind: TaskKind) -> Result<Option<QueueJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_queue
             WHERE repository_id = $1 AND task_type = $2::task_type"
        ))
        .bind(work_item_id)
        .bind(task_kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn pending_count(&self, task_kind: Option<TaskKind>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processing_queue
             WHERE status = 'pending'::queue_status
               AND ($1::text IS NULL OR task_type::text = $1)",
        )
        .bind(task_kind.map(|k| k.as_str()))
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
