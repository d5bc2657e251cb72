//! In-memory backend implementing the queue, cache, and record traits.
//!
//! Every operation runs under a single async mutex, which gives the same
//! exclusivity guarantees as the row-locking PostgreSQL claim. Used by
//! tests and by local runs without a database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use reposcan_core::{
    defaults, lease_cutoff, lease_expired_message, new_v7, Embedding, EmbeddingCache, Error,
    JobQueue, JobStatus, NewWorkRecord, QueueJob, ReclaimOutcome, Result, TaskKind, WorkRecord,
    WorkRecordStore,
};

#[derive(Debug)]
struct StoredJob {
    job: QueueJob,
    /// Insertion sequence, breaks ties between equal `created_at` values.
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, StoredJob>,
    job_keys: HashMap<(Uuid, TaskKind), Uuid>,
    next_seq: u64,
    records: HashMap<Uuid, WorkRecord>,
    record_keys: HashMap<String, Uuid>,
    embeddings: HashMap<(Uuid, String), Embedding>,
    model_dimensions: HashMap<String, usize>,
}

impl MemoryState {
    fn pending_count(&self, task_kind: Option<TaskKind>) -> i64 {
        self.jobs
            .values()
            .filter(|s| s.job.status == JobStatus::Pending)
            .filter(|s| task_kind.map_or(true, |k| s.job.task_kind == k))
            .count() as i64
    }
}

/// Process-local store for queue jobs, work records, and embeddings.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    max_depth: i64,
    notify: Arc<Notify>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with the default queue ceiling.
    pub fn new() -> Self {
        Self::with_max_depth(defaults::QUEUE_MAX_DEPTH)
    }

    /// Create an empty store with a custom pending-job ceiling.
    pub fn with_max_depth(max_depth: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            max_depth,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Snapshot of every job, in creation order.
    pub async fn jobs(&self) -> Vec<QueueJob> {
        let state = self.state.lock().await;
        let mut stored: Vec<&StoredJob> = state.jobs.values().collect();
        stored.sort_by_key(|s| s.seq);
        stored.into_iter().map(|s| s.job.clone()).collect()
    }

    /// Rewind a job's claim timestamp, simulating a stale lease.
    pub async fn backdate_claim(&self, job_id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        stored.job.processing_started_at = Some(started_at);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(
        &self,
        work_item_id: Uuid,
        task_kind: TaskKind,
        priority: i32,
    ) -> Result<QueueJob> {
        let mut state = self.state.lock().await;

        if let Some(id) = state.job_keys.get(&(work_item_id, task_kind)) {
            if let Some(existing) = state.jobs.get(id) {
                return Ok(existing.job.clone());
            }
        }

        let depth = state.pending_count(None);
        if depth >= self.max_depth {
            return Err(Error::QueueFull {
                depth,
                limit: self.max_depth,
            });
        }

        let job = QueueJob {
            id: new_v7(),
            work_item_id,
            task_kind,
            priority,
            status: JobStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            processing_started_at: None,
            processing_completed_at: None,
            error_message: None,
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.job_keys.insert((work_item_id, task_kind), job.id);
        state.jobs.insert(
            job.id,
            StoredJob {
                job: job.clone(),
                seq,
            },
        );
        drop(state);

        self.notify.notify_waiters();
        Ok(job)
    }

    async fn claim_batch(&self, task_kind: TaskKind, max_count: usize) -> Result<Vec<QueueJob>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;
        let mut eligible: Vec<(i32, DateTime<Utc>, u64, Uuid)> = state
            .jobs
            .values()
            .filter(|s| s.job.status == JobStatus::Pending && s.job.task_kind == task_kind)
            .map(|s| (s.job.priority, s.job.created_at, s.seq, s.job.id))
            .collect();
        eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(max_count.min(eligible.len()));
        for (_, _, _, id) in eligible.into_iter().take(max_count) {
            if let Some(stored) = state.jobs.get_mut(&id) {
                stored.job.status = JobStatus::Processing;
                stored.job.attempts += 1;
                stored.job.processing_started_at = Some(now);
                claimed.push(stored.job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: Uuid, error: Option<&str>) -> Result<()> {
        let target = if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };

        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;

        if !stored.job.status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                job_id,
                from: stored.job.status,
                to: target,
            });
        }

        stored.job.status = target;
        stored.job.processing_completed_at = Some(Utc::now());
        stored.job.error_message = error.map(str::to_string);
        Ok(())
    }

    async fn reclaim_expired(
        &self,
        task_kind: TaskKind,
        lease: Duration,
        max_attempts: i32,
    ) -> Result<ReclaimOutcome> {
        let now = Utc::now();
        let cutoff = lease_cutoff(now, lease)?;

        let mut state = self.state.lock().await;
        let mut outcome = ReclaimOutcome::default();
        for stored in state.jobs.values_mut() {
            let job = &mut stored.job;
            let expired = job.status == JobStatus::Processing
                && job.task_kind == task_kind
                && job.processing_started_at.is_some_and(|t| t <= cutoff);
            if !expired {
                continue;
            }

            if job.attempts < max_attempts {
                job.status = JobStatus::Pending;
                job.processing_started_at = None;
                job.processing_completed_at = None;
                outcome.requeued += 1;
            } else {
                job.status = JobStatus::Failed;
                job.processing_completed_at = Some(now);
                job.error_message = Some(lease_expired_message(job.attempts));
                outcome.failed += 1;
            }
        }
        drop(state);

        if outcome.requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<QueueJob>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).map(|s| s.job.clone()))
    }

    async fn find(&self, work_item_id: Uuid, task_kind: TaskKind) -> Result<Option<QueueJob>> {
        let state = self.state.lock().await;
        Ok(state
            .job_keys
            .get(&(work_item_id, task_kind))
            .and_then(|id| state.jobs.get(id))
            .map(|s| s.job.clone()))
    }

    async fn pending_count(&self, task_kind: Option<TaskKind>) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state.pending_count(task_kind))
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[async_trait]
impl EmbeddingCache for MemoryStore {
    async fn get(&self, work_item_id: Uuid, model_id: &str) -> Result<Option<Vector>> {
        let state = self.state.lock().await;
        Ok(state
            .embeddings
            .get(&(work_item_id, model_id.to_string()))
            .map(|e| e.vector.clone()))
    }

    async fn get_entry(&self, work_item_id: Uuid, model_id: &str) -> Result<Option<Embedding>> {
        let state = self.state.lock().await;
        Ok(state
            .embeddings
            .get(&(work_item_id, model_id.to_string()))
            .cloned())
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

        let mut state = self.state.lock().await;
        let expected = *state
            .model_dimensions
            .entry(model_id.to_string())
            .or_insert(dimension);
        if expected != dimension {
            return Err(Error::DimensionMismatch {
                model: model_id.to_string(),
                expected,
                actual: dimension,
            });
        }

        let now = Utc::now();
        let key = (work_item_id, model_id.to_string());
        let created_at = state
            .embeddings
            .get(&key)
            .map(|e| e.created_at)
            .unwrap_or(now);
        state.embeddings.insert(
            key,
            Embedding {
                work_item_id,
                model_id: model_id.to_string(),
                vector: vector.clone(),
                input_text: input_text.to_string(),
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn count_for_model(&self, model_id: &str) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .embeddings
            .keys()
            .filter(|(_, m)| m == model_id)
            .count() as i64)
    }
}

#[async_trait]
impl WorkRecordStore for MemoryStore {
    async fn resolve(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, WorkRecord>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.records.get(id))
            .map(|r| (r.id, r.clone()))
            .collect())
    }

    async fn upsert(&self, record: NewWorkRecord) -> Result<Uuid> {
        if record.full_name.trim().is_empty() {
            return Err(Error::InvalidInput("full_name must not be empty".into()));
        }

        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(id) = state.record_keys.get(&record.full_name).copied() {
            if let Some(existing) = state.records.get_mut(&id) {
                existing.description = record.description;
                existing.language = record.language;
                existing.topics = record.topics;
                existing.stars = record.stars;
                existing.forks = record.forks;
                existing.updated_at = record.updated_at;
                existing.api_data = record.api_data;
                existing.readme_content = record.readme_content;
                existing.fetched_at = now;
            }
            return Ok(id);
        }

        let id = new_v7();
        state.record_keys.insert(record.full_name.clone(), id);
        state.records.insert(
            id,
            WorkRecord {
                id,
                full_name: record.full_name,
                owner: record.owner,
                name: record.name,
                description: record.description,
                language: record.language,
                topics: record.topics,
                stars: record.stars,
                forks: record.forks,
                created_at: record.created_at,
                updated_at: record.updated_at,
                api_data: record.api_data,
                readme_content: record.readme_content,
                fetched_at: now,
            },
        );
        Ok(id)
    }

    async fn get_by_full_name(&self, full_name: &str) -> Result<Option<WorkRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .record_keys
            .get(full_name)
            .and_then(|id| state.records.get(id))
            .cloned())
    }
}
