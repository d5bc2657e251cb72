//! Batch dispatcher: one claim, one inference call, per-job outcomes.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use reposcan_core::{defaults, Error, QueueJob, Result, TaskKind, WorkRecord};

use crate::context::PipelineContext;

/// Configuration for a [`BatchDispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Task kind this dispatcher claims.
    pub task_kind: TaskKind,
    /// Maximum jobs claimed per pass.
    pub batch_size: usize,
    /// Characters of README content included in each input text.
    pub max_content_chars: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            task_kind: TaskKind::Embedding,
            batch_size: defaults::BATCH_SIZE,
            max_content_chars: defaults::EMBED_MAX_CONTENT_CHARS,
        }
    }
}

impl DispatcherConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `EMBED_BATCH_SIZE` | `32` | Jobs claimed per pass |
    /// | `EMBED_MAX_CONTENT_CHARS` | `1000` | README characters per input |
    pub fn from_env() -> Self {
        let batch_size = std::env::var("EMBED_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::BATCH_SIZE)
            .max(1);

        let max_content_chars = std::env::var("EMBED_MAX_CONTENT_CHARS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::EMBED_MAX_CONTENT_CHARS);

        Self {
            batch_size,
            max_content_chars,
            ..Self::default()
        }
    }

    pub fn with_task_kind(mut self, task_kind: TaskKind) -> Self {
        self.task_kind = task_kind;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_content_chars(mut self, chars: usize) -> Self {
        self.max_content_chars = chars;
        self
    }
}

/// Counts for one productive pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Jobs claimed from the queue.
    pub claimed: usize,
    /// Claimed jobs whose work record could not be found.
    pub unresolved: usize,
    /// Jobs marked `completed`.
    pub completed: usize,
    /// Jobs marked `failed`.
    pub failed: usize,
}

/// Result of a single dispatcher pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing was pending.
    Idle,
    /// A batch was claimed and handled.
    Processed(BatchReport),
}

/// Build the text embedded for `record`.
///
/// Joins `full_name`, `description`, and the first `max_content_chars`
/// characters of `readme_content` with single spaces, skipping empty parts.
pub fn build_input_text(record: &WorkRecord, max_content_chars: usize) -> String {
    let readme: Option<String> = record
        .readme_content
        .as_deref()
        .map(|content| content.chars().take(max_content_chars).collect());

    [
        Some(record.full_name.as_str()),
        record.description.as_deref(),
        readme.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}

/// Claims batches for one task kind and records their outcomes.
#[derive(Clone)]
pub struct BatchDispatcher {
    ctx: PipelineContext,
    config: DispatcherConfig,
}

impl BatchDispatcher {
    pub fn new(ctx: PipelineContext, config: DispatcherConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one pass over the queue.
    ///
    /// A whole-batch inference failure returns the error without completing
    /// any job; those jobs stay `processing` until their lease expires.
    /// Jobs whose record is missing are skipped the same way.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "dispatcher", op = "run_once", task_kind = %self.config.task_kind))]
    pub async fn run_once(&self) -> Result<PassOutcome> {
        let jobs = self
            .ctx
            .queue
            .claim_batch(self.config.task_kind, self.config.batch_size)
            .await?;
        if jobs.is_empty() {
            return Ok(PassOutcome::Idle);
        }

        let start = Instant::now();
        let mut report = BatchReport {
            claimed: jobs.len(),
            ..BatchReport::default()
        };

        let mut seen = HashSet::new();
        let ids: Vec<Uuid> = jobs
            .iter()
            .map(|job| job.work_item_id)
            .filter(|id| seen.insert(*id))
            .collect();
        let records = self.ctx.records.resolve(&ids).await?;

        let mut batch: Vec<(QueueJob, String)> = Vec::with_capacity(jobs.len());
        for job in jobs {
            match records.get(&job.work_item_id) {
                Some(record) => {
                    let text = build_input_text(record, self.config.max_content_chars);
                    batch.push((job, text));
                }
                None => {
                    warn!(
                        job_id = %job.id,
                        work_item_id = %job.work_item_id,
                        "Work record not found; leaving job for lease reclaim"
                    );
                    report.unresolved += 1;
                }
            }
        }

        if batch.is_empty() {
            return Ok(PassOutcome::Processed(report));
        }

        let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
        let vectors = match self.ctx.engine.embed_texts(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!(
                    input_count = texts.len(),
                    error = %e,
                    "Inference failed for batch; jobs left processing"
                );
                return Err(e);
            }
        };
        if vectors.len() != batch.len() {
            return Err(Error::Embedding(format!(
                "inference returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }

        let model = self.ctx.engine.model_name();
        for ((job, text), vector) in batch.into_iter().zip(vectors) {
            let stored = self
                .ctx
                .cache
                .put(job.work_item_id, model, &vector, &text)
                .await;

            let outcome = match &stored {
                Ok(()) => self.ctx.queue.complete(job.id, None).await,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to store embedding");
                    self.ctx.queue.complete(job.id, Some(&e.to_string())).await
                }
            };

            match (outcome, stored.is_ok()) {
                (Ok(()), true) => report.completed += 1,
                (Ok(()), false) => report.failed += 1,
                (Err(e), _) => {
                    error!(job_id = %job.id, error = %e, "Failed to record job outcome");
                }
            }
        }

        let elapsed = start.elapsed().as_millis() as u64;
        info!(
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            unresolved = report.unresolved,
            model,
            duration_ms = elapsed,
            "Batch processed"
        );
        debug!(report = ?report, "Pass complete");
        Ok(PassOutcome::Processed(report))
    }
}
