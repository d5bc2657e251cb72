//! Worker loop that drives the batch dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument};

use reposcan_core::{defaults, Error, JobQueue, Result, TaskKind};

use crate::context::PipelineContext;
use crate::dispatcher::{BatchDispatcher, BatchReport, DispatcherConfig, PassOutcome};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep after a pass that found nothing pending, in milliseconds.
    pub idle_backoff_ms: u64,
    /// Sleep after a pass that failed, in milliseconds.
    pub failure_backoff_ms: u64,
    /// Lease on claimed jobs; `None` disables reclaim.
    pub lease: Option<Duration>,
    /// Claims allowed before an expired lease fails the job.
    pub max_attempts: i32,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_backoff_ms: defaults::IDLE_BACKOFF_MS,
            failure_backoff_ms: defaults::FAILURE_BACKOFF_MS,
            lease: Some(Duration::from_secs(defaults::LEASE_SECS)),
            max_attempts: defaults::MAX_ATTEMPTS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `WORKER_IDLE_BACKOFF_MS` | `5000` | Sleep when the queue is empty |
    /// | `WORKER_FAILURE_BACKOFF_MS` | `10000` | Sleep after a failed pass |
    /// | `WORKER_LEASE_SECS` | `600` | Claim lease, `0` disables reclaim |
    /// | `WORKER_MAX_ATTEMPTS` | `3` | Claims before a stale job fails |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let idle_backoff_ms = std::env::var("WORKER_IDLE_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::IDLE_BACKOFF_MS);

        let failure_backoff_ms = std::env::var("WORKER_FAILURE_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::FAILURE_BACKOFF_MS);

        let lease = std::env::var("WORKER_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(Some(defaults::LEASE_SECS), |secs| (secs > 0).then_some(secs))
            .map(Duration::from_secs);

        let max_attempts = std::env::var("WORKER_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults::MAX_ATTEMPTS)
            .max(1);

        Self {
            idle_backoff_ms,
            failure_backoff_ms,
            lease,
            max_attempts,
            enabled,
        }
    }

    /// Set the idle backoff.
    pub fn with_idle_backoff(mut self, ms: u64) -> Self {
        self.idle_backoff_ms = ms;
        self
    }

    /// Set the failure backoff.
    pub fn with_failure_backoff(mut self, ms: u64) -> Self {
        self.failure_backoff_ms = ms;
        self
    }

    /// Set the claim lease; `None` disables reclaim.
    pub fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.lease = lease;
        self
    }

    /// Set the claim limit enforced by lease reclaim.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted { task_kind: TaskKind },
    /// A pass claimed and handled a batch.
    BatchProcessed(BatchReport),
    /// A pass failed; the worker is backing off.
    PassFailed { error: String },
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down after its current pass.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait for the worker task to finish.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {e}")))
    }
}

/// Job worker that repeatedly runs a [`BatchDispatcher`].
pub struct JobWorker {
    dispatcher: BatchDispatcher,
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(ctx: PipelineContext, dispatcher: DispatcherConfig, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            queue: ctx.queue.clone(),
            dispatcher: BatchDispatcher::new(ctx, dispatcher),
            config,
            event_tx,
        }
    }

    /// Get a receiver for worker events.
    ///
    /// Subscribe before [`start`](Self::start) to observe `WorkerStarted`.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let task = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    /// Run one reclaim-then-dispatch pass.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        if let Some(lease) = self.config.lease {
            self.queue
                .reclaim_expired(
                    self.dispatcher.config().task_kind,
                    lease,
                    self.config.max_attempts,
                )
                .await?;
        }
        self.dispatcher.run_once().await
    }

    /// Run the worker loop until shutdown is requested.
    ///
    /// After a productive pass the loop claims again immediately. An idle
    /// pass sleeps for the idle backoff or until a job is enqueued; a failed
    /// pass sleeps for the failure backoff. Dropping the handle also stops
    /// the loop.
    #[instrument(skip(self, shutdown_rx), fields(subsystem = "jobs", component = "worker", task_kind = %self.dispatcher.config().task_kind))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        let task_kind = self.dispatcher.config().task_kind;
        info!(
            idle_backoff_ms = self.config.idle_backoff_ms,
            failure_backoff_ms = self.config.failure_backoff_ms,
            lease_secs = self.config.lease.map(|l| l.as_secs()),
            batch_size = self.dispatcher.config().batch_size,
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted { task_kind });

        let notify = self.queue.job_notify();
        let idle_backoff = Duration::from_millis(self.config.idle_backoff_ms);
        let failure_backoff = Duration::from_millis(self.config.failure_backoff_ms);

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    info!("Job worker received shutdown signal");
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }

            // Registered before the pass so an enqueue during it still wakes us.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (wait, wake_on_enqueue) = match self.run_pass().await {
                Ok(PassOutcome::Processed(report)) => {
                    let _ = self.event_tx.send(WorkerEvent::BatchProcessed(report));
                    continue;
                }
                Ok(PassOutcome::Idle) => {
                    debug!("Queue empty, backing off");
                    (idle_backoff, true)
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_ms = self.config.failure_backoff_ms,
                        "Worker pass failed"
                    );
                    let _ = self.event_tx.send(WorkerEvent::PassFailed {
                        error: e.to_string(),
                    });
                    (failure_backoff, false)
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Job worker received shutdown signal");
                    break;
                }
                _ = &mut notified, if wake_on_enqueue => {
                    debug!("Woken by enqueue");
                }
                _ = sleep(wait) => {}
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }
}
