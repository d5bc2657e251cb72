//! Worker loop behaviour with the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use reposcan_db::MemoryStore;
use reposcan_inference::MockEmbeddingBackend;
use reposcan_jobs::{
    DispatcherConfig, JobQueue, JobStatus, JobWorker, NewWorkRecord, PipelineContext, TaskKind,
    WorkRecordStore, WorkerConfig, WorkerEvent,
};
use tokio::sync::broadcast;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

async fn seed(store: &MemoryStore, name: &str) -> Uuid {
    let id = store.upsert(NewWorkRecord::new(name)).await.unwrap();
    store.enqueue(id, TaskKind::Embedding, 5).await.unwrap();
    id
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for<F>(events: &mut broadcast::Receiver<WorkerEvent>, pred: F) -> WorkerEvent
where
    F: Fn(&WorkerEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for worker event")
}

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_idle_backoff(20)
        .with_failure_backoff(20)
}

#[tokio::test]
async fn test_worker_processes_queue_and_shuts_down() {
    let store = MemoryStore::new();
    for i in 0..5 {
        seed(&store, &format!("w/{i}")).await;
    }
    let ctx = PipelineContext::in_memory(store.clone(), Arc::new(MockEmbeddingBackend::new()));
    let worker = JobWorker::new(ctx, DispatcherConfig::default(), fast_config());
    let mut events = worker.events();
    let handle = worker.start();

    let started = wait_for(&mut events, |e| matches!(e, WorkerEvent::WorkerStarted { .. })).await;
    assert!(matches!(
        started,
        WorkerEvent::WorkerStarted {
            task_kind: TaskKind::Embedding
        }
    ));
    let processed =
        wait_for(&mut events, |e| matches!(e, WorkerEvent::BatchProcessed(_))).await;
    match processed {
        WorkerEvent::BatchProcessed(report) => assert_eq!(report.completed, 5),
        other => panic!("unexpected event {other:?}"),
    }

    handle.shutdown().await.unwrap();
    wait_for(&mut events, |e| matches!(e, WorkerEvent::WorkerStopped)).await;
    timeout(WAIT, handle.join()).await.unwrap().unwrap();

    assert!(store
        .jobs()
        .await
        .iter()
        .all(|j| j.status == JobStatus::Completed));
}

#[tokio::test]
async fn test_worker_wakes_on_enqueue() {
    let store = MemoryStore::new();
    let ctx = PipelineContext::in_memory(store.clone(), Arc::new(MockEmbeddingBackend::new()));
    // Idle backoff far longer than the test timeout.
    let config = WorkerConfig::default().with_idle_backoff(600_000);
    let worker = JobWorker::new(ctx, DispatcherConfig::default(), config);
    let mut events = worker.events();
    let handle = worker.start();

    wait_for(&mut events, |e| matches!(e, WorkerEvent::WorkerStarted { .. })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = seed(&store, "w/late").await;
    wait_for(&mut events, |e| matches!(e, WorkerEvent::BatchProcessed(_))).await;

    let job = store.find(id, TaskKind::Embedding).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    handle.shutdown().await.unwrap();
    timeout(WAIT, handle.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_worker_survives_inference_failures() {
    let store = MemoryStore::new();
    let id = seed(&store, "w/flaky").await;
    let engine = Arc::new(MockEmbeddingBackend::new().with_transient_failures(2));
    let ctx = PipelineContext::in_memory(store.clone(), engine.clone());
    // A zero lease hands failed batches straight back to the queue.
    let config = fast_config()
        .with_lease(Some(Duration::ZERO))
        .with_max_attempts(5);
    let worker = JobWorker::new(ctx, DispatcherConfig::default(), config);
    let mut events = worker.events();
    let handle = worker.start();

    for _ in 0..2 {
        let failed = wait_for(&mut events, |e| {
            matches!(e, WorkerEvent::PassFailed { .. } | WorkerEvent::BatchProcessed(_))
        })
        .await;
        assert!(matches!(failed, WorkerEvent::PassFailed { .. }), "got {failed:?}");
    }
    let processed =
        wait_for(&mut events, |e| matches!(e, WorkerEvent::BatchProcessed(_))).await;
    assert!(matches!(processed, WorkerEvent::BatchProcessed(r) if r.completed == 1));

    handle.shutdown().await.unwrap();
    timeout(WAIT, handle.join()).await.unwrap().unwrap();

    let job = store.find(id, TaskKind::Embedding).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 3);
    assert_eq!(engine.call_count(), 3);
}

#[tokio::test]
async fn test_exhausted_jobs_fail_after_max_attempts() {
    let store = MemoryStore::new();
    let id = seed(&store, "w/doomed").await;
    let engine = Arc::new(MockEmbeddingBackend::new().with_transient_failures(usize::MAX));
    let ctx = PipelineContext::in_memory(store.clone(), engine);
    let config = fast_config()
        .with_lease(Some(Duration::ZERO))
        .with_max_attempts(2);
    let worker = JobWorker::new(ctx, DispatcherConfig::default(), config);

    // Drive passes directly instead of through the loop.
    assert!(worker.run_pass().await.is_err());
    assert!(worker.run_pass().await.is_err());
    let third = worker.run_pass().await.unwrap();
    assert_eq!(third, reposcan_jobs::PassOutcome::Idle);

    let job = store.find(id, TaskKind::Embedding).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("lease expired after 2 attempts")
    );
}

#[tokio::test]
async fn test_disabled_worker_does_not_run() {
    let store = MemoryStore::new();
    let id = seed(&store, "w/ignored").await;
    let engine = Arc::new(MockEmbeddingBackend::new());
    let ctx = PipelineContext::in_memory(store.clone(), engine.clone());
    let worker = JobWorker::new(
        ctx,
        DispatcherConfig::default(),
        fast_config().with_enabled(false),
    );
    let handle = worker.start();

    timeout(WAIT, handle.join()).await.unwrap().unwrap();
    assert_eq!(engine.call_count(), 0);
    let job = store.find(id, TaskKind::Embedding).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_dropping_handle_stops_worker() {
    let store = MemoryStore::new();
    let ctx = PipelineContext::in_memory(store, Arc::new(MockEmbeddingBackend::new()));
    let worker = JobWorker::new(ctx, DispatcherConfig::default(), fast_config());
    let mut events = worker.events();
    let handle = worker.start();

    wait_for(&mut events, |e| matches!(e, WorkerEvent::WorkerStarted { .. })).await;
    drop(handle);
    wait_for(&mut events, |e| matches!(e, WorkerEvent::WorkerStopped)).await;
}

#[tokio::test]
async fn test_out_of_range_lease_fails_passes_without_stopping() {
    let store = MemoryStore::new();
    let item = seed(&store, "w/lease").await;
    let ctx = PipelineContext::in_memory(store.clone(), Arc::new(MockEmbeddingBackend::new()));
    let config = fast_config().with_lease(Some(Duration::from_secs(10_000_000_000_000)));
    let worker = JobWorker::new(ctx, DispatcherConfig::default(), config);
    let mut events = worker.events();
    let handle = worker.start();

    for _ in 0..2 {
        match wait_for(&mut events, |e| matches!(e, WorkerEvent::PassFailed { .. })).await {
            WorkerEvent::PassFailed { error } => assert!(error.contains("lease out of range")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    handle.shutdown().await.unwrap();
    timeout(WAIT, handle.join()).await.unwrap().unwrap();

    let job = store.find(item, TaskKind::Embedding).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}
