//! Integration tests for the PostgreSQL queue and embedding cache.
//!
//! **IMPORTANT**: These tests require a fully migrated PostgreSQL database
//! with the pgvector extension. Run migrations first: `sqlx migrate run`
//!
//! The tests share tables, so each one holds a process-wide lock and
//! truncates before running.

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use reposcan_db::test_fixtures::TestDatabase;
use reposcan_db::{
    EmbeddingCache, Error, JobQueue, JobStatus, PgJobQueue, QueueConfig, ReclaimOutcome,
    TaskKind, Vector, WorkRecordStore,
};
use tokio::sync::{Mutex, MutexGuard};

static LOCK: OnceLock<Mutex<()>> = OnceLock::new();

async fn serial() -> MutexGuard<'static, ()> {
    LOCK.get_or_init(|| Mutex::new(())).lock().await
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn test_enqueue_is_idempotent() {
    let _guard = serial().await;
    let test_db = TestDatabase::new().await;
    let item = test_db.seed_record("octo/idempotent").await;

    let first = test_db
        .db
        .jobs
        .enqueue(item, TaskKind::Embedding, 5)
        .await
        .unwrap();
    let second = test_db
        .db
        .jobs
        .enqueue(item, TaskKind::Embedding, 9)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.priority, 5);
    assert_eq!(
        test_db.db.jobs.pending_count(Some(TaskKind::Embedding)).await.unwrap(),
        1
    );
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn test_claim_orders_by_priority() {
    let _guard = serial().await;
    let test_db = TestDatabase::new().await;

    let mut ids = Vec::new();
    for (i, priority) in [3, 9, 5].into_iter().enumerate() {
        let item = test_db.seed_record(&format!("octo/prio-{i}")).await;
        let job = test_db
            .db
            .jobs
            .enqueue(item, TaskKind::Embedding, priority)
            .await
            .unwrap();
        ids.push(job.id);
    }

    let claimed = test_db
        .db
        .jobs
        .claim_batch(TaskKind::Embedding, 10)
        .await
        .unwrap();
    let order: Vec<_> = claimed.iter().map(|j| j.id).collect();
    assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    assert!(claimed
        .iter()
        .all(|j| j.status == JobStatus::Processing && j.attempts == 1));
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn test_concurrent_claims_are_disjoint() {
    let _guard = serial().await;
    let test_db = TestDatabase::new().await;

    for i in 0..40 {
        let item = test_db.seed_record(&format!("octo/concurrent-{i}")).await;
        test_db
            .db
            .jobs
            .enqueue(item, TaskKind::Embedding, 5)
            .await
            .unwrap();
    }

    let (a, b, c, d) = tokio::join!(
        test_db.db.jobs.claim_batch(TaskKind::Embedding, 15),
        test_db.db.jobs.claim_batch(TaskKind::Embedding, 15),
        test_db.db.jobs.claim_batch(TaskKind::Embedding, 15),
        test_db.db.jobs.claim_batch(TaskKind::Embedding, 15),
    );

    let mut seen = HashSet::new();
    for batch in [a, b, c, d] {
        for job in batch.unwrap() {
            assert!(seen.insert(job.id), "job claimed twice");
        }
    }
    assert_eq!(seen.len(), 40);
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn test_backpressure_and_complete() {
    let _guard = serial().await;
    let test_db = TestDatabase::new().await;
    let queue = PgJobQueue::with_config(
        test_db.pool.clone(),
        QueueConfig::default().with_max_depth(1),
    );

    let first = test_db.seed_record("octo/first").await;
    let second = test_db.seed_record("octo/second").await;
    let job = queue.enqueue(first, TaskKind::Embedding, 5).await.unwrap();

    let err = queue
        .enqueue(second, TaskKind::Embedding, 5)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull { depth: 1, limit: 1 }));

    assert!(matches!(
        queue.complete(job.id, None).await,
        Err(Error::InvalidTransition { .. })
    ));

    queue.claim_batch(TaskKind::Embedding, 1).await.unwrap();
    queue.complete(job.id, Some("model exploded")).await.unwrap();
    let failed = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("model exploded"));
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn test_reclaim_expired_leases() {
    let _guard = serial().await;
    let test_db = TestDatabase::new().await;
    let item = test_db.seed_record("octo/lease").await;
    let jobs = &test_db.db.jobs;

    let job = jobs.enqueue(item, TaskKind::Embedding, 5).await.unwrap();
    jobs.claim_batch(TaskKind::Embedding, 1).await.unwrap();

    let outcome = jobs
        .reclaim_expired(TaskKind::Embedding, Duration::ZERO, 2)
        .await
        .unwrap();
    assert_eq!(outcome, ReclaimOutcome { requeued: 1, failed: 0 });

    jobs.claim_batch(TaskKind::Embedding, 1).await.unwrap();
    let outcome = jobs
        .reclaim_expired(TaskKind::Embedding, Duration::ZERO, 2)
        .await
        .unwrap();
    assert_eq!(outcome, ReclaimOutcome { requeued: 0, failed: 1 });

    let failed = jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("lease expired after 2 attempts")
    );
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn test_embedding_cache_upsert_and_dimension() {
    let _guard = serial().await;
    let test_db = TestDatabase::new().await;
    let item = test_db.seed_record("octo/cache").await;
    let cache = &test_db.db.embeddings;

    cache
        .put(item, "mini", &Vector::from(vec![1.0, 0.0, 0.0]), "one")
        .await
        .unwrap();
    cache
        .put(item, "mini", &Vector::from(vec![0.0, 1.0, 0.0]), "two")
        .await
        .unwrap();

    let entry = cache.get_entry(item, "mini").await.unwrap().unwrap();
    assert_eq!(entry.vector.as_slice(), &[0.0, 1.0, 0.0]);
    assert_eq!(entry.input_text, "two");
    assert_eq!(cache.count_for_model("mini").await.unwrap(), 1);

    let err = cache
        .put(item, "mini", &Vector::from(vec![1.0, 0.0]), "short")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2, .. }));

    let stored = test_db
        .db
        .repositories
        .get_by_full_name("octo/cache")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id, item);
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn test_concurrent_enqueue_respects_depth_ceiling() {
    let _guard = serial().await;
    let test_db = TestDatabase::new().await;
    let queue = PgJobQueue::with_config(
        test_db.pool.clone(),
        QueueConfig::default().with_max_depth(5),
    );

    let mut items = Vec::new();
    for i in 0..20 {
        items.push(test_db.seed_record(&format!("octo/ceiling-{i}")).await);
    }

    let results = futures::future::join_all(
        items
            .iter()
            .map(|item| queue.enqueue(*item, TaskKind::Embedding, 5)),
    )
    .await;

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(Error::QueueFull { .. })))
        .count();
    assert_eq!(accepted, 5);
    assert_eq!(rejected, 15);
    assert_eq!(queue.pending_count(None).await.unwrap(), 5);
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn test_job_survives_deleted_record() {
    let _guard = serial().await;
    let test_db = TestDatabase::new().await;
    let item = test_db.seed_record("octo/deleted").await;
    let jobs = &test_db.db.jobs;

    let job = jobs.enqueue(item, TaskKind::Embedding, 5).await.unwrap();
    jobs.claim_batch(TaskKind::Embedding, 1).await.unwrap();

    sqlx::query("DELETE FROM repositories WHERE id = $1")
        .bind(item)
        .execute(&test_db.pool)
        .await
        .unwrap();

    let job = jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert!(test_db.db.repositories.resolve(&[item]).await.unwrap().is_empty());

    let orphan = jobs
        .enqueue(uuid::Uuid::new_v4(), TaskKind::Embedding, 5)
        .await
        .unwrap();
    assert_eq!(orphan.status, JobStatus::Pending);
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn test_reclaim_rejects_out_of_range_lease() {
    let _guard = serial().await;
    let test_db = TestDatabase::new().await;

    let err = test_db
        .db
        .jobs
        .reclaim_expired(TaskKind::Embedding, Duration::from_secs(10_000_000_000_000), 3)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}
