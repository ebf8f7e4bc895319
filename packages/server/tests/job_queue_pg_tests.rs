//! PostgreSQL job queue semantics: dedup keys, claim leases, retry
//! backoff, dead-lettering, progress and the status surface.

mod common;

use chrono::Utc;
use sqlx::PgPool;
use test_context::test_context;
use uuid::Uuid;

use common::PgTestContext;
use server_core::kernel::jobs::{
    ErrorKind, FailOutcome, JobQueue, JobSpec, JobStatus, PostgresJobQueue,
};

fn spec(job_type: &str, key: &str) -> JobSpec {
    JobSpec {
        job_type: job_type.to_string(),
        job_key: Some(key.to_string()),
        priority: 0,
        max_retries: 3,
        workflow_id: None,
    }
}

async fn live_rows_for_key(pool: &PgPool, key: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM jobs WHERE job_key = $1 AND status IN ('pending', 'running')",
    )
    .bind(key)
    .fetch_one(pool)
    .await
    .unwrap()
}

/// Make every pending row immediately claimable, skipping retry backoff.
async fn clear_backoff(pool: &PgPool) {
    sqlx::query("UPDATE jobs SET run_at = NOW() WHERE status = 'pending'")
        .execute(pool)
        .await
        .unwrap();
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn enqueue_dedups_by_job_key(ctx: &mut PgTestContext) {
    let queue = PostgresJobQueue::new(ctx.pool.clone());
    let key = format!("step11-{}-unit-2", Uuid::new_v4());

    let first = queue
        .enqueue(serde_json::json!({"unit": 2}), spec("generate_module_unit", &key))
        .await
        .unwrap();
    let second = queue
        .enqueue(serde_json::json!({"unit": 2}), spec("generate_module_unit", &key))
        .await
        .unwrap();

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(first.job_id(), second.job_id());
    assert_eq!(live_rows_for_key(&ctx.pool, &key).await, 1);
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn key_frees_up_once_job_finishes(ctx: &mut PgTestContext) {
    let queue = PostgresJobQueue::new(ctx.pool.clone());
    let key = format!("step7-{}", Uuid::new_v4());

    let first = queue
        .enqueue(serde_json::Value::Null, spec("generate_stage", &key))
        .await
        .unwrap();
    queue.mark_succeeded(first.job_id()).await.unwrap();

    let second = queue
        .enqueue(serde_json::Value::Null, spec("generate_stage", &key))
        .await
        .unwrap();
    assert!(second.is_created());
    assert_ne!(first.job_id(), second.job_id());
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn claim_marks_running_and_is_exclusive(ctx: &mut PgTestContext) {
    let queue = PostgresJobQueue::new(ctx.pool.clone());
    queue
        .enqueue(serde_json::Value::Null, spec("generate_stage", "step1-w"))
        .await
        .unwrap();

    let claimed = queue.claim("worker-a", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let job = &claimed[0].job;
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
    assert!(job.started_at.is_some());
    assert!(job.lease_expires_at.unwrap() > Utc::now());

    // Nothing left for a second worker
    let claimed = queue.claim("worker-b", 10).await.unwrap();
    assert!(claimed.is_empty());
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn failed_job_schedules_retry_with_exponential_backoff(ctx: &mut PgTestContext) {
    let queue = PostgresJobQueue::new(ctx.pool.clone());
    let key = format!("step10-{}-unit-1", Uuid::new_v4());
    queue
        .enqueue(serde_json::Value::Null, spec("generate_module_unit", &key))
        .await
        .unwrap();

    // First failure: retry in ~60s
    let claimed = queue.claim("worker-a", 10).await.unwrap();
    let outcome = queue
        .mark_failed(claimed[0].id, "provider timeout", ErrorKind::Retryable)
        .await
        .unwrap();
    let FailOutcome::Retrying { attempt, retry_at } = outcome else {
        panic!("expected retry");
    };
    assert_eq!(attempt, 2);
    let delay = (retry_at - Utc::now()).num_seconds();
    assert!((55..=60).contains(&delay), "first backoff ~60s, got {}s", delay);

    // The retry is delayed, so nothing is claimable yet
    assert!(queue.claim("worker-a", 10).await.unwrap().is_empty());

    // Second failure: retry in ~120s
    clear_backoff(&ctx.pool).await;
    let claimed = queue.claim("worker-a", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].attempt(), 2);
    let outcome = queue
        .mark_failed(claimed[0].id, "provider timeout", ErrorKind::Retryable)
        .await
        .unwrap();
    let FailOutcome::Retrying { attempt, retry_at } = outcome else {
        panic!("expected retry");
    };
    assert_eq!(attempt, 3);
    let delay = (retry_at - Utc::now()).num_seconds();
    assert!((115..=120).contains(&delay), "second backoff ~120s, got {}s", delay);
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn retries_exhaust_into_dead_letter(ctx: &mut PgTestContext) {
    let queue = PostgresJobQueue::new(ctx.pool.clone());
    let key = format!("step10-{}-unit-0", Uuid::new_v4());
    queue
        .enqueue(serde_json::Value::Null, spec("generate_module_unit", &key))
        .await
        .unwrap();

    let mut last_outcome = None;
    for _ in 0..4 {
        clear_backoff(&ctx.pool).await;
        let claimed = queue.claim("worker-a", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        last_outcome = Some(
            queue
                .mark_failed(claimed[0].id, "provider timeout", ErrorKind::Retryable)
                .await
                .unwrap(),
        );
    }

    assert!(last_outcome.unwrap().is_dead_lettered());

    let view = queue.status(&key).await.unwrap().unwrap();
    assert_eq!(view.state, JobStatus::DeadLetter);
    assert_eq!(view.attempts_made, 4);
    assert_eq!(view.failed_reason.as_deref(), Some("provider timeout"));

    // No live row remains; the chain does not restart itself
    assert_eq!(live_rows_for_key(&ctx.pool, &key).await, 0);
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn non_retryable_failure_dead_letters_immediately(ctx: &mut PgTestContext) {
    let queue = PostgresJobQueue::new(ctx.pool.clone());
    queue
        .enqueue(serde_json::Value::Null, spec("generate_stage", "step99-w"))
        .await
        .unwrap();

    let claimed = queue.claim("worker-a", 10).await.unwrap();
    let outcome = queue
        .mark_failed(claimed[0].id, "unknown stage number: 99", ErrorKind::NonRetryable)
        .await
        .unwrap();
    assert!(outcome.is_dead_lettered());

    let reason = sqlx::query_scalar::<_, Option<String>>(
        "SELECT dead_letter_reason FROM jobs WHERE id = $1",
    )
    .bind(claimed[0].id)
    .fetch_one(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(reason.as_deref(), Some("non-retryable error"));
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn progress_milestones_show_in_status_view(ctx: &mut PgTestContext) {
    let queue = PostgresJobQueue::new(ctx.pool.clone());
    let key = format!("step7-{}", Uuid::new_v4());
    queue
        .enqueue(serde_json::Value::Null, spec("generate_stage", &key))
        .await
        .unwrap();

    let claimed = queue.claim("worker-a", 10).await.unwrap();
    queue.set_progress(claimed[0].id, 10).await.unwrap();

    let view = queue.status(&key).await.unwrap().unwrap();
    assert_eq!(view.state, JobStatus::Running);
    assert_eq!(view.progress, 10);
    assert_eq!(view.attempts_made, 1);
    assert!(view.started_at.is_some());
    assert!(view.finished_at.is_none());

    queue.mark_succeeded(claimed[0].id).await.unwrap();
    let view = queue.status(&key).await.unwrap().unwrap();
    assert_eq!(view.state, JobStatus::Succeeded);
    assert_eq!(view.progress, 100);
    assert!(view.finished_at.is_some());
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn status_is_none_for_unknown_key(ctx: &mut PgTestContext) {
    let queue = PostgresJobQueue::new(ctx.pool.clone());
    let view = queue.status("step3-never-submitted").await.unwrap();
    assert!(view.is_none());
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn remove_finished_never_touches_live_jobs(ctx: &mut PgTestContext) {
    let queue = PostgresJobQueue::new(ctx.pool.clone());
    let key = format!("step7-{}", Uuid::new_v4());
    let result = queue
        .enqueue(serde_json::Value::Null, spec("generate_stage", &key))
        .await
        .unwrap();

    // Pending: refused
    assert!(!queue.remove_finished(&key).await.unwrap());

    // Running: refused
    queue.claim("worker-a", 10).await.unwrap();
    assert!(!queue.remove_finished(&key).await.unwrap());

    // Succeeded: removed, key queryable no more
    queue.mark_succeeded(result.job_id()).await.unwrap();
    assert!(queue.remove_finished(&key).await.unwrap());
    assert!(queue.status(&key).await.unwrap().is_none());
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn expired_lease_is_redelivered_to_another_worker(ctx: &mut PgTestContext) {
    // 50ms lease so the "worker death" shows up quickly
    let queue = PostgresJobQueue::with_lease_duration(ctx.pool.clone(), 50);
    let key = format!("step10-{}-unit-0", Uuid::new_v4());
    queue
        .enqueue(serde_json::Value::Null, spec("generate_module_unit", &key))
        .await
        .unwrap();

    let claimed = queue.claim("worker-a", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    let reclaimed = queue.claim("worker-b", 10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, claimed[0].id);
    assert_eq!(reclaimed[0].job.worker_id.as_deref(), Some("worker-b"));
}

#[test_context(PgTestContext)]
#[tokio::test]
async fn heartbeat_keeps_the_lease_alive(ctx: &mut PgTestContext) {
    let queue = PostgresJobQueue::with_lease_duration(ctx.pool.clone(), 300);
    queue
        .enqueue(serde_json::Value::Null, spec("generate_stage", "step1-w"))
        .await
        .unwrap();

    let claimed = queue.claim("worker-a", 10).await.unwrap();
    let job_id = claimed[0].id;

    for _ in 0..4 {
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        queue.heartbeat(job_id).await.unwrap();
    }

    // Lease was extended the whole time; nobody can steal the job
    let stolen = queue.claim("worker-b", 10).await.unwrap();
    assert!(stolen.is_empty());
}
