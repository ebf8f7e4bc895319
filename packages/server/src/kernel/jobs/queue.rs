//! Durable job queue backed by PostgreSQL.
//!
//! The queue provides at-least-once delivery with lease-based redelivery and
//! deterministic deduplication: commands carry a dedup key computed purely
//! from their identity (stage, workflow, unit), and at most one pending or
//! running row exists per key. Re-submitting an already-queued command is a
//! no-op at this layer.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{ErrorKind, Job, DEFAULT_LEASE_MS};
use super::status::{JobStatusService, JobStatusView};

/// Base delay before the first retry; doubles per attempt (60s, 120s, 240s).
const RETRY_BACKOFF_BASE_SECS: i64 = 60;

/// Delay in seconds before the retry following `retry_count` prior failures.
pub(crate) fn retry_backoff_secs(retry_count: i32) -> i64 {
    (RETRY_BACKOFF_BASE_SECS * 2i64.pow(retry_count.max(0) as u32)).min(3600)
}

/// Result type for enqueue operations that handles deduplication.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// Command was enqueued, returns new job ID
    Created(Uuid),
    /// A live job with the same dedup key already exists, returns its ID
    Duplicate(Uuid),
}

impl EnqueueResult {
    /// Get the job ID regardless of whether it was created or duplicate
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// Returns true if this was a newly created job
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Outcome of marking a job failed.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// A retry row was scheduled.
    Retrying {
        attempt: i32,
        retry_at: chrono::DateTime<Utc>,
    },
    /// Retries are exhausted (or the error was permanent); the job is
    /// dead-lettered and will not run again.
    DeadLettered,
}

impl FailOutcome {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, FailOutcome::DeadLettered)
    }
}

/// Queue-level settings for a command, independent of its payload type.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_type: String,
    pub job_key: Option<String>,
    pub priority: i32,
    pub max_retries: i32,
    pub workflow_id: Option<Uuid>,
}

/// Metadata for command serialization.
///
/// Commands implement this trait to provide type information and their
/// deterministic dedup key.
pub trait CommandMeta {
    /// The command type name (used as job_type).
    fn command_type(&self) -> &'static str;

    /// Deterministic dedup key.
    ///
    /// If provided, ensures only one pending/running job exists with this key.
    fn job_key(&self) -> Option<String> {
        None
    }

    /// Queue priority (lower runs first).
    fn priority(&self) -> i32 {
        0
    }

    /// Maximum retries for this command.
    fn max_retries(&self) -> i32 {
        3
    }

    /// Workflow this command belongs to, for observability.
    fn workflow_id(&self) -> Option<Uuid> {
        None
    }

    /// Assemble the queue-level spec from the metadata above.
    fn spec(&self) -> JobSpec {
        JobSpec {
            job_type: self.command_type().to_string(),
            job_key: self.job_key(),
            priority: self.priority(),
            max_retries: self.max_retries(),
            workflow_id: self.workflow_id(),
        }
    }
}

/// A claimed job ready for execution.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// The job ID
    pub id: Uuid,
    /// The raw job record
    pub job: Job,
}

impl ClaimedJob {
    /// Deserialize the command payload.
    pub fn deserialize<C: DeserializeOwned>(&self) -> Result<C> {
        serde_json::from_value(self.job.args.clone())
            .map_err(|e| anyhow!("failed to deserialize command: {}", e))
    }

    /// Get the command type (job_type)
    pub fn command_type(&self) -> &str {
        &self.job.job_type
    }

    /// Attempt number for this execution (1-based).
    pub fn attempt(&self) -> i32 {
        self.job.attempt
    }
}

/// Trait for job queue operations.
///
/// Implementations provide the storage and retrieval of serialized commands
/// for background execution. Object-safe so components can hold
/// `Arc<dyn JobQueue>`.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a serialized command for execution.
    ///
    /// If the spec carries a dedup key and a matching pending/running job
    /// exists, returns `EnqueueResult::Duplicate` with the existing job ID.
    async fn enqueue(&self, payload: serde_json::Value, spec: JobSpec) -> Result<EnqueueResult>;

    /// Claim up to `limit` jobs for processing.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` for concurrent-safe claiming and
    /// reclaims jobs with expired leases.
    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>>;

    /// Mark a job as successfully completed.
    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()>;

    /// Mark a job as failed with an error.
    ///
    /// If the error is retryable and retries remain, schedules a retry row
    /// with exponential backoff. Otherwise dead-letters the job.
    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> Result<FailOutcome>;

    /// Extend the lease for a running job (heartbeat).
    async fn heartbeat(&self, job_id: Uuid) -> Result<()>;

    /// Update the progress percentage (0-100) on a running job.
    async fn set_progress(&self, job_id: Uuid, progress: i16) -> Result<()>;

    /// Read-only status lookup by dedup key. Returns the most recent attempt.
    async fn status(&self, job_key: &str) -> Result<Option<JobStatusView>>;

    /// Remove finished rows for a dedup key so the command can be explicitly
    /// re-triggered. Never removes a pending/running row; returns whether
    /// anything was deleted.
    async fn remove_finished(&self, job_key: &str) -> Result<bool>;
}

/// PostgreSQL-backed job queue implementation.
pub struct PostgresJobQueue {
    pool: PgPool,
    default_lease_ms: i64,
}

impl PostgresJobQueue {
    /// Create a new PostgreSQL job queue.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_lease_ms: DEFAULT_LEASE_MS,
        }
    }

    /// Create with a custom lease duration.
    pub fn with_lease_duration(pool: PgPool, lease_ms: i64) -> Self {
        Self {
            pool,
            default_lease_ms: lease_ms,
        }
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, payload: serde_json::Value, spec: JobSpec) -> Result<EnqueueResult> {
        // Check the dedup key first
        if let Some(key) = &spec.job_key {
            if let Some(existing) = Job::find_live_by_key(key, &self.pool).await? {
                debug!(
                    job_id = %existing.id,
                    job_key = %key,
                    "found existing live job for dedup key"
                );
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let job = Job::for_command(
            &spec.job_type,
            payload,
            spec.job_key.clone(),
            spec.priority,
            spec.max_retries,
            spec.workflow_id,
            self.default_lease_ms,
        );

        // The partial unique index on live rows backs up the check above
        // under concurrent enqueues.
        match job.insert(&self.pool).await? {
            Some(inserted) => {
                debug!(
                    job_id = %inserted.id,
                    job_type = %inserted.job_type,
                    job_key = ?inserted.job_key,
                    "enqueued job"
                );
                Ok(EnqueueResult::Created(inserted.id))
            }
            None => {
                // Lost the race to a concurrent enqueue with the same key.
                let key = spec
                    .job_key
                    .as_deref()
                    .ok_or_else(|| anyhow!("insert of keyless job returned no row"))?;
                let existing = Job::find_live_by_key(key, &self.pool)
                    .await?
                    .ok_or_else(|| anyhow!("job {} vanished after conflicting insert", key))?;
                Ok(EnqueueResult::Duplicate(existing.id))
            }
        }
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        // Surface stalled jobs before reclaiming them.
        for (id, prev_worker) in Job::find_stalled(&self.pool).await? {
            warn!(
                job_id = %id,
                previous_worker = ?prev_worker,
                "reclaiming job with expired lease"
            );
        }

        let jobs = Job::claim_jobs(limit, worker_id, self.default_lease_ms, &self.pool).await?;

        Ok(jobs
            .into_iter()
            .map(|job| ClaimedJob { id: job.id, job })
            .collect())
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                progress = 100,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> Result<FailOutcome> {
        let job = Job::find_by_id(job_id, &self.pool).await?;

        if kind.should_retry() && job.retry_count < job.max_retries {
            let delay_secs = retry_backoff_secs(job.retry_count);
            let retry_at = Utc::now() + chrono::Duration::seconds(delay_secs);
            let retry_job = job.create_retry(retry_at);

            // Fail the original before inserting the retry so the partial
            // unique index never sees two live rows for the key.
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    error_message = $1,
                    error_kind = $2,
                    finished_at = NOW(),
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(error)
            .bind(kind)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, job_key, args, run_at, priority,
                    max_retries, retry_count, attempt, lease_duration_ms,
                    status, progress, workflow_id, root_job_id,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(retry_job.id)
            .bind(&retry_job.job_type)
            .bind(&retry_job.job_key)
            .bind(&retry_job.args)
            .bind(retry_job.run_at)
            .bind(retry_job.priority)
            .bind(retry_job.max_retries)
            .bind(retry_job.retry_count)
            .bind(retry_job.attempt)
            .bind(retry_job.lease_duration_ms)
            .bind(retry_job.status)
            .bind(retry_job.progress)
            .bind(retry_job.workflow_id)
            .bind(retry_job.root_job_id)
            .bind(retry_job.created_at)
            .bind(retry_job.updated_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            info!(
                job_id = %job_id,
                retry_job_id = %retry_job.id,
                attempt = retry_job.attempt,
                retry_at = %retry_at,
                "scheduled retry after failure"
            );

            Ok(FailOutcome::Retrying {
                attempt: retry_job.attempt,
                retry_at,
            })
        } else {
            let reason = if kind.should_retry() {
                "max retries exceeded"
            } else {
                "non-retryable error"
            };

            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'dead_letter',
                    error_message = $1,
                    error_kind = $2,
                    dead_lettered_at = NOW(),
                    dead_letter_reason = $3,
                    finished_at = NOW(),
                    updated_at = NOW()
                WHERE id = $4
                "#,
            )
            .bind(error)
            .bind(kind)
            .bind(reason)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

            warn!(job_id = %job_id, reason = reason, "job dead-lettered");

            Ok(FailOutcome::DeadLettered)
        }
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        Job::extend_lease(job_id, self.default_lease_ms, &self.pool).await
    }

    async fn set_progress(&self, job_id: Uuid, progress: i16) -> Result<()> {
        Job::set_progress(job_id, progress, &self.pool).await
    }

    async fn status(&self, job_key: &str) -> Result<Option<JobStatusView>> {
        JobStatusService::new(self.pool.clone()).get(job_key).await
    }

    async fn remove_finished(&self, job_key: &str) -> Result<bool> {
        let deleted = Job::delete_finished_by_key(job_key, &self.pool).await?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_result_helpers() {
        let created = EnqueueResult::Created(Uuid::new_v4());
        assert!(created.is_created());

        let duplicate = EnqueueResult::Duplicate(Uuid::new_v4());
        assert!(!duplicate.is_created());
        assert_eq!(duplicate.job_id(), duplicate.job_id());
    }

    #[test]
    fn backoff_doubles_per_retry() {
        assert_eq!(retry_backoff_secs(0), 60);
        assert_eq!(retry_backoff_secs(1), 120);
        assert_eq!(retry_backoff_secs(2), 240);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(retry_backoff_secs(30), 3600);
    }

    #[test]
    fn fail_outcome_dead_letter_check() {
        assert!(FailOutcome::DeadLettered.is_dead_lettered());
        assert!(!FailOutcome::Retrying {
            attempt: 2,
            retry_at: Utc::now(),
        }
        .is_dead_lettered());
    }
}
