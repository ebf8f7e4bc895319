//! Job model for background stage generation.
//!
//! One row per job execution attempt. Retries are separate rows linked via
//! `root_job_id`, so the history of an exhausted job stays queryable.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
}

impl JobStatus {
    /// Whether this status is terminal (the row will never run again).
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::DeadLetter
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// Default lease duration while a job is running (1 minute).
pub const DEFAULT_LEASE_MS: i64 = 60_000;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    // Identity
    pub job_type: String,
    /// Deterministic deduplication key. At most one pending/running row per
    /// key (enforced by a partial unique index).
    #[builder(default, setter(strip_option))]
    pub job_key: Option<String>,

    // Payload
    #[builder(default = serde_json::Value::Null)]
    pub args: serde_json::Value,

    // Scheduling
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub priority: i32,

    // Execution settings
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 1)]
    pub attempt: i32,
    #[builder(default = DEFAULT_LEASE_MS)]
    pub lease_duration_ms: i64,

    // Lease management
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub progress: i16,

    // Workflow coordination (observability only)
    #[builder(default, setter(strip_option))]
    pub workflow_id: Option<Uuid>,

    // Error tracking
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<ErrorKind>,

    // Dead letter bookkeeping
    #[builder(default, setter(strip_option))]
    pub dead_lettered_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub dead_letter_reason: Option<String>,

    // Retry chain tracing
    #[builder(default, setter(strip_option))]
    pub root_job_id: Option<Uuid>,

    // Timestamps
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a job for a serialized command payload.
    pub fn for_command(
        job_type: &str,
        args: serde_json::Value,
        job_key: Option<String>,
        priority: i32,
        max_retries: i32,
        workflow_id: Option<Uuid>,
        lease_duration_ms: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            job_type: job_type.to_string(),
            job_key,
            args,
            run_at: None,
            priority,
            max_retries,
            retry_count: 0,
            attempt: 1,
            lease_duration_ms,
            lease_expires_at: None,
            worker_id: None,
            status: JobStatus::Pending,
            progress: 0,
            workflow_id,
            error_message: None,
            error_kind: None,
            dead_lettered_at: None,
            dead_letter_reason: None,
            root_job_id: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a retry row from a failed job.
    ///
    /// The retry shares the dedup key and carries `root_job_id` back to the
    /// first attempt, so the status surface can follow the whole chain.
    pub fn create_retry(&self, scheduled_for: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            job_type: self.job_type.clone(),
            job_key: self.job_key.clone(),
            args: self.args.clone(),
            run_at: Some(scheduled_for),
            priority: self.priority,
            max_retries: self.max_retries,
            retry_count: self.retry_count + 1,
            attempt: self.attempt + 1,
            lease_duration_ms: self.lease_duration_ms,
            lease_expires_at: None,
            worker_id: None,
            status: JobStatus::Pending,
            progress: 0,
            workflow_id: self.workflow_id,
            error_message: None,
            error_kind: None,
            dead_lettered_at: None,
            dead_letter_reason: None,
            root_job_id: self.root_job_id.or(Some(self.id)),
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the job is ready to run at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }

        match self.run_at {
            None => true,
            Some(run_at) => run_at <= now,
        }
    }

    /// Whether this row is live from the broker's point of view
    /// (counts towards the one-live-job-per-key guarantee).
    pub fn is_live(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }

    /// Insert the job into the database.
    ///
    /// Returns `None` when a live row with the same dedup key won the race
    /// (the partial unique index rejected the insert).
    pub async fn insert(&self, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO jobs (
                id, job_type, job_key, args, run_at, priority,
                max_retries, retry_count, attempt, lease_duration_ms,
                lease_expires_at, worker_id, status, progress, workflow_id,
                error_message, error_kind, dead_lettered_at, dead_letter_reason,
                root_job_id, started_at, finished_at, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10,
                $11, $12, $13, $14, $15,
                $16, $17, $18, $19,
                $20, $21, $22, $23, $24
            )
            ON CONFLICT (job_key) WHERE status IN ('pending', 'running') DO NOTHING
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(&self.job_type)
        .bind(&self.job_key)
        .bind(&self.args)
        .bind(self.run_at)
        .bind(self.priority)
        .bind(self.max_retries)
        .bind(self.retry_count)
        .bind(self.attempt)
        .bind(self.lease_duration_ms)
        .bind(self.lease_expires_at)
        .bind(&self.worker_id)
        .bind(self.status)
        .bind(self.progress)
        .bind(self.workflow_id)
        .bind(&self.error_message)
        .bind(self.error_kind)
        .bind(self.dead_lettered_at)
        .bind(&self.dead_letter_reason)
        .bind(self.root_job_id)
        .bind(self.started_at)
        .bind(self.finished_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_optional(pool)
        .await?;

        Ok(job)
    }

    /// Find a job by its primary key.
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await?;

        Ok(job)
    }

    /// Find the live (pending or running) job for a dedup key, if any.
    pub async fn find_live_by_key(job_key: &str, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM jobs
            WHERE job_key = $1 AND status IN ('pending', 'running')
            LIMIT 1
            "#,
        )
        .bind(job_key)
        .fetch_optional(pool)
        .await?;

        Ok(job)
    }

    /// Find the most recent attempt for a dedup key, live or finished.
    pub async fn find_latest_by_key(job_key: &str, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM jobs
            WHERE job_key = $1
            ORDER BY attempt DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(job_key)
        .fetch_optional(pool)
        .await?;

        Ok(job)
    }

    /// Claim jobs atomically using FOR UPDATE SKIP LOCKED.
    ///
    /// Also reclaims running jobs whose lease expired (the previous worker
    /// died mid-processing); the handler re-derives progress from the
    /// aggregate, so redelivery is safe.
    pub async fn claim_jobs(
        limit: i64,
        worker_id: &str,
        lease_duration_ms: i64,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE
                    (status = 'pending' AND (run_at IS NULL OR run_at <= NOW()))
                    OR (status = 'running' AND lease_expires_at < NOW())
                ORDER BY priority, COALESCE(run_at, created_at)
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET
                status = 'running',
                started_at = COALESCE(started_at, NOW()),
                lease_expires_at = NOW() + ($2 || ' milliseconds')::INTERVAL,
                worker_id = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING *
            "#,
        )
        .bind(limit)
        .bind(lease_duration_ms.to_string())
        .bind(worker_id)
        .fetch_all(pool)
        .await?;

        Ok(jobs)
    }

    /// List running jobs whose lease has expired, for stall logging before
    /// they get reclaimed.
    pub async fn find_stalled(pool: &PgPool) -> Result<Vec<(Uuid, Option<String>)>> {
        let rows = sqlx::query_as::<_, (Uuid, Option<String>)>(
            r#"
            SELECT id, worker_id FROM jobs
            WHERE status = 'running' AND lease_expires_at < NOW()
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    /// Extend the lease for a running job (heartbeat).
    pub async fn extend_lease(id: Uuid, lease_duration_ms: i64, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(lease_duration_ms.to_string())
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Update the progress percentage (0-100) on a running job.
    pub async fn set_progress(id: Uuid, progress: i16, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET progress = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(progress.clamp(0, 100))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Delete all finished rows for a dedup key so a stage can be
    /// re-triggered explicitly. Refuses to touch anything while a live row
    /// exists for the key.
    pub async fn delete_finished_by_key(job_key: &str, pool: &PgPool) -> Result<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE job_key = $1
              AND status IN ('succeeded', 'failed', 'dead_letter')
              AND NOT EXISTS (
                  SELECT 1 FROM jobs
                  WHERE job_key = $1 AND status IN ('pending', 'running')
              )
            "#,
        )
        .bind(job_key)
        .execute(pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}
