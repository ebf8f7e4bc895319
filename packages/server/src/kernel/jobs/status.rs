//! Read-only job status surface for progress polling.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::job::{Job, JobStatus};

/// Snapshot of a job's state for polling clients.
///
/// Derived from the most recent attempt for a dedup key, so a retried job
/// reports the retry's state and the accumulated attempt count.
#[derive(Debug, Clone)]
pub struct JobStatusView {
    pub state: JobStatus,
    pub progress: i16,
    pub attempts_made: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        Self {
            state: job.status,
            progress: job.progress,
            attempts_made: job.attempt,
            started_at: job.started_at,
            finished_at: job.finished_at,
            failed_reason: job.error_message,
        }
    }
}

/// Pure read over the jobs table; never mutates queue or aggregate state.
pub struct JobStatusService {
    pool: PgPool,
}

impl JobStatusService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up the most recent attempt for a dedup key.
    ///
    /// Returns `None` when no row exists (never submitted, or already
    /// cleaned up).
    pub async fn get(&self, job_key: &str) -> Result<Option<JobStatusView>> {
        let job = Job::find_latest_by_key(job_key, &self.pool).await?;
        Ok(job.map(JobStatusView::from))
    }
}
