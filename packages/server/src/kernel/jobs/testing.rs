//! In-memory job queue for deterministic orchestration tests.
//!
//! Mirrors the PostgreSQL queue's observable semantics (dedup by key,
//! claim ordering, retry rows with backoff, dead-lettering) without a
//! database, so the chain orchestration properties can be exercised as
//! plain async tests.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::job::{ErrorKind, Job, JobStatus, DEFAULT_LEASE_MS};
use super::queue::{retry_backoff_secs, ClaimedJob, EnqueueResult, FailOutcome, JobQueue, JobSpec};
use super::status::JobStatusView;

/// In-memory queue with the same dedup and retry behavior as the Postgres
/// backend. Rows accumulate like database rows do, so tests can inspect the
/// full attempt history.
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<Vec<Job>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Job>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// All rows, in insertion order.
    pub fn jobs(&self) -> Vec<Job> {
        self.read().clone()
    }

    /// The live (pending/running) row for a dedup key, if any.
    pub fn live_job_for_key(&self, job_key: &str) -> Option<Job> {
        self.read()
            .iter()
            .find(|j| j.job_key.as_deref() == Some(job_key) && j.is_live())
            .cloned()
    }

    /// Count of live rows across all keys.
    pub fn live_count(&self) -> usize {
        self.read().iter().filter(|j| j.is_live()).count()
    }

    /// Clear backoff delays so pending retries become claimable immediately.
    /// Lets tests redeliver without waiting out 60s+ of simulated backoff.
    pub fn make_all_due(&self) {
        let mut jobs = self.write();
        for job in jobs.iter_mut() {
            if job.status == JobStatus::Pending {
                job.run_at = None;
            }
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, payload: serde_json::Value, spec: JobSpec) -> Result<EnqueueResult> {
        let mut jobs = self.write();

        if let Some(key) = &spec.job_key {
            if let Some(existing) = jobs
                .iter()
                .find(|j| j.job_key.as_deref() == Some(key.as_str()) && j.is_live())
            {
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let job = Job::for_command(
            &spec.job_type,
            payload,
            spec.job_key,
            spec.priority,
            spec.max_retries,
            spec.workflow_id,
            DEFAULT_LEASE_MS,
        );
        let id = job.id;
        jobs.push(job);

        Ok(EnqueueResult::Created(id))
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        let now = Utc::now();
        let mut jobs = self.write();

        let mut ready: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| {
                j.is_ready(now)
                    || (j.status == JobStatus::Running
                        && j.lease_expires_at.is_some_and(|at| at < now))
            })
            .map(|(i, _)| i)
            .collect();
        ready.sort_by_key(|&i| {
            let j = &jobs[i];
            (j.priority, j.run_at.unwrap_or(j.created_at))
        });
        ready.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(ready.len());
        for i in ready {
            let job = &mut jobs[i];
            job.status = JobStatus::Running;
            job.started_at = job.started_at.or(Some(now));
            job.worker_id = Some(worker_id.to_string());
            job.lease_expires_at = Some(now + chrono::Duration::milliseconds(job.lease_duration_ms));
            job.updated_at = now;
            claimed.push(ClaimedJob {
                id: job.id,
                job: job.clone(),
            });
        }

        Ok(claimed)
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.write();
        let job = find_mut(&mut jobs, job_id)?;
        job.status = JobStatus::Succeeded;
        job.progress = 100;
        job.finished_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> Result<FailOutcome> {
        let mut jobs = self.write();
        let job = find_mut(&mut jobs, job_id)?.clone();

        let now = Utc::now();
        if kind.should_retry() && job.retry_count < job.max_retries {
            let retry_at = now + chrono::Duration::seconds(retry_backoff_secs(job.retry_count));
            let retry_job = job.create_retry(retry_at);
            let attempt = retry_job.attempt;

            let original = find_mut(&mut jobs, job_id)?;
            original.status = JobStatus::Failed;
            original.error_message = Some(error.to_string());
            original.error_kind = Some(kind);
            original.finished_at = Some(now);
            original.updated_at = now;

            jobs.push(retry_job);

            Ok(FailOutcome::Retrying { attempt, retry_at })
        } else {
            let reason = if kind.should_retry() {
                "max retries exceeded"
            } else {
                "non-retryable error"
            };

            let original = find_mut(&mut jobs, job_id)?;
            original.status = JobStatus::DeadLetter;
            original.error_message = Some(error.to_string());
            original.error_kind = Some(kind);
            original.dead_lettered_at = Some(now);
            original.dead_letter_reason = Some(reason.to_string());
            original.finished_at = Some(now);
            original.updated_at = now;

            Ok(FailOutcome::DeadLettered)
        }
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.write();
        let job = find_mut(&mut jobs, job_id)?;
        if job.status == JobStatus::Running {
            job.lease_expires_at =
                Some(Utc::now() + chrono::Duration::milliseconds(job.lease_duration_ms));
        }
        Ok(())
    }

    async fn set_progress(&self, job_id: Uuid, progress: i16) -> Result<()> {
        let mut jobs = self.write();
        let job = find_mut(&mut jobs, job_id)?;
        if job.status == JobStatus::Running {
            job.progress = progress.clamp(0, 100);
        }
        Ok(())
    }

    async fn status(&self, job_key: &str) -> Result<Option<JobStatusView>> {
        let jobs = self.read();
        let latest = jobs
            .iter()
            .filter(|j| j.job_key.as_deref() == Some(job_key))
            .max_by_key(|j| (j.attempt, j.created_at))
            .cloned();
        Ok(latest.map(JobStatusView::from))
    }

    async fn remove_finished(&self, job_key: &str) -> Result<bool> {
        let mut jobs = self.write();

        let has_live = jobs
            .iter()
            .any(|j| j.job_key.as_deref() == Some(job_key) && j.is_live());
        if has_live {
            return Ok(false);
        }

        let before = jobs.len();
        jobs.retain(|j| {
            !(j.job_key.as_deref() == Some(job_key) && j.status.is_finished())
        });

        Ok(jobs.len() < before)
    }
}

fn find_mut(jobs: &mut [Job], job_id: Uuid) -> Result<&mut Job> {
    jobs.iter_mut()
        .find(|j| j.id == job_id)
        .ok_or_else(|| anyhow!("job {} not found", job_id))
}

/// Per-key counts of every row ever enqueued, useful for asserting that
/// duplicate submissions collapsed.
pub fn rows_per_key(queue: &InMemoryJobQueue) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for job in queue.jobs() {
        if let Some(key) = job.job_key {
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    counts
}
