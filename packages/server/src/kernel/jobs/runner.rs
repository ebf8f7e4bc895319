//! Job runner service for processing background jobs.
//!
//! The `JobRunner` is a background service that:
//! - Polls the database for ready jobs
//! - Deserializes and executes jobs using the registry
//! - Sends heartbeats while a job runs so its lease stays alive
//! - Handles status updates (succeeded/failed)
//! - Fires the registry's exhausted hook when a job dead-letters
//!
//! # Architecture
//!
//! ```text
//! JobRunner
//!     │
//!     ├─► Poll DB (claim jobs via JobQueue)
//!     ├─► Execute via JobRegistry (deserialize + call handler)
//!     ├─► Mark succeeded/failed (JobQueue handles retries)
//!     └─► On dead-letter: registry.handle_exhausted (best-effort)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(build_job_registry());
//! let runner = JobRunner::new(queue, registry, deps);
//!
//! // Spawn as background task
//! tokio::spawn(runner.run());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::{ClaimedJob, JobQueue};
use super::registry::{JobContext, SharedJobRegistry};
use super::ErrorKind;
use crate::domains::curriculum::chain::ChainError;
use crate::domains::curriculum::generators::GeneratorError;
use crate::domains::curriculum::single_shot::SingleShotError;
use crate::kernel::ServerDeps;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Maximum number of jobs to claim at once
    pub batch_size: i64,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// How often to extend the lease of a running job
    pub heartbeat_interval: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            worker_id: format!("runner-{}", Uuid::new_v4()),
        }
    }
}

impl JobRunnerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Background service that processes jobs from the queue.
///
/// The runner polls for jobs, executes them via the registry, and updates
/// their status. Retries are handled automatically by the job queue's
/// `mark_failed` implementation.
pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    registry: SharedJobRegistry,
    deps: Arc<ServerDeps>,
    config: JobRunnerConfig,
    shutdown: Arc<AtomicBool>,
}

impl JobRunner {
    /// Create a new job runner.
    pub fn new(queue: Arc<dyn JobQueue>, registry: SharedJobRegistry, deps: Arc<ServerDeps>) -> Self {
        Self {
            queue,
            registry,
            deps,
            config: JobRunnerConfig::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create with custom configuration.
    pub fn with_config(
        queue: Arc<dyn JobQueue>,
        registry: SharedJobRegistry,
        deps: Arc<ServerDeps>,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            deps,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a shutdown handle for graceful shutdown.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Request shutdown of the runner.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run the job runner until shutdown is requested.
    pub async fn run(self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "job runner starting"
        );

        loop {
            if self.is_shutdown_requested() {
                break;
            }

            let jobs = match self
                .queue
                .claim(&self.config.worker_id, self.config.batch_size)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            debug!(count = jobs.len(), "claimed jobs");

            // Process the claimed batch concurrently; each job settles its
            // own status.
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|job| self.process_job(job))
                .collect();
            futures::future::join_all(handles).await;
        }

        info!(worker_id = %self.config.worker_id, "job runner stopped");
        Ok(())
    }

    /// Run until a shutdown signal is received.
    ///
    /// Convenience method that listens for Ctrl+C.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown_handle();

        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.run().await
    }

    /// Process a single claimed job: execute, settle status, fire the
    /// exhausted hook on dead-letter.
    async fn process_job(&self, job: ClaimedJob) {
        let job_id = job.id;
        let job_type = job.command_type().to_string();

        debug!(job_id = %job_id, job_type = %job_type, attempt = job.attempt(), "executing job");

        let ctx = JobContext::for_job(job_id, job.attempt(), self.queue.clone());
        let result = self.execute_with_heartbeat(&job, ctx).await;

        match result {
            Ok(()) => {
                info!(job_id = %job_id, job_type = %job_type, "job succeeded");
                if let Err(e) = self.queue.mark_succeeded(job_id).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job as succeeded");
                }
            }
            Err(e) => {
                let error_kind = classify_error(&e);
                warn!(
                    job_id = %job_id,
                    job_type = %job_type,
                    error = %e,
                    retryable = error_kind.should_retry(),
                    "job failed"
                );

                match self.queue.mark_failed(job_id, &e.to_string(), error_kind).await {
                    Ok(outcome) if outcome.is_dead_lettered() => {
                        // Terminal failure: let the owning domain surface it
                        // (e.g. persist last_error onto the aggregate).
                        // Best-effort only.
                        if let Err(hook_err) = self
                            .registry
                            .handle_exhausted(&job, self.deps.clone(), &e.to_string())
                            .await
                        {
                            error!(
                                job_id = %job_id,
                                error = %hook_err,
                                "exhausted-retries hook failed"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(mark_err) => {
                        error!(job_id = %job_id, error = %mark_err, "failed to mark job as failed");
                    }
                }
            }
        }
    }

    /// Execute a job while periodically extending its lease.
    async fn execute_with_heartbeat(&self, job: &ClaimedJob, ctx: JobContext) -> Result<()> {
        let queue = self.queue.clone();
        let job_id = job.id;
        let heartbeat_interval = self.config.heartbeat_interval;

        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        if let Err(e) = queue.heartbeat(job_id).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        let result = self.registry.execute(job, ctx, self.deps.clone()).await;

        let _ = stop_tx.send(());
        let _ = heartbeat_handle.await;

        result
    }
}

/// Classify an error to determine retry behavior.
///
/// Typed orchestration errors carry their own fatality; for collaborator
/// errors (generators, stores) fall back to message heuristics.
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    if let Some(chain) = error.downcast_ref::<ChainError>() {
        return if chain.is_fatal() {
            ErrorKind::NonRetryable
        } else {
            ErrorKind::Retryable
        };
    }

    if let Some(single_shot) = error.downcast_ref::<SingleShotError>() {
        return if single_shot.is_fatal() {
            ErrorKind::NonRetryable
        } else {
            ErrorKind::Retryable
        };
    }

    if error.downcast_ref::<GeneratorError>().is_some() {
        // Unknown or misregistered stage: programmer error, not retryable.
        return ErrorKind::NonRetryable;
    }

    let error_str = error.to_string().to_lowercase();

    // Non-retryable: validation errors, not found, permission denied
    if error_str.contains("not found")
        || error_str.contains("invalid")
        || error_str.contains("permission denied")
        || error_str.contains("unauthorized")
        || error_str.contains("forbidden")
    {
        return ErrorKind::NonRetryable;
    }

    // Non-retryable: deserialization errors
    if error_str.contains("deserialize") || error_str.contains("parse") {
        return ErrorKind::NonRetryable;
    }

    // Everything else is retryable (network errors, timeouts, etc.)
    ErrorKind::Retryable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::curriculum::stages::Stage;
    use crate::domains::curriculum::models::WorkflowId;

    #[test]
    fn config_defaults() {
        let config = JobRunnerConfig::default();
        assert_eq!(config.batch_size, 10);
        assert!(config.worker_id.starts_with("runner-"));
    }

    #[test]
    fn config_with_worker_id() {
        let config = JobRunnerConfig::with_worker_id("my-runner");
        assert_eq!(config.worker_id, "my-runner");
    }

    #[test]
    fn classify_error_retryable() {
        let error = anyhow::anyhow!("connection timeout");
        assert_eq!(classify_error(&error), ErrorKind::Retryable);
    }

    #[test]
    fn classify_error_not_found() {
        let error = anyhow::anyhow!("workflow not found");
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }

    #[test]
    fn classify_error_deserialize() {
        let error = anyhow::anyhow!("failed to deserialize payload");
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }

    #[test]
    fn classify_chain_errors_by_fatality() {
        let fatal = anyhow::Error::from(ChainError::WorkflowNotFound(WorkflowId::nil()));
        assert_eq!(classify_error(&fatal), ErrorKind::NonRetryable);

        let transient = anyhow::Error::from(ChainError::Generation(anyhow::anyhow!(
            "provider returned 503"
        )));
        assert_eq!(classify_error(&transient), ErrorKind::Retryable);
    }

    #[test]
    fn classify_unknown_stage_as_fatal() {
        let error = anyhow::Error::from(GeneratorError::UnknownStage(Stage::Syllabus));
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }
}
