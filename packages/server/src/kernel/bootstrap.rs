//! Composition root for the orchestration layer.
//!
//! Builds the dependency graph from configuration: aggregate store, job
//! dispatcher (queued or inline), registry, and, when a queue is
//! configured, the job runner. The queued-vs-inline decision happens here
//! exactly once; an unreachable queue degrades to the synchronous fallback
//! instead of failing startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::Config;
use crate::domains::curriculum::generators::GeneratorSet;
use crate::domains::curriculum::jobs::register_jobs;
use crate::domains::curriculum::store::PgWorkflowStore;
use crate::kernel::jobs::{
    JobDispatcher, JobRegistry, JobRunner, JobRunnerConfig, PostgresJobQueue,
};
use crate::kernel::ServerDeps;

/// The assembled orchestration layer.
pub struct Orchestration {
    pub deps: Arc<ServerDeps>,
    /// Present only in queued mode; spawn it to start processing jobs.
    pub runner: Option<JobRunner>,
    pub db_pool: PgPool,
}

/// Build the orchestration layer from configuration.
///
/// The stage generators are injected by the caller; this crate never
/// constructs generator implementations itself.
pub async fn init(config: &Config, generators: Arc<GeneratorSet>) -> Result<Orchestration> {
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the workflow database")?;

    let workflow_store = Arc::new(PgWorkflowStore::new(db_pool.clone()));

    // The single queued-vs-inline decision.
    let dispatcher = Arc::new(match &config.job_queue_url {
        Some(url) => match PgPoolOptions::new().max_connections(10).connect(url).await {
            Ok(queue_pool) => {
                info!("durable job queue configured");
                JobDispatcher::queued(Arc::new(PostgresJobQueue::new(queue_pool)))
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "job queue unreachable; degrading to inline stage generation"
                );
                JobDispatcher::inline_only()
            }
        },
        None => {
            info!("job queue not configured; stage generation runs inline");
            JobDispatcher::inline_only()
        }
    });

    let deps = Arc::new(ServerDeps::new(
        workflow_store,
        generators,
        dispatcher.clone(),
    ));

    let runner = dispatcher.queue().map(|queue| {
        let mut registry = JobRegistry::new();
        register_jobs(&mut registry);

        let runner_config = JobRunnerConfig {
            batch_size: config.job_batch_size,
            poll_interval: Duration::from_secs(config.job_poll_interval_secs),
            ..JobRunnerConfig::default()
        };

        JobRunner::with_config(queue, Arc::new(registry), deps.clone(), runner_config)
    });

    Ok(Orchestration {
        deps,
        runner,
        db_pool,
    })
}
