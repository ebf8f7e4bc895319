//! Job registry for deserializing and executing jobs.
//!
//! The registry maps job type strings (e.g., "generate_stage") to:
//! - Deserializers that reconstruct typed job structs from JSON
//! - Handlers that execute the job logic
//! - Optional exhausted-retries hooks, fired after a job dead-letters so the
//!   owning domain can surface the terminal failure (the curriculum domain
//!   uses this to persist `last_error` onto the workflow aggregate)
//!
//! This allows the JobRunner to claim jobs from the database and dispatch
//! them to the appropriate domain handlers without knowing the concrete types.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use tracing::warn;
use uuid::Uuid;

use super::queue::{ClaimedJob, CommandMeta, JobQueue};
use crate::kernel::ServerDeps;

/// Execution context handed to job handlers alongside the payload.
///
/// Carries the job identity for progress reporting. In inline (queue-less)
/// mode there is no job record, so progress reporting is a no-op.
#[derive(Clone)]
pub struct JobContext {
    job_id: Option<Uuid>,
    attempt: i32,
    queue: Option<Arc<dyn JobQueue>>,
}

impl JobContext {
    /// Context for a claimed queue job.
    pub fn for_job(job_id: Uuid, attempt: i32, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            job_id: Some(job_id),
            attempt,
            queue: Some(queue),
        }
    }

    /// Context for inline execution with no backing job record.
    pub fn detached() -> Self {
        Self {
            job_id: None,
            attempt: 1,
            queue: None,
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        self.job_id
    }

    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    /// Report a progress milestone (0-100) on the job record, best-effort.
    pub async fn report_progress(&self, progress: i16) {
        let (Some(job_id), Some(queue)) = (self.job_id, &self.queue) else {
            return;
        };

        if let Err(e) = queue.set_progress(job_id, progress).await {
            warn!(job_id = %job_id, error = %e, "failed to report job progress");
        }
    }
}

/// Type alias for the async handler function.
///
/// Handlers take the execution context and a reference to ServerDeps and
/// return a Result. The payload type is captured when registering.
type BoxedHandler = Box<
    dyn Fn(
            serde_json::Value,
            JobContext,
            Arc<ServerDeps>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Hook invoked after a job of this type dead-letters.
type BoxedExhaustedHook = Box<
    dyn Fn(
            serde_json::Value,
            Arc<ServerDeps>,
            String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Registration entry containing the handler and optional exhausted hook.
struct JobRegistration {
    handler: BoxedHandler,
    on_exhausted: Option<BoxedExhaustedHook>,
}

/// Registry that maps job type strings to handlers.
///
/// Each domain registers its job types at startup. When the JobRunner claims
/// a job, it uses this registry to deserialize and execute the job in one
/// step.
///
/// # Example
///
/// ```ignore
/// let mut registry = JobRegistry::new();
///
/// registry.register::<GenerateStageJob, _, _>(
///     GenerateStageJob::JOB_TYPE,
///     |job, ctx, deps| async move {
///         run_stage(job.stage, job.workflow_id, &ctx, &deps).await
///     },
/// );
///
/// // Later, in JobRunner
/// registry.execute(&claimed_job, ctx, deps.clone()).await?;
/// ```
#[derive(Default)]
pub struct JobRegistry {
    registrations: HashMap<&'static str, JobRegistration>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register a job type with its handler.
    pub fn register<J, F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        J: CommandMeta + DeserializeOwned + Send + Sync + 'static,
        F: Fn(J, JobContext, Arc<ServerDeps>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed_handler: BoxedHandler = Box::new(move |value, ctx, deps| {
            let handler = handler.clone();
            Box::pin(async move {
                let job: J = serde_json::from_value(value)
                    .map_err(|e| anyhow!("failed to deserialize {}: {}", job_type, e))?;
                handler(job, ctx, deps).await
            })
        });

        self.registrations.insert(
            job_type,
            JobRegistration {
                handler: boxed_handler,
                on_exhausted: None,
            },
        );
    }

    /// Attach an exhausted-retries hook to an already-registered job type.
    ///
    /// The hook receives the original payload and the final error message
    /// after the queue dead-letters the job. Hook failures are logged by the
    /// runner and never re-thrown.
    pub fn on_exhausted<J, F, Fut>(&mut self, job_type: &'static str, hook: F)
    where
        J: CommandMeta + DeserializeOwned + Send + Sync + 'static,
        F: Fn(J, Arc<ServerDeps>, String) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed_hook: BoxedExhaustedHook = Box::new(move |value, deps, error| {
            let hook = hook.clone();
            Box::pin(async move {
                let job: J = serde_json::from_value(value)
                    .map_err(|e| anyhow!("failed to deserialize {}: {}", job_type, e))?;
                hook(job, deps, error).await
            })
        });

        match self.registrations.get_mut(job_type) {
            Some(registration) => registration.on_exhausted = Some(boxed_hook),
            None => {
                // Hook without a handler is a wiring mistake.
                panic!("on_exhausted for unregistered job type: {}", job_type);
            }
        }
    }

    /// Execute a claimed job using its registered handler.
    ///
    /// Returns an error if:
    /// - The job type is not registered
    /// - The JSON payload cannot be deserialized
    /// - The handler returns an error
    pub async fn execute(
        &self,
        job: &ClaimedJob,
        ctx: JobContext,
        deps: Arc<ServerDeps>,
    ) -> Result<()> {
        let job_type = job.command_type();
        let registration = self
            .registrations
            .get(job_type)
            .ok_or_else(|| anyhow!("unknown job type: {}", job_type))?;

        (registration.handler)(job.job.args.clone(), ctx, deps).await
    }

    /// Run the exhausted hook for a dead-lettered job, if one is registered.
    pub async fn handle_exhausted(
        &self,
        job: &ClaimedJob,
        deps: Arc<ServerDeps>,
        error: &str,
    ) -> Result<()> {
        let Some(registration) = self.registrations.get(job.command_type()) else {
            return Ok(());
        };
        let Some(hook) = &registration.on_exhausted else {
            return Ok(());
        };

        hook(job.job.args.clone(), deps, error.to_string()).await
    }

    /// Check if a job type is registered.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.registrations.contains_key(job_type)
    }

    /// Get all registered job types.
    pub fn registered_types(&self) -> Vec<&'static str> {
        self.registrations.keys().copied().collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;
