//! Centralized queued-vs-inline dispatch decision.
//!
//! The durable queue is an optional dependency: when `JOB_QUEUE_URL` is
//! unset (or the queue is unreachable at startup), the orchestration layer
//! degrades to a synchronous fallback where the caller invokes stage
//! generation inline and blocks. That decision is made once, here, at
//! construction time; entry points ask the dispatcher instead of probing
//! configuration themselves.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use super::queue::{CommandMeta, EnqueueResult, JobQueue};
use super::status::JobStatusView;

/// How a submitted command was handled.
#[derive(Debug)]
pub enum Dispatched {
    /// The command was handed to the durable queue.
    Queued(EnqueueResult),
    /// Queueing is disabled; the caller must execute the work synchronously.
    Inline,
}

impl Dispatched {
    pub fn is_inline(&self) -> bool {
        matches!(self, Dispatched::Inline)
    }
}

/// Single decision point for queue availability.
pub struct JobDispatcher {
    queue: Option<Arc<dyn JobQueue>>,
}

impl JobDispatcher {
    /// Dispatcher backed by a durable queue.
    pub fn queued(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue: Some(queue) }
    }

    /// Dispatcher for the synchronous fallback mode.
    pub fn inline_only() -> Self {
        Self { queue: None }
    }

    /// Whether a durable queue is configured.
    pub fn is_queued(&self) -> bool {
        self.queue.is_some()
    }

    /// Handle to the underlying queue, when one is configured.
    pub fn queue(&self) -> Option<Arc<dyn JobQueue>> {
        self.queue.clone()
    }

    /// Submit a command: enqueue it when a queue is configured, otherwise
    /// tell the caller to run the work inline.
    pub async fn submit<C>(&self, command: C) -> Result<Dispatched>
    where
        C: CommandMeta + Serialize + Send,
    {
        match &self.queue {
            Some(queue) => {
                let spec = command.spec();
                let payload = serde_json::to_value(&command)?;
                let result = queue.enqueue(payload, spec).await?;
                Ok(Dispatched::Queued(result))
            }
            None => {
                debug!(
                    job_type = command.command_type(),
                    "queue not configured; command will run inline"
                );
                Ok(Dispatched::Inline)
            }
        }
    }

    /// Status lookup by dedup key. In inline mode there are no job records,
    /// so this always reports `None`.
    pub async fn job_status(&self, job_key: &str) -> Result<Option<JobStatusView>> {
        match &self.queue {
            Some(queue) => queue.status(job_key).await,
            None => Ok(None),
        }
    }

    /// Remove finished job rows for a dedup key so the command can be
    /// re-triggered. No-op in inline mode.
    pub async fn remove_finished(&self, job_key: &str) -> Result<bool> {
        match &self.queue {
            Some(queue) => queue.remove_finished(job_key).await,
            None => Ok(false),
        }
    }
}
