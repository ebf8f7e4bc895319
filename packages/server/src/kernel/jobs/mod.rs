//! Job infrastructure for background stage generation.
//!
//! This module provides the kernel-level machinery that moves curriculum
//! generation off the synchronous request path:
//! - [`PostgresJobQueue`] - Database-backed durable queue with deterministic
//!   dedup keys
//! - [`JobRegistry`] - Maps job types to domain handlers and
//!   exhausted-retries hooks
//! - [`JobRunner`] - Long-running service that claims and executes jobs
//! - [`JobDispatcher`] - The single queued-vs-inline decision point
//! - [`JobStatusService`] - Read-only progress surface for polling clients
//!
//! # Architecture
//!
//! ```text
//! CurriculumService.generate_*()
//!     │
//!     └─► JobDispatcher.submit(command)
//!             ├─► queued: insert jobs row (dedup by job_key)
//!             └─► inline: caller runs the processor synchronously
//!
//! JobRunner
//!     │
//!     ├─► Poll DB (claim jobs via JobQueue)
//!     ├─► Deserialize + execute handler (JobRegistry)
//!     ├─► Mark succeeded/failed (retries with backoff)
//!     └─► On dead-letter: exhausted hook persists last_error
//! ```
//!
//! Domain-specific job payloads and handlers live in their domains; this
//! module only provides the infrastructure.

mod dispatch;
mod job;
mod queue;
mod registry;
mod runner;
mod status;
pub mod testing;

pub use dispatch::{Dispatched, JobDispatcher};
pub use job::{ErrorKind, Job, JobStatus, DEFAULT_LEASE_MS};
pub use queue::{ClaimedJob, CommandMeta, EnqueueResult, FailOutcome, JobQueue, JobSpec, PostgresJobQueue};
pub use registry::{JobContext, JobRegistry, SharedJobRegistry};
pub use runner::{classify_error, JobRunner, JobRunnerConfig};
pub use status::{JobStatusService, JobStatusView};
