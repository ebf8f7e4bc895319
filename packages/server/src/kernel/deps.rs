//! Server dependencies for job handlers (using traits for testability).
//!
//! This module provides the central dependency container handed to every
//! job handler. External services (the aggregate store and the stage
//! generators) sit behind trait abstractions so tests can swap in
//! in-memory implementations.

use std::sync::Arc;

use crate::domains::curriculum::generators::GeneratorSet;
use crate::domains::curriculum::store::WorkflowStore;
use crate::kernel::jobs::JobDispatcher;

/// Dependencies accessible to job handlers.
///
/// The stage generators are supplied by the composition root rather than
/// looked up by the orchestrators themselves, so the orchestration layer
/// never imports generator implementations.
#[derive(Clone)]
pub struct ServerDeps {
    /// Workflow aggregate persistence.
    pub workflow_store: Arc<dyn WorkflowStore>,
    /// Static table of stage generators (external collaborators).
    pub generators: Arc<GeneratorSet>,
    /// Centralized queued-vs-inline dispatch.
    pub dispatcher: Arc<JobDispatcher>,
}

impl ServerDeps {
    /// Create new ServerDeps with the given dependencies.
    pub fn new(
        workflow_store: Arc<dyn WorkflowStore>,
        generators: Arc<GeneratorSet>,
        dispatcher: Arc<JobDispatcher>,
    ) -> Self {
        Self {
            workflow_store,
            generators,
            dispatcher,
        }
    }
}
