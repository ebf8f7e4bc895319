//! The unit-chain orchestrator.
//!
//! Drives "generate one module, then enqueue the next" loops for the
//! module-decomposable stages. One parameterized component covers lessons,
//! assessments and resources; the stages differ only in which generator and
//! result list they touch.
//!
//! Progress is derived from the persisted aggregate on every execution,
//! never from in-memory state, so a freshly restarted worker resumes
//! correctly with no recovery code and replayed or duplicate deliveries
//! collapse into no-ops.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::kernel::jobs::{Dispatched, JobDispatcher};

use super::generators::ModuleStageGenerator;
use super::jobs::GenerateModuleJob;
use super::models::{ModuleId, UserId, WorkflowId};
use super::stages::Stage;
use super::store::WorkflowStore;

/// Completion summary returned by every chain execution.
#[derive(Debug, Clone, Serialize)]
pub struct ChainOutcome {
    pub stage: Stage,
    pub units_generated: usize,
    pub total_units: usize,
    pub all_complete: bool,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),
    #[error("workflow {0} has no module plan; run the module-plan stage first")]
    EmptyModulePlan(WorkflowId),
    #[error("module plan of workflow {0} no longer contains completed module {1}")]
    ModulePlanShrank(WorkflowId, ModuleId),
    #[error("stage {0} is not module-decomposable")]
    NotAModuleStage(Stage),
    #[error("module generation failed: {0}")]
    Generation(#[source] anyhow::Error),
    #[error("workflow store error: {0}")]
    Store(#[source] anyhow::Error),
    #[error("failed to enqueue next chain job: {0}")]
    Enqueue(#[source] anyhow::Error),
}

impl ChainError {
    /// Fatal errors are precondition or invariant violations; retrying the
    /// job cannot fix them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainError::WorkflowNotFound(_)
                | ChainError::EmptyModulePlan(_)
                | ChainError::ModulePlanShrank(_, _)
                | ChainError::NotAModuleStage(_)
        )
    }
}

/// Orchestrates per-module generation for one module-decomposable stage.
///
/// Instantiated once per stage (lessons, assessments, resources) with that
/// stage's generator.
pub struct ChainOrchestrator {
    stage: Stage,
    store: Arc<dyn WorkflowStore>,
    generator: Arc<dyn ModuleStageGenerator>,
    dispatcher: Arc<JobDispatcher>,
}

impl ChainOrchestrator {
    pub fn new(
        stage: Stage,
        store: Arc<dyn WorkflowStore>,
        generator: Arc<dyn ModuleStageGenerator>,
        dispatcher: Arc<JobDispatcher>,
    ) -> Result<Self, ChainError> {
        if !stage.is_module_stage() {
            return Err(ChainError::NotAModuleStage(stage));
        }

        Ok(Self {
            stage,
            store,
            generator,
            dispatcher,
        })
    }

    /// Process one chain job: generate the first still-missing module and,
    /// if more remain, enqueue the next unit's job.
    ///
    /// `unit_index` is the index the job was enqueued for; the unit that
    /// actually runs is re-derived from the aggregate, so redelivered and
    /// duplicate jobs converge instead of double-generating.
    pub async fn process(
        &self,
        workflow_id: WorkflowId,
        unit_index: usize,
        user_id: Option<UserId>,
    ) -> Result<ChainOutcome, ChainError> {
        let workflow = self
            .store
            .load(workflow_id)
            .await
            .map_err(ChainError::Store)?
            .ok_or(ChainError::WorkflowNotFound(workflow_id))?;

        if workflow.modules.is_empty() {
            return Err(ChainError::EmptyModulePlan(workflow_id));
        }
        if let Some(stale) = workflow.stale_completed_module(self.stage) {
            return Err(ChainError::ModulePlanShrank(workflow_id, stale));
        }

        let total_units = workflow.modules.len();

        let Some((next_index, next_module)) = workflow.first_missing_module(self.stage) else {
            // Already fully complete: replayed or duplicate delivery.
            let units_generated = workflow.completed_module_ids(self.stage).len();
            debug!(
                stage = %self.stage,
                workflow_id = %workflow_id,
                "chain job for fully completed stage; nothing to do"
            );
            return Ok(ChainOutcome {
                stage: self.stage,
                units_generated,
                total_units,
                all_complete: true,
            });
        };

        if next_index != unit_index {
            debug!(
                stage = %self.stage,
                workflow_id = %workflow_id,
                requested = unit_index,
                actual = next_index,
                "chain job index out of date; generating first missing module instead"
            );
        }

        info!(
            stage = %self.stage,
            workflow_id = %workflow_id,
            unit_index = next_index,
            module = %next_module.title,
            "generating module unit"
        );

        let updated = self
            .generator
            .generate_unit(workflow_id, next_index)
            .await
            .map_err(ChainError::Generation)?;

        // Re-derive completion from the updated aggregate the same way.
        let units_generated = updated.completed_module_ids(self.stage).len();
        let total_units = updated.modules.len();
        let all_complete = match updated.first_missing_module(self.stage) {
            Some((missing_index, _)) => {
                let next_job =
                    GenerateModuleJob::new(self.stage, workflow_id, missing_index, user_id);
                match self
                    .dispatcher
                    .submit(next_job)
                    .await
                    .map_err(ChainError::Enqueue)?
                {
                    Dispatched::Queued(result) => {
                        debug!(
                            stage = %self.stage,
                            workflow_id = %workflow_id,
                            unit_index = missing_index,
                            job_id = %result.job_id(),
                            duplicate = !result.is_created(),
                            "enqueued next chain job"
                        );
                    }
                    // Inline mode: the caller drives the loop instead.
                    Dispatched::Inline => {}
                }
                false
            }
            None => {
                info!(
                    stage = %self.stage,
                    workflow_id = %workflow_id,
                    total_units,
                    "module chain complete"
                );
                true
            }
        };

        Ok(ChainOutcome {
            stage: self.stage,
            units_generated,
            total_units,
            all_complete,
        })
    }
}
