//! Public entry points for curriculum generation.
//!
//! Every operation goes through the centralized [`JobDispatcher`]: with a
//! durable queue configured the work is enqueued and the caller gets a job
//! key to poll; without one the same processors run inline and block the
//! caller until generation finishes.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;

use crate::kernel::jobs::{Dispatched, EnqueueResult, JobContext, JobStatusView};
use crate::kernel::ServerDeps;

use super::chain::{ChainOrchestrator, ChainOutcome};
use super::jobs::{GenerateModuleJob, GenerateStageJob};
use super::models::{CourseWorkflow, UserId, WorkflowId};
use super::single_shot::{SingleShotOutcome, SingleShotProcessor};
use super::stages::Stage;

/// How a single-shot trigger was handled.
#[derive(Debug)]
pub enum StageDispatch {
    /// Queued mode: poll the job key for progress.
    Enqueued {
        job_key: String,
        result: EnqueueResult,
    },
    /// Inline fallback: generation ran synchronously.
    Completed(SingleShotOutcome),
}

/// How a module-chain trigger was handled.
#[derive(Debug)]
pub enum ChainDispatch {
    /// Queued mode: the chain advances one unit per job from here on.
    Enqueued {
        job_key: String,
        result: EnqueueResult,
    },
    /// Inline fallback: the whole chain ran synchronously.
    Completed(ChainOutcome),
}

/// Facade over the orchestration layer for API handlers and tools.
pub struct CurriculumService {
    deps: Arc<ServerDeps>,
}

impl CurriculumService {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self { deps }
    }

    /// Create and persist a fresh workflow.
    pub async fn create_workflow(&self, user_id: Option<UserId>) -> Result<CourseWorkflow> {
        let workflow = CourseWorkflow::new(user_id);
        self.deps.workflow_store.save(&workflow).await?;
        info!(workflow_id = %workflow.id, "created course workflow");
        Ok(workflow)
    }

    /// Trigger generation of a single-shot stage.
    pub async fn generate_stage(
        &self,
        stage: Stage,
        workflow_id: WorkflowId,
        user_id: Option<UserId>,
        input: Option<serde_json::Value>,
    ) -> Result<StageDispatch> {
        if stage.is_module_stage() {
            bail!(
                "stage {} is module-decomposable; trigger its module chain instead",
                stage
            );
        }

        let job = GenerateStageJob::new(stage, workflow_id, user_id, input.clone());
        let job_key = stage.single_shot_job_key(workflow_id);

        match self.deps.dispatcher.submit(job).await? {
            Dispatched::Queued(result) => {
                info!(
                    stage = %stage,
                    workflow_id = %workflow_id,
                    job_id = %result.job_id(),
                    duplicate = !result.is_created(),
                    "stage generation enqueued"
                );
                Ok(StageDispatch::Enqueued { job_key, result })
            }
            Dispatched::Inline => {
                let processor = SingleShotProcessor::new(self.deps.generators.clone());
                let outcome = processor
                    .process(stage, workflow_id, input, &JobContext::detached())
                    .await?;
                Ok(StageDispatch::Completed(outcome))
            }
        }
    }

    /// Trigger the per-module chain for a module-decomposable stage.
    ///
    /// Queued mode enqueues the first unit's job; the chain then requeues
    /// itself unit by unit. Inline mode drives the same loop synchronously
    /// until every module is covered.
    pub async fn generate_modules(
        &self,
        stage: Stage,
        workflow_id: WorkflowId,
        user_id: Option<UserId>,
    ) -> Result<ChainDispatch> {
        let job = GenerateModuleJob::new(stage, workflow_id, 0, user_id);
        let job_key = stage.unit_job_key(workflow_id, 0);

        match self.deps.dispatcher.submit(job).await? {
            Dispatched::Queued(result) => {
                info!(
                    stage = %stage,
                    workflow_id = %workflow_id,
                    job_id = %result.job_id(),
                    duplicate = !result.is_created(),
                    "module chain enqueued"
                );
                Ok(ChainDispatch::Enqueued { job_key, result })
            }
            Dispatched::Inline => {
                let chain = self.chain_for(stage)?;
                let mut generated_so_far: Option<usize> = None;

                loop {
                    let next_index = generated_so_far.unwrap_or(0);
                    let outcome = chain.process(workflow_id, next_index, user_id).await?;

                    if outcome.all_complete {
                        return Ok(ChainDispatch::Completed(outcome));
                    }

                    // A generator that persists nothing would loop forever.
                    if generated_so_far == Some(outcome.units_generated) {
                        bail!(
                            "module generation for stage {} made no progress at unit {}",
                            stage,
                            outcome.units_generated
                        );
                    }
                    generated_so_far = Some(outcome.units_generated);
                }
            }
        }
    }

    /// Read-only job status for polling. `None` when no job record exists
    /// (never submitted, cleaned up, or running in inline mode).
    pub async fn job_status(
        &self,
        stage: Stage,
        workflow_id: WorkflowId,
        unit_index: Option<usize>,
    ) -> Result<Option<JobStatusView>> {
        let job_key = match unit_index {
            Some(index) => stage.unit_job_key(workflow_id, index),
            None => stage.single_shot_job_key(workflow_id),
        };
        self.deps.dispatcher.job_status(&job_key).await
    }

    /// Remove a finished job record so the stage can be re-triggered
    /// without waiting for cleanup. Live jobs are never removed.
    pub async fn clear_finished_job(
        &self,
        stage: Stage,
        workflow_id: WorkflowId,
        unit_index: Option<usize>,
    ) -> Result<bool> {
        let job_key = match unit_index {
            Some(index) => stage.unit_job_key(workflow_id, index),
            None => stage.single_shot_job_key(workflow_id),
        };
        self.deps.dispatcher.remove_finished(&job_key).await
    }

    /// Approve a generated step and advance the workflow.
    pub async fn approve_step(
        &self,
        workflow_id: WorkflowId,
        stage: Stage,
    ) -> Result<CourseWorkflow> {
        let mut workflow = self
            .deps
            .workflow_store
            .load(workflow_id)
            .await?
            .ok_or_else(|| anyhow!("workflow {} not found", workflow_id))?;

        workflow
            .approve_step(stage)
            .with_context(|| format!("cannot approve step {}", stage.number()))?;

        self.deps.workflow_store.save(&workflow).await?;
        info!(
            workflow_id = %workflow_id,
            stage = %stage,
            current_step = workflow.current_step,
            "step approved"
        );
        Ok(workflow)
    }

    fn chain_for(&self, stage: Stage) -> Result<ChainOrchestrator> {
        let generator = self.deps.generators.module_stage(stage)?;
        let chain = ChainOrchestrator::new(
            stage,
            self.deps.workflow_store.clone(),
            generator,
            self.deps.dispatcher.clone(),
        )?;
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::curriculum::generators::GeneratorSet;
    use crate::domains::curriculum::models::{StepStatus, WorkflowStatus};
    use crate::domains::curriculum::store::{InMemoryWorkflowStore, WorkflowStore};
    use crate::kernel::jobs::JobDispatcher;

    fn inline_service(store: Arc<InMemoryWorkflowStore>) -> CurriculumService {
        let deps = Arc::new(ServerDeps::new(
            store,
            Arc::new(GeneratorSet::new()),
            Arc::new(JobDispatcher::inline_only()),
        ));
        CurriculumService::new(deps)
    }

    #[tokio::test]
    async fn generate_stage_rejects_module_stages() {
        let service = inline_service(Arc::new(InMemoryWorkflowStore::new()));
        let result = service
            .generate_stage(Stage::ModuleLessons, WorkflowId::new(), None, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn approve_step_advances_workflow() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let service = inline_service(store.clone());

        let mut workflow = CourseWorkflow::new(None);
        workflow.set_step_status(Stage::CourseBrief, StepStatus::Generated);
        let workflow_id = workflow.id;
        store.save(&workflow).await.unwrap();

        let approved = service
            .approve_step(workflow_id, Stage::CourseBrief)
            .await
            .unwrap();
        assert_eq!(approved.current_step, 2);
        assert_eq!(approved.status, WorkflowStatus::Draft);

        let persisted = store.get(workflow_id).unwrap();
        assert_eq!(persisted.step_status(Stage::CourseBrief), StepStatus::Approved);
    }

    #[tokio::test]
    async fn approve_step_for_missing_workflow_fails() {
        let service = inline_service(Arc::new(InMemoryWorkflowStore::new()));
        let result = service
            .approve_step(WorkflowId::new(), Stage::CourseBrief)
            .await;
        assert!(result.is_err());
    }
}
