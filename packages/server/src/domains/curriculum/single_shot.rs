//! Single-shot stage execution.
//!
//! Routes a stage number to its generator function via the static table and
//! executes it as one job, reporting coarse progress milestones on the job
//! record (0 before work is acquired, ~10 once the generator is resolved,
//! 100 on completion).

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::kernel::jobs::JobContext;

use super::generators::{GeneratorError, GeneratorSet};
use super::models::{WorkflowId, WorkflowStatus};
use super::stages::Stage;

/// Result summary of a single-shot stage execution.
#[derive(Debug, Clone, Serialize)]
pub struct SingleShotOutcome {
    pub stage: Stage,
    pub workflow_id: WorkflowId,
    pub success: bool,
    pub current_step: i32,
    pub workflow_status: WorkflowStatus,
}

#[derive(Debug, Error)]
pub enum SingleShotError {
    /// Unknown or misregistered stage number: programmer error, never
    /// retried.
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error("stage generation failed: {0}")]
    Generation(#[source] anyhow::Error),
}

impl SingleShotError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SingleShotError::Generator(_))
    }
}

/// Executes non-decomposable stages, one generator call per job.
pub struct SingleShotProcessor {
    generators: Arc<GeneratorSet>,
}

impl SingleShotProcessor {
    pub fn new(generators: Arc<GeneratorSet>) -> Self {
        Self { generators }
    }

    pub async fn process(
        &self,
        stage: Stage,
        workflow_id: WorkflowId,
        input: Option<serde_json::Value>,
        ctx: &JobContext,
    ) -> Result<SingleShotOutcome, SingleShotError> {
        let generator = self.generators.single_shot(stage)?;
        ctx.report_progress(10).await;

        info!(stage = %stage, workflow_id = %workflow_id, "generating stage");

        let workflow = generator
            .generate(workflow_id, input)
            .await
            .map_err(SingleShotError::Generation)?;

        ctx.report_progress(100).await;

        Ok(SingleShotOutcome {
            stage,
            workflow_id,
            success: true,
            current_step: workflow.current_step,
            workflow_status: workflow.status,
        })
    }
}
