//! Curriculum background jobs and their registry wiring.

mod generate_module;
mod generate_stage;

pub use generate_module::GenerateModuleJob;
pub use generate_stage::GenerateStageJob;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, warn};

use crate::kernel::jobs::JobRegistry;
use crate::kernel::ServerDeps;

use super::chain::ChainOrchestrator;
use super::models::{StageError, WorkflowId};
use super::single_shot::SingleShotProcessor;
use super::stages::Stage;

/// Register the curriculum job handlers and exhausted-retries hooks.
///
/// Called once by the composition root when a durable queue is configured.
pub fn register_jobs(registry: &mut JobRegistry) {
    registry.register::<GenerateStageJob, _, _>(
        GenerateStageJob::JOB_TYPE,
        |job, ctx, deps| async move {
            let processor = SingleShotProcessor::new(deps.generators.clone());
            processor
                .process(job.stage, job.workflow_id, job.input, &ctx)
                .await?;
            Ok(())
        },
    );

    registry.on_exhausted::<GenerateStageJob, _, _>(
        GenerateStageJob::JOB_TYPE,
        |job, deps, error| async move {
            persist_stage_error(&deps, job.stage, job.workflow_id, None, error).await
        },
    );

    registry.register::<GenerateModuleJob, _, _>(
        GenerateModuleJob::JOB_TYPE,
        |job, ctx, deps| async move {
            let generator = deps.generators.module_stage(job.stage)?;
            let chain = ChainOrchestrator::new(
                job.stage,
                deps.workflow_store.clone(),
                generator,
                deps.dispatcher.clone(),
            )?;
            let outcome = chain
                .process(job.workflow_id, job.unit_index, job.user_id)
                .await?;

            if outcome.total_units > 0 {
                let pct = (outcome.units_generated * 100 / outcome.total_units) as i16;
                ctx.report_progress(pct).await;
            }
            Ok(())
        },
    );

    registry.on_exhausted::<GenerateModuleJob, _, _>(
        GenerateModuleJob::JOB_TYPE,
        |job, deps, error| async move {
            persist_stage_error(
                &deps,
                job.stage,
                job.workflow_id,
                Some(job.unit_index as i32),
                error,
            )
            .await
        },
    );
}

/// Persist a terminal failure onto the workflow aggregate so polling
/// clients observe it even though no job remains queued. Best-effort: the
/// runner logs a failure here and moves on.
async fn persist_stage_error(
    deps: &Arc<ServerDeps>,
    stage: Stage,
    workflow_id: WorkflowId,
    unit_index: Option<i32>,
    message: String,
) -> Result<()> {
    let Some(mut workflow) = deps.workflow_store.load(workflow_id).await? else {
        warn!(
            workflow_id = %workflow_id,
            stage = %stage,
            "cannot record terminal failure; workflow missing"
        );
        return Ok(());
    };

    error!(
        workflow_id = %workflow_id,
        stage = %stage,
        unit_index = ?unit_index,
        error = %message,
        "stage generation exhausted its retries"
    );

    workflow.set_last_error(
        stage,
        StageError {
            message,
            unit_index,
            occurred_at: Utc::now(),
        },
    );

    deps.workflow_store.save(&workflow).await
}
