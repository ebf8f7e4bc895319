//! GenerateStageJob - background job for a single-shot stage.
//!
//! API callers enqueue this job and return immediately with the job key;
//! polling happens against the job status surface.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::curriculum::models::{UserId, WorkflowId};
use crate::domains::curriculum::stages::Stage;
use crate::kernel::jobs::CommandMeta;

/// Job to generate one non-decomposable stage of a workflow.
///
/// # Usage
///
/// ```ignore
/// let job = GenerateStageJob::new(Stage::Syllabus, workflow_id, user_id, None);
/// let dispatched = dispatcher.submit(job).await?;
/// // Returns immediately; the dedup key is "step7-{workflow_id}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateStageJob {
    /// The stage to generate
    pub stage: Stage,
    /// The workflow to generate it for
    pub workflow_id: WorkflowId,
    /// The user requesting generation, if any
    pub user_id: Option<UserId>,
    /// Optional stage-specific input payload
    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

impl GenerateStageJob {
    /// The job type identifier used in the jobs table.
    pub const JOB_TYPE: &'static str = "generate_stage";

    pub fn new(
        stage: Stage,
        workflow_id: WorkflowId,
        user_id: Option<UserId>,
        input: Option<serde_json::Value>,
    ) -> Self {
        Self {
            stage,
            workflow_id,
            user_id,
            input,
        }
    }
}

impl CommandMeta for GenerateStageJob {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    fn job_key(&self) -> Option<String> {
        Some(self.stage.single_shot_job_key(self.workflow_id))
    }

    fn max_retries(&self) -> i32 {
        3
    }

    fn workflow_id(&self) -> Option<Uuid> {
        Some(self.workflow_id.into_uuid())
    }
}
