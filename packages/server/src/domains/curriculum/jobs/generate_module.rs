//! GenerateModuleJob - one link of a module-stage job chain.
//!
//! Each execution generates one module's result and, when more modules
//! remain, enqueues the job for the next one. The deterministic dedup key
//! guarantees at most one live job per (workflow, stage, unit) triple, so
//! concurrent duplicate submissions collapse at the queue.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::curriculum::models::{UserId, WorkflowId};
use crate::domains::curriculum::stages::{Stage, CHAIN_JOB_PRIORITY};
use crate::kernel::jobs::CommandMeta;

/// Job to generate one module unit of a module-decomposable stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateModuleJob {
    /// The module-decomposable stage
    pub stage: Stage,
    /// The workflow to generate for
    pub workflow_id: WorkflowId,
    /// Index into the module plan this job was enqueued for
    pub unit_index: usize,
    /// The user who triggered the chain, carried through every link
    pub user_id: Option<UserId>,
}

impl GenerateModuleJob {
    /// The job type identifier used in the jobs table.
    pub const JOB_TYPE: &'static str = "generate_module_unit";

    pub fn new(
        stage: Stage,
        workflow_id: WorkflowId,
        unit_index: usize,
        user_id: Option<UserId>,
    ) -> Self {
        Self {
            stage,
            workflow_id,
            unit_index,
            user_id,
        }
    }
}

impl CommandMeta for GenerateModuleJob {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    fn job_key(&self) -> Option<String> {
        Some(self.stage.unit_job_key(self.workflow_id, self.unit_index))
    }

    fn priority(&self) -> i32 {
        CHAIN_JOB_PRIORITY
    }

    fn max_retries(&self) -> i32 {
        3
    }

    fn workflow_id(&self) -> Option<Uuid> {
        Some(self.workflow_id.into_uuid())
    }
}
