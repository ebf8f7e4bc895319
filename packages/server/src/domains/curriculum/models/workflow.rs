//! The course workflow aggregate.
//!
//! One aggregate per curriculum project. Stage generators and approval
//! actions are the only writers; the orchestration layer reads it to derive
//! chain progress and writes only `last_error` (via the exhausted-retries
//! hook).
//!
//! Per-module results are keyed by stable module id, never by array
//! position. Under retries or concurrent duplicate enqueues a result list
//! may contain more than one record for the same module, so every
//! completion computation dedups by id first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::common::id::Id;

use super::super::stages::Stage;

/// Marker for user ids (accounts live in an external system).
pub struct User;

pub type WorkflowId = Id<CourseWorkflow>;
pub type ModuleId = Id<CourseModule>;
pub type UserId = Id<User>;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "workflow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Generating,
    Generated,
    Approved,
}

// ============================================================================
// Value objects
// ============================================================================

/// Per-step generation progress, ordered by step number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepProgress {
    pub step: i32,
    pub status: StepStatus,
}

/// A curriculum module. The module list is produced by the module-plan
/// stage and frozen afterwards; the orchestration layer only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseModule {
    pub id: ModuleId,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub position: i32,
}

/// One generated result for one module of a unit-decomposable stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleResult {
    pub module_id: ModuleId,
    pub content: serde_json::Value,
    pub generated_at: DateTime<Utc>,
}

impl ModuleResult {
    pub fn new(module_id: ModuleId, content: serde_json::Value) -> Self {
        Self {
            module_id,
            content,
            generated_at: Utc::now(),
        }
    }
}

/// Terminal failure surfaced to polling clients after retries exhaust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub message: String,
    #[serde(default)]
    pub unit_index: Option<i32>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("step {0} has not been generated yet")]
    StepNotGenerated(i32),
}

// ============================================================================
// Aggregate
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseWorkflow {
    pub id: WorkflowId,
    pub user_id: Option<UserId>,
    pub status: WorkflowStatus,
    /// The step the project is currently working through (1-based).
    pub current_step: i32,
    pub step_progress: Vec<StepProgress>,
    /// Frozen once the module-plan stage completes.
    pub modules: Vec<CourseModule>,
    /// Per-stage result lists, keyed by stage number. Append-only.
    pub step_results: BTreeMap<i32, Vec<ModuleResult>>,
    /// Last terminal failure per stage number.
    pub last_error: BTreeMap<i32, StageError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CourseWorkflow {
    /// Create a fresh workflow with every step pending.
    pub fn new(user_id: Option<UserId>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            user_id,
            status: WorkflowStatus::Draft,
            current_step: 1,
            step_progress: Stage::ALL
                .iter()
                .map(|stage| StepProgress {
                    step: stage.number(),
                    status: StepStatus::Pending,
                })
                .collect(),
            modules: Vec::new(),
            step_results: BTreeMap::new(),
            last_error: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step_status(&self, stage: Stage) -> StepStatus {
        self.step_progress
            .iter()
            .find(|p| p.step == stage.number())
            .map(|p| p.status)
            .unwrap_or_default()
    }

    pub fn set_step_status(&mut self, stage: Stage, status: StepStatus) {
        match self
            .step_progress
            .iter_mut()
            .find(|p| p.step == stage.number())
        {
            Some(progress) => progress.status = status,
            None => self.step_progress.push(StepProgress {
                step: stage.number(),
                status,
            }),
        }
        self.touch();
    }

    /// The raw result list for a stage. May contain duplicate records for
    /// the same module under retry; callers must not treat its length as a
    /// completion count.
    pub fn module_results(&self, stage: Stage) -> &[ModuleResult] {
        self.step_results
            .get(&stage.number())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Distinct module ids with a persisted result for this stage.
    ///
    /// This is the only sound way to count completions: duplicate appends
    /// collapse here instead of inflating an array-length count.
    pub fn completed_module_ids(&self, stage: Stage) -> HashSet<ModuleId> {
        self.module_results(stage)
            .iter()
            .map(|r| r.module_id)
            .collect()
    }

    /// The first module (in plan order) without a result for this stage.
    /// `None` means the stage is fully complete.
    pub fn first_missing_module(&self, stage: Stage) -> Option<(usize, &CourseModule)> {
        let completed = self.completed_module_ids(stage);
        self.modules
            .iter()
            .enumerate()
            .find(|(_, module)| !completed.contains(&module.id))
    }

    /// A completed module id that is no longer in the module list, if any.
    /// Indicates the list shrank after the chain started, which the design
    /// forbids.
    pub fn stale_completed_module(&self, stage: Stage) -> Option<ModuleId> {
        let live: HashSet<ModuleId> = self.modules.iter().map(|m| m.id).collect();
        self.completed_module_ids(stage)
            .into_iter()
            .find(|id| !live.contains(id))
    }

    /// Append a module result. Append-only by design: concurrent duplicate
    /// appends are repaired at read time by [`completed_module_ids`].
    ///
    /// [`completed_module_ids`]: CourseWorkflow::completed_module_ids
    pub fn add_module_result(&mut self, stage: Stage, result: ModuleResult) {
        self.step_results
            .entry(stage.number())
            .or_default()
            .push(result);
        self.touch();
    }

    pub fn last_error_for(&self, stage: Stage) -> Option<&StageError> {
        self.last_error.get(&stage.number())
    }

    pub fn set_last_error(&mut self, stage: Stage, error: StageError) {
        self.last_error.insert(stage.number(), error);
        self.touch();
    }

    pub fn clear_last_error(&mut self, stage: Stage) {
        self.last_error.remove(&stage.number());
        self.touch();
    }

    /// Approve a generated step and advance the current step pointer.
    pub fn approve_step(&mut self, stage: Stage) -> Result<(), WorkflowError> {
        if self.step_status(stage) != StepStatus::Generated {
            return Err(WorkflowError::StepNotGenerated(stage.number()));
        }

        self.set_step_status(stage, StepStatus::Approved);
        self.current_step = (stage.number() + 1).min(Stage::ALL.len() as i32);

        if stage.number() == Stage::ALL.len() as i32 {
            self.status = WorkflowStatus::Complete;
        }
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow_with_modules(titles: &[&str]) -> CourseWorkflow {
        let mut workflow = CourseWorkflow::new(None);
        workflow.modules = titles
            .iter()
            .enumerate()
            .map(|(i, title)| CourseModule {
                id: ModuleId::new(),
                title: title.to_string(),
                summary: None,
                position: i as i32,
            })
            .collect();
        workflow
    }

    #[test]
    fn new_workflow_has_all_steps_pending() {
        let workflow = CourseWorkflow::new(None);
        assert_eq!(workflow.step_progress.len(), 12);
        assert!(workflow
            .step_progress
            .iter()
            .all(|p| p.status == StepStatus::Pending));
        assert_eq!(workflow.current_step, 1);
    }

    #[test]
    fn completed_ids_dedup_duplicate_records() {
        let mut workflow = workflow_with_modules(&["Intro", "Basics", "Advanced"]);
        let first = workflow.modules[0].id;

        // Simulate a double-write for the same module
        workflow.add_module_result(
            Stage::ModuleLessons,
            ModuleResult::new(first, serde_json::json!({"lesson": 1})),
        );
        workflow.add_module_result(
            Stage::ModuleLessons,
            ModuleResult::new(first, serde_json::json!({"lesson": 1})),
        );

        assert_eq!(workflow.module_results(Stage::ModuleLessons).len(), 2);
        assert_eq!(workflow.completed_module_ids(Stage::ModuleLessons).len(), 1);
    }

    #[test]
    fn first_missing_module_skips_duplicated_completion() {
        let mut workflow = workflow_with_modules(&["Intro", "Basics", "Advanced"]);
        let first = workflow.modules[0].id;

        workflow.add_module_result(
            Stage::ModuleLessons,
            ModuleResult::new(first, serde_json::Value::Null),
        );
        workflow.add_module_result(
            Stage::ModuleLessons,
            ModuleResult::new(first, serde_json::Value::Null),
        );

        let (index, module) = workflow
            .first_missing_module(Stage::ModuleLessons)
            .expect("second module should be missing");
        assert_eq!(index, 1);
        assert_eq!(module.title, "Basics");
    }

    #[test]
    fn fully_completed_stage_has_no_missing_module() {
        let mut workflow = workflow_with_modules(&["Intro", "Basics"]);
        for module_id in workflow.modules.iter().map(|m| m.id).collect::<Vec<_>>() {
            workflow.add_module_result(
                Stage::ModuleResources,
                ModuleResult::new(module_id, serde_json::Value::Null),
            );
        }

        assert!(workflow
            .first_missing_module(Stage::ModuleResources)
            .is_none());
    }

    #[test]
    fn stale_completed_module_detects_shrunk_plan() {
        let mut workflow = workflow_with_modules(&["Intro", "Basics"]);
        let removed = ModuleId::new();
        workflow.add_module_result(
            Stage::ModuleLessons,
            ModuleResult::new(removed, serde_json::Value::Null),
        );

        assert_eq!(
            workflow.stale_completed_module(Stage::ModuleLessons),
            Some(removed)
        );
    }

    #[test]
    fn approve_requires_generated_step() {
        let mut workflow = CourseWorkflow::new(None);
        assert!(workflow.approve_step(Stage::CourseBrief).is_err());

        workflow.set_step_status(Stage::CourseBrief, StepStatus::Generated);
        workflow.approve_step(Stage::CourseBrief).unwrap();
        assert_eq!(workflow.step_status(Stage::CourseBrief), StepStatus::Approved);
        assert_eq!(workflow.current_step, 2);
    }

    #[test]
    fn approving_final_step_completes_workflow() {
        let mut workflow = CourseWorkflow::new(None);
        workflow.set_step_status(Stage::ModuleResources, StepStatus::Generated);
        workflow.approve_step(Stage::ModuleResources).unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Complete);
        assert_eq!(workflow.current_step, 12);
    }

    #[test]
    fn last_error_roundtrip() {
        let mut workflow = CourseWorkflow::new(None);
        workflow.set_last_error(
            Stage::ModuleLessons,
            StageError {
                message: "provider timeout".to_string(),
                unit_index: Some(1),
                occurred_at: Utc::now(),
            },
        );

        let error = workflow.last_error_for(Stage::ModuleLessons).unwrap();
        assert_eq!(error.unit_index, Some(1));

        workflow.clear_last_error(Stage::ModuleLessons);
        assert!(workflow.last_error_for(Stage::ModuleLessons).is_none());
    }
}
