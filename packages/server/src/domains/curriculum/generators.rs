//! Stage generator collaborators.
//!
//! Content generation (prompt construction, LLM calls, persistence of the
//! generated documents) lives outside this crate. The orchestration layer
//! depends only on these traits, and the composition root supplies the
//! implementations at construction time; orchestrators never import
//! generator implementations directly.
//!
//! Generators must be idempotent when invoked redundantly for
//! already-completed work; the orchestrator relies on this only as a
//! belt-and-suspenders guarantee (primary dedup happens on the aggregate).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use super::models::{CourseWorkflow, WorkflowId};
use super::stages::Stage;

/// Generator for a single-shot stage. Produces and persists the stage's
/// output, returning the updated aggregate.
#[async_trait]
pub trait StageGenerator: Send + Sync {
    async fn generate(
        &self,
        workflow_id: WorkflowId,
        input: Option<serde_json::Value>,
    ) -> Result<CourseWorkflow>;
}

/// Generator for one unit of a unit-decomposable stage. Produces and
/// persists the result for the module at `unit_index` in the module plan,
/// returning the updated aggregate.
#[async_trait]
pub trait ModuleStageGenerator: Send + Sync {
    async fn generate_unit(
        &self,
        workflow_id: WorkflowId,
        unit_index: usize,
    ) -> Result<CourseWorkflow>;
}

/// Dispatching to a stage with no registered generator is a wiring bug, not
/// a transient fault; these errors are never retried.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("no generator registered for stage {0}")]
    UnknownStage(Stage),
    #[error("stage {0} is not module-decomposable")]
    NotAModuleStage(Stage),
    #[error("stage {0} is module-decomposable and has no single-shot generator")]
    NotASingleShotStage(Stage),
}

/// Static table mapping stage numbers to their generator functions.
///
/// Built once by the composition root; the single-shot dispatcher and the
/// chain orchestrators look generators up here by stage.
#[derive(Default)]
pub struct GeneratorSet {
    single_shot: HashMap<Stage, Arc<dyn StageGenerator>>,
    per_module: HashMap<Stage, Arc<dyn ModuleStageGenerator>>,
}

impl GeneratorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-shot stage generator.
    ///
    /// # Panics
    ///
    /// Panics when `stage` is module-decomposable; that is a wiring mistake
    /// caught at startup.
    pub fn with_stage(mut self, stage: Stage, generator: Arc<dyn StageGenerator>) -> Self {
        assert!(
            !stage.is_module_stage(),
            "stage {} requires a module generator",
            stage
        );
        self.single_shot.insert(stage, generator);
        self
    }

    /// Register a per-module stage generator.
    ///
    /// # Panics
    ///
    /// Panics when `stage` is single-shot; that is a wiring mistake caught
    /// at startup.
    pub fn with_module_stage(
        mut self,
        stage: Stage,
        generator: Arc<dyn ModuleStageGenerator>,
    ) -> Self {
        assert!(
            stage.is_module_stage(),
            "stage {} is single-shot",
            stage
        );
        self.per_module.insert(stage, generator);
        self
    }

    /// Look up the generator for a single-shot stage.
    pub fn single_shot(&self, stage: Stage) -> Result<Arc<dyn StageGenerator>, GeneratorError> {
        if stage.is_module_stage() {
            return Err(GeneratorError::NotASingleShotStage(stage));
        }
        self.single_shot
            .get(&stage)
            .cloned()
            .ok_or(GeneratorError::UnknownStage(stage))
    }

    /// Look up the generator for a module-decomposable stage.
    pub fn module_stage(
        &self,
        stage: Stage,
    ) -> Result<Arc<dyn ModuleStageGenerator>, GeneratorError> {
        if !stage.is_module_stage() {
            return Err(GeneratorError::NotAModuleStage(stage));
        }
        self.per_module
            .get(&stage)
            .cloned()
            .ok_or(GeneratorError::UnknownStage(stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopGenerator;

    #[async_trait]
    impl StageGenerator for NoopGenerator {
        async fn generate(
            &self,
            _workflow_id: WorkflowId,
            _input: Option<serde_json::Value>,
        ) -> Result<CourseWorkflow> {
            Ok(CourseWorkflow::new(None))
        }
    }

    #[async_trait]
    impl ModuleStageGenerator for NoopGenerator {
        async fn generate_unit(
            &self,
            _workflow_id: WorkflowId,
            _unit_index: usize,
        ) -> Result<CourseWorkflow> {
            Ok(CourseWorkflow::new(None))
        }
    }

    #[test]
    fn lookup_succeeds_for_registered_stage() {
        let set = GeneratorSet::new()
            .with_stage(Stage::Syllabus, Arc::new(NoopGenerator))
            .with_module_stage(Stage::ModuleLessons, Arc::new(NoopGenerator));

        assert!(set.single_shot(Stage::Syllabus).is_ok());
        assert!(set.module_stage(Stage::ModuleLessons).is_ok());
    }

    #[test]
    fn unknown_stage_is_an_error() {
        let set = GeneratorSet::new();
        assert!(matches!(
            set.single_shot(Stage::Glossary),
            Err(GeneratorError::UnknownStage(Stage::Glossary))
        ));
    }

    #[test]
    fn stage_kind_mismatch_is_an_error() {
        let set = GeneratorSet::new()
            .with_stage(Stage::Syllabus, Arc::new(NoopGenerator))
            .with_module_stage(Stage::ModuleLessons, Arc::new(NoopGenerator));

        assert!(matches!(
            set.single_shot(Stage::ModuleLessons),
            Err(GeneratorError::NotASingleShotStage(Stage::ModuleLessons))
        ));
        assert!(matches!(
            set.module_stage(Stage::Syllabus),
            Err(GeneratorError::NotAModuleStage(Stage::Syllabus))
        ));
    }

    #[test]
    #[should_panic(expected = "requires a module generator")]
    fn registering_module_stage_as_single_shot_panics() {
        let _ = GeneratorSet::new().with_stage(Stage::ModuleLessons, Arc::new(NoopGenerator));
    }
}
