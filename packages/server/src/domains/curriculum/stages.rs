//! The fixed curriculum generation pipeline.
//!
//! Stage numbers are part of the wire contract: job dedup keys and
//! persisted step results are keyed by number, so the numbering never
//! changes even if stages are renamed.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::models::WorkflowId;

/// One step in the fixed curriculum-generation sequence.
///
/// Steps 1-9 produce a single document each. Steps 10-12 decompose into one
/// generation per course module and run as self-requeuing job chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Stage {
    CourseBrief = 1,
    AudienceProfile = 2,
    LearningObjectives = 3,
    /// Produces the module breakdown; the module list is frozen once this
    /// stage completes.
    ModulePlan = 4,
    ModuleSequencing = 5,
    AssessmentStrategy = 6,
    Syllabus = 7,
    Glossary = 8,
    CapstoneProject = 9,
    ModuleLessons = 10,
    ModuleAssessments = 11,
    ModuleResources = 12,
}

/// Queue priority for chain jobs (one notch below ad-hoc work at 0).
pub const CHAIN_JOB_PRIORITY: i32 = 1;

#[derive(Debug, Error)]
#[error("unknown stage number: {0}")]
pub struct UnknownStageNumber(pub i32);

impl Stage {
    pub const ALL: [Stage; 12] = [
        Stage::CourseBrief,
        Stage::AudienceProfile,
        Stage::LearningObjectives,
        Stage::ModulePlan,
        Stage::ModuleSequencing,
        Stage::AssessmentStrategy,
        Stage::Syllabus,
        Stage::Glossary,
        Stage::CapstoneProject,
        Stage::ModuleLessons,
        Stage::ModuleAssessments,
        Stage::ModuleResources,
    ];

    /// The stages that decompose into one job per course module.
    pub const MODULE_STAGES: [Stage; 3] = [
        Stage::ModuleLessons,
        Stage::ModuleAssessments,
        Stage::ModuleResources,
    ];

    /// The stage number used in job keys and persisted step results.
    pub fn number(self) -> i32 {
        self as i32
    }

    /// Whether this stage runs as a per-module job chain.
    pub fn is_module_stage(self) -> bool {
        matches!(
            self,
            Stage::ModuleLessons | Stage::ModuleAssessments | Stage::ModuleResources
        )
    }

    /// Stable identifier used in logs and job type metadata.
    pub fn slug(self) -> &'static str {
        match self {
            Stage::CourseBrief => "course_brief",
            Stage::AudienceProfile => "audience_profile",
            Stage::LearningObjectives => "learning_objectives",
            Stage::ModulePlan => "module_plan",
            Stage::ModuleSequencing => "module_sequencing",
            Stage::AssessmentStrategy => "assessment_strategy",
            Stage::Syllabus => "syllabus",
            Stage::Glossary => "glossary",
            Stage::CapstoneProject => "capstone_project",
            Stage::ModuleLessons => "module_lessons",
            Stage::ModuleAssessments => "module_assessments",
            Stage::ModuleResources => "module_resources",
        }
    }

    /// Deterministic dedup key for this stage's single-shot job.
    pub fn single_shot_job_key(self, workflow_id: WorkflowId) -> String {
        format!("step{}-{}", self.number(), workflow_id)
    }

    /// Deterministic dedup key for one unit of this stage's job chain.
    pub fn unit_job_key(self, workflow_id: WorkflowId, unit_index: usize) -> String {
        format!("step{}-{}-unit-{}", self.number(), workflow_id, unit_index)
    }
}

impl From<Stage> for i32 {
    fn from(stage: Stage) -> Self {
        stage.number()
    }
}

impl TryFrom<i32> for Stage {
    type Error = UnknownStageNumber;

    fn try_from(number: i32) -> Result<Self, Self::Error> {
        Stage::ALL
            .into_iter()
            .find(|s| s.number() == number)
            .ok_or(UnknownStageNumber(number))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}
