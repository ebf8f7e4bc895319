//! Curriculum domain models.

mod workflow;

pub use workflow::{
    CourseModule, CourseWorkflow, ModuleId, ModuleResult, StageError, StepProgress, StepStatus,
    User, UserId, WorkflowError, WorkflowId, WorkflowStatus,
};
