//! Curriculum generation domain.
//!
//! The workflow aggregate, the fixed stage pipeline, and the orchestration
//! pieces that drive it: single-shot stage execution, per-module job
//! chains, and the service facade API handlers call into.

pub mod chain;
pub mod generators;
pub mod jobs;
pub mod models;
pub mod service;
pub mod single_shot;
pub mod stages;
pub mod store;

pub use chain::{ChainError, ChainOrchestrator, ChainOutcome};
pub use service::{ChainDispatch, CurriculumService, StageDispatch};
pub use single_shot::{SingleShotOutcome, SingleShotProcessor};
pub use stages::Stage;
