//! Kernel module - infrastructure and dependencies.

pub mod bootstrap;
pub mod deps;
pub mod jobs;

pub use bootstrap::{init, Orchestration};
pub use deps::ServerDeps;
