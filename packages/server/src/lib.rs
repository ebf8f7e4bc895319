// Courseforge - Curriculum Generation Core
//
// This crate provides the backend core for multi-stage curriculum
// generation. The hard part is not the content generation (external
// collaborators behind traits) but the background job orchestration that
// drives it: durable queueing with deterministic dedup keys, self-requeuing
// per-module chains, crash-safe resumption derived from the persisted
// aggregate, and a synchronous fallback when no queue is configured.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
