//! Shared primitives used across kernel and domains.

pub mod id;

pub use id::Id;
