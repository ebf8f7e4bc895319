//! Business domains.

pub mod curriculum;
