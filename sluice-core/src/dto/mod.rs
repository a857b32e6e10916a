//! Data Transfer Objects
//!
//! Request and view shapes exchanged between the orchestrator, its callers
//! and its collaborators.

pub mod build;
pub mod element;
pub mod pipeline;
