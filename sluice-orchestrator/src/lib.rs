//! Sluice Orchestrator
//!
//! Build orchestration engine: admits, retries, stops and resumes pipeline
//! builds on top of pluggable storage, permission, messaging and log
//! collaborators.
//!
//! This crate contains:
//! - Repository traits for every collaborator, with in-memory implementations
//! - The build service and the helpers it drives: parameter resolution,
//!   model rewriting, admission interceptors, distributed locks
//! - Status projection of pipeline summaries
//! - Configuration, errors and tracing setup

pub mod config;
pub mod error;
pub mod repository;
pub mod service;
pub mod telemetry;

pub use config::OrchestratorConfig;
pub use error::{ErrorCode, OrchestratorError, Result};
pub use service::{BuildService, Collaborators};
