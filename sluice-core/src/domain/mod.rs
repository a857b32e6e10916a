//! Core domain types
//!
//! This module contains the domain structures shared by the orchestrator and
//! the collaborators it drives. They represent pipelines, their models, builds
//! and the runtime state of stages and tasks.

pub mod build;
pub mod element;
pub mod event;
pub mod model;
pub mod param;
pub mod pipeline;
pub mod quality;
pub mod review;
pub mod runtime;
