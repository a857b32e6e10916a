//! Sluice Core
//!
//! Core types for the Sluice build orchestrator.
//!
//! This crate contains:
//! - Domain types: pipeline models, build records, parameters, runtime state
//! - DTOs: request and view shapes exchanged with callers and collaborators

pub mod domain;
pub mod dto;
