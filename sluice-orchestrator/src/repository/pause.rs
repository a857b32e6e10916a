//! Pause value repository

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::domain::runtime::PipelinePauseValue;

/// Append-only store of values edited while a task was paused
#[async_trait]
pub trait PauseValueRepository: Send + Sync {
    async fn save(&self, value: PipelinePauseValue) -> Result<()>;

    /// All entries of a build in insertion order
    async fn list(&self, build_id: &str) -> Result<Vec<PipelinePauseValue>>;
}
