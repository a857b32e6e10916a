//! Stage repository

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::domain::runtime::{StageControlOption, StageRuntimeState};

/// Repository trait for per-build stage state
#[async_trait]
pub trait StageRepository: Send + Sync {
    async fn get_stage(&self, build_id: &str, stage_id: &str) -> Result<Option<StageRuntimeState>>;

    /// Resumes a paused stage with the given control options
    async fn start_stage(
        &self,
        user_id: &str,
        build_id: &str,
        stage_id: &str,
        control_option: StageControlOption,
    ) -> Result<()>;

    async fn cancel_stage(&self, user_id: &str, build_id: &str, stage_id: &str) -> Result<()>;
}
