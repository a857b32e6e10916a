//! Build repository
//!
//! Build records, their executed models and per-task runtime state.

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::domain::build::{BuildRecord, BuildStatus};
use sluice_core::domain::model::PipelineModel;
use sluice_core::domain::review::ReviewParam;
use sluice_core::domain::runtime::TaskRuntimeState;
use sluice_core::dto::build::StartBuildCommand;

/// Repository trait for builds and their tasks
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Persists a new build and returns its id
    async fn start_build(&self, command: StartBuildCommand) -> Result<String>;

    async fn get_build(&self, build_id: &str) -> Result<Option<BuildRecord>>;

    /// Records for the given ids; unknown ids are skipped
    async fn get_builds(&self, build_ids: &[String]) -> Result<Vec<BuildRecord>>;

    /// Most recently started build whose status is one of `statuses`
    async fn get_latest_build_with_status(
        &self,
        project_id: &str,
        pipeline_id: &str,
        statuses: &[BuildStatus],
    ) -> Result<Option<BuildRecord>>;

    /// Model a build executes, as rewritten at start time
    async fn get_build_model(&self, build_id: &str) -> Result<Option<PipelineModel>>;

    /// Moves a build into a terminal status
    async fn cancel_build(&self, build_id: &str, user_id: &str, status: BuildStatus) -> Result<()>;

    async fn update_cancel_user(&self, build_id: &str, user_id: &str) -> Result<()>;

    async fn update_remark(&self, build_id: &str, remark: Option<String>) -> Result<()>;

    /// Links the sub-pipeline build started by a parent task
    async fn update_task_sub_build_id(&self, build_id: &str, task_id: &str, sub_build_id: &str) -> Result<()>;

    async fn get_task(&self, build_id: &str, task_id: &str) -> Result<Option<TaskRuntimeState>>;

    /// Tasks of a build that are currently running
    async fn get_running_tasks(&self, build_id: &str) -> Result<Vec<TaskRuntimeState>>;

    async fn cancel_task(&self, build_id: &str, task_id: &str, user_id: &str) -> Result<()>;

    /// Forwards a reviewer decision to a manual review task
    async fn manual_deal_task(
        &self,
        build_id: &str,
        task_id: &str,
        user_id: &str,
        review: &ReviewParam,
    ) -> Result<()>;

    /// Number of builds of a pipeline in a running state
    async fn count_running_builds(&self, pipeline_id: &str) -> Result<usize>;
}
