//! Pipeline repository
//!
//! Read access to pipeline headers and versioned models.

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::domain::build::ChannelCode;
use sluice_core::domain::model::PipelineModel;
use sluice_core::domain::pipeline::PipelineInfo;

/// Repository trait for pipeline definitions
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Finds a pipeline header
    ///
    /// When `channel` is given, pipelines of other channels are not returned.
    async fn get_pipeline_info(
        &self,
        project_id: &str,
        pipeline_id: &str,
        channel: Option<ChannelCode>,
    ) -> Result<Option<PipelineInfo>>;

    /// Fetches a model by version, or the HEAD version when `version` is `None`
    async fn get_model(&self, pipeline_id: &str, version: Option<i32>) -> Result<Option<PipelineModel>>;

    /// Current build number counter of a pipeline
    async fn get_build_no(&self, project_id: &str, pipeline_id: &str) -> Result<Option<i32>>;

    async fn update_build_no(&self, pipeline_id: &str, build_no: i32) -> Result<()>;

    /// Template the pipeline was instantiated from, if any
    async fn get_template_id(&self, pipeline_id: &str) -> Result<Option<String>>;
}
