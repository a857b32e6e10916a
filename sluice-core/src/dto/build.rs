//! Build DTOs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::build::{BuildRecord, BuildStatus, ChannelCode, StartType};
use crate::domain::element::Element;
use crate::domain::model::{BuildNo, PipelineModel};
use crate::domain::param::{BuildFormProperty, BuildParameters};
use crate::domain::pipeline::PipelineInfo;

/// Form shown before a manual start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildManualStartupInfo {
    pub can_manual_startup: bool,
    pub can_element_skip: bool,
    pub properties: Vec<BuildFormProperty>,
    pub build_no: Option<BuildNo>,
}

/// Request to start a pipeline manually or remotely
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualStartRequest {
    pub user_id: String,
    pub start_type: StartType,
    pub project_id: String,
    pub pipeline_id: String,
    /// Form values keyed by parameter id; skip flags travel here too
    pub values: HashMap<String, String>,
    pub channel: ChannelCode,
    #[serde(default = "default_true")]
    pub check_permission: bool,
    #[serde(default)]
    pub is_mobile: bool,
    #[serde(default)]
    pub build_no: Option<i32>,
    #[serde(default = "default_true")]
    pub frequency_limit: bool,
}

/// Request to retry a finished build, fully or from a stage/job/task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    pub user_id: String,
    pub project_id: String,
    pub pipeline_id: String,
    pub build_id: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub is_mobile: bool,
    #[serde(default)]
    pub channel: ChannelCode,
    #[serde(default = "default_true")]
    pub check_permission: bool,
}

/// Request from a parent build to start a sub-pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubPipelineStartRequest {
    pub user_id: String,
    pub start_type: StartType,
    pub project_id: String,
    pub parent_pipeline_id: String,
    pub parent_build_id: String,
    pub parent_task_id: String,
    pub pipeline_id: String,
    pub channel: ChannelCode,
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub check_permission: bool,
    #[serde(default)]
    pub is_mobile: bool,
    #[serde(default)]
    pub trigger_user: Option<String>,
}

/// Continue or terminate a paused task, possibly with an edited element
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseAtomRequest {
    pub user_id: String,
    pub project_id: String,
    pub pipeline_id: String,
    pub build_id: String,
    pub stage_id: String,
    pub container_id: String,
    pub task_id: String,
    pub is_continue: bool,
    pub element: Element,
    #[serde(default = "default_true")]
    pub check_permission: bool,
}

/// Everything needed to admit and persist one build
#[derive(Debug, Clone)]
pub struct StartPipelineRequest {
    pub user_id: String,
    pub pipeline: PipelineInfo,
    pub start_type: StartType,
    pub params: BuildParameters,
    pub channel: ChannelCode,
    pub is_mobile: bool,
    pub model: PipelineModel,
    /// Pins the executed model version; retries pass the original version
    pub sign_pipeline_version: Option<i32>,
    pub frequency_limit: bool,
    pub build_no: Option<i32>,
    /// Raw start values, consulted for element skip flags
    pub start_values: Option<HashMap<String, String>>,
    pub handle_post: bool,
}

/// Command handed to the build repository to persist a new build
#[derive(Debug, Clone)]
pub struct StartBuildCommand {
    pub pipeline: PipelineInfo,
    pub model: PipelineModel,
    pub params: BuildParameters,
    pub start_type: StartType,
    pub channel: ChannelCode,
    pub start_user: String,
    pub build_no: Option<i32>,
    pub parent_build_id: Option<String>,
    pub parent_task_id: Option<String>,
    pub retry_count: u32,
}

/// Build history entry together with its runtime variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildHistoryWithVars {
    #[serde(flatten)]
    pub build: BuildRecord,
    pub variables: HashMap<String, String>,
}

/// Outcome reported by a worker when its process exits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Filter on build statuses when looking up history
pub type StatusFilter = Vec<BuildStatus>;

fn default_true() -> bool {
    true
}
