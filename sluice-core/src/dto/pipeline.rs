//! Pipeline status DTOs

use serde::{Deserialize, Serialize};

use crate::domain::build::BuildStatus;
use crate::domain::pipeline::RunLockType;

/// Aggregated build summary of one pipeline, as read from storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummaryRow {
    pub project_id: String,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub pipeline_desc: Option<String>,
    pub version: i32,
    pub task_count: i32,
    pub build_num: i32,
    pub can_manual_startup: bool,
    pub creator: String,
    pub create_time: Option<chrono::DateTime<chrono::Utc>>,
    pub update_time: Option<chrono::DateTime<chrono::Utc>>,
    pub run_lock_type: Option<RunLockType>,
    pub finish_count: Option<i64>,
    pub running_count: Option<i64>,
    pub latest_build_id: Option<String>,
    pub latest_status: Option<BuildStatus>,
    pub latest_start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub latest_end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub latest_start_user: Option<String>,
    pub latest_task_name: Option<String>,
}

/// User-facing pipeline entry with its latest build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineView {
    pub project_id: String,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub pipeline_desc: Option<String>,
    pub pipeline_version: i32,
    pub task_count: i32,
    pub build_count: i64,
    pub lock: bool,
    pub can_manual_startup: bool,
    pub latest_build_id: Option<String>,
    pub latest_build_num: i32,
    pub latest_build_status: Option<BuildStatus>,
    pub latest_build_start_time: i64,
    pub latest_build_end_time: i64,
    pub latest_build_task_name: Option<String>,
    pub latest_build_user_id: String,
    pub running_build_count: i64,
    pub has_permission: bool,
    pub has_collect: bool,
    pub creator: String,
    pub create_time: i64,
    pub deployment_time: i64,
}

/// Compact status of a single pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatusView {
    pub task_count: i32,
    pub build_count: i64,
    pub can_manual_startup: bool,
    pub has_collect: bool,
    pub lock: bool,
    pub latest_build_id: Option<String>,
    pub latest_build_num: i32,
    pub latest_build_status: Option<BuildStatus>,
    pub latest_build_start_time: i64,
    pub latest_build_end_time: i64,
    pub latest_build_task_name: Option<String>,
    pub running_build_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineSortType {
    Name,
    CreateTime,
    UpdateTime,
}
