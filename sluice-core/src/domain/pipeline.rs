//! Pipeline domain types

use serde::{Deserialize, Serialize};

use crate::domain::build::ChannelCode;

/// Pipeline definition summary
///
/// The persisted header of a pipeline; the model itself is fetched by version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInfo {
    pub project_id: String,
    pub pipeline_id: String,
    pub pipeline_name: String,
    /// Current HEAD version of the model
    pub version: i32,
    pub channel: ChannelCode,
    pub creator: String,
    pub last_modify_user: String,
    #[serde(default)]
    pub setting: PipelineSetting,
}

/// Run settings that admission checks consult
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSetting {
    #[serde(default)]
    pub run_lock_type: RunLockType,
    /// Maximum builds allowed to run at once; `None` means unlimited
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunLockType {
    #[default]
    Multiple,
    Single,
    Lock,
}
