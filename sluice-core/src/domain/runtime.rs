//! Per-build runtime state of stages and tasks

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::domain::build::BuildStatus;
use crate::domain::element::ManualReviewParam;

/// Runtime state of one stage of a build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRuntimeState {
    pub build_id: String,
    pub stage_id: String,
    pub status: BuildStatus,
    #[serde(default)]
    pub control_option: StageControlOption,
}

impl StageRuntimeState {
    /// Whether `user_id` may manually start or cancel this stage
    pub fn is_trigger_user(&self, user_id: &str) -> bool {
        self.control_option
            .trigger_users
            .iter()
            .any(|u| u == user_id)
    }
}

/// Manual control options of a stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageControlOption {
    #[serde(default)]
    pub manual_trigger: bool,
    #[serde(default)]
    pub trigger_users: Vec<String>,
    #[serde(default)]
    pub review_params: Vec<ManualReviewParam>,
}

/// Runtime record of one element execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRuntimeState {
    pub build_id: String,
    pub task_id: String,
    pub task_name: String,
    pub stage_id: String,
    pub container_id: String,
    pub status: BuildStatus,
    /// Parameter snapshot of the element; its input lives under `data.input`
    #[serde(default)]
    pub task_params: JsonValue,
    #[serde(default = "first_execution")]
    pub execute_count: u32,
}

fn first_execution() -> u32 {
    1
}

impl TaskRuntimeState {
    /// Input the task was last recorded with
    ///
    /// Returns `None` when the snapshot has no `data.input` object.
    pub fn recorded_input(&self) -> Option<&Map<String, JsonValue>> {
        self.task_params.get("data")?.get("input")?.as_object()
    }
}

/// Delta between an element's default input and what a user edited while the
/// task was paused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelinePauseValue {
    pub build_id: String,
    pub task_id: String,
    /// Serialized element as edited
    pub new_value: String,
    /// Serialized task parameters before the edit
    pub default_value: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
