//! Lifecycle events handed to the execution runtime

use serde::{Deserialize, Serialize};

/// What the runtime should do with the addressed container or task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Start,
    Refresh,
    Terminate,
}

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    BuildStart(BuildStartEvent),
    BuildContainer(BuildContainerEvent),
    TaskPause(TaskPauseEvent),
}

impl PipelineEvent {
    pub fn build_id(&self) -> &str {
        match self {
            PipelineEvent::BuildStart(e) => &e.build_id,
            PipelineEvent::BuildContainer(e) => &e.build_id,
            PipelineEvent::TaskPause(e) => &e.build_id,
        }
    }
}

/// A new build record was persisted and may be scheduled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStartEvent {
    pub source: String,
    pub project_id: String,
    pub pipeline_id: String,
    pub build_id: String,
    pub user_id: String,
}

/// Container-level instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildContainerEvent {
    pub source: String,
    pub project_id: String,
    pub pipeline_id: String,
    pub user_id: String,
    pub build_id: String,
    pub stage_id: String,
    pub container_id: String,
    pub container_type: String,
    pub action_type: ActionType,
    pub reason: Option<String>,
}

/// Continue or terminate a paused task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPauseEvent {
    pub source: String,
    pub project_id: String,
    pub pipeline_id: String,
    pub build_id: String,
    pub stage_id: String,
    pub container_id: String,
    pub task_id: String,
    pub action_type: ActionType,
    pub user_id: String,
}
