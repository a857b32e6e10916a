//! Continuing or terminating paused tasks

use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use sluice_core::domain::build::BuildStatus;
use sluice_core::domain::event::{ActionType, PipelineEvent, TaskPauseEvent};
use sluice_core::domain::runtime::PipelinePauseValue;
use sluice_core::dto::build::PauseAtomRequest;

use super::BuildService;
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::repository::Permission;

/// Input keys whose edited value differs from the recorded one
fn changed_inputs(recorded: Option<&Map<String, JsonValue>>, edited: &Map<String, JsonValue>) -> Vec<(String, String, String)> {
    edited
        .iter()
        .filter_map(|(key, new)| {
            let old = recorded.and_then(|input| input.get(key));
            let before = render(old);
            let after = render(Some(new));
            (before != after).then(|| (key.clone(), before, after))
        })
        .collect()
}

fn render(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

impl BuildService {
    /// Resumes or terminates a paused task
    ///
    /// Input edits are diffed against what the task was recorded with; each
    /// change is printed to the build log and the edited element is saved so
    /// retries of this build pick it up. Runs under the build lock.
    pub async fn execute_pause_atom(&self, request: PauseAtomRequest) -> Result<()> {
        self.validate_permission(
            request.check_permission,
            &request.user_id,
            &request.project_id,
            &request.pipeline_id,
            Permission::Execute,
        )
        .await?;

        let element_json = serde_json::to_string(&request.element)?;
        if element_json.len() > self.config.max_element_bytes {
            return Err(OrchestratorError::invalid(
                ErrorCode::ElementTooLarge,
                format!(
                    "element is {} bytes, limit is {}",
                    element_json.len(),
                    self.config.max_element_bytes
                ),
            ));
        }

        let guard = self.locks.acquire_build_lock(&request.build_id).await?;
        let result = self.pause_atom_locked(request, element_json).await;
        guard.release().await;
        result
    }

    async fn pause_atom_locked(&self, request: PauseAtomRequest, element_json: String) -> Result<()> {
        let PauseAtomRequest {
            user_id,
            project_id,
            pipeline_id,
            build_id,
            stage_id,
            container_id,
            task_id,
            is_continue,
            element,
            ..
        } = request;

        self.pipeline_build(&pipeline_id, &build_id).await?;
        let task = match self.builds.get_task(&build_id, &task_id).await? {
            Some(task) if task.status == BuildStatus::Pause => task,
            other => {
                return Err(OrchestratorError::conflict(
                    ErrorCode::TaskNotPaused,
                    format!(
                        "task {task_id} is {}",
                        other.map_or("missing".to_string(), |t| format!("{:?}", t.status))
                    ),
                ));
            }
        };

        let changes = changed_inputs(task.recorded_input(), &element.input());
        // Lines belong to the job the task actually ran in
        let job_id = format!("startVM-{}", task.container_id);
        for (key, before, after) in &changes {
            for line in [
                format!("plugin: {}, params {key} updated:", task.task_name),
                format!("before: {before}"),
                format!("after: {after}"),
            ] {
                self.print_line(&build_id, &line, &task_id, &job_id, 1).await;
            }
        }

        if !changes.is_empty() {
            self.pause_values
                .save(PipelinePauseValue {
                    build_id: build_id.clone(),
                    task_id: task_id.clone(),
                    new_value: element_json,
                    default_value: serde_json::to_string(&task.task_params)?,
                    created_at: chrono::Utc::now(),
                })
                .await?;
        }

        let action_type = if is_continue {
            ActionType::Refresh
        } else {
            ActionType::Terminate
        };
        let event = PipelineEvent::TaskPause(TaskPauseEvent {
            source: "PauseTaskExecute".to_string(),
            project_id,
            pipeline_id,
            build_id: build_id.clone(),
            stage_id,
            container_id,
            task_id: task_id.clone(),
            action_type,
            user_id: user_id.clone(),
        });
        if let Err(err) = self.events.dispatch(event).await {
            warn!(build_id = %build_id, task_id = %task_id, error = %err, "failed to dispatch task pause event");
        }

        info!(
            build_id = %build_id,
            task_id = %task_id,
            user_id = %user_id,
            is_continue,
            changed = changes.len(),
            "paused task handled"
        );
        Ok(())
    }
}
