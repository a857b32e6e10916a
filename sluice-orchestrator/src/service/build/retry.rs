//! Retrying finished builds

use std::collections::HashMap;
use tracing::{debug, info};

use sluice_core::domain::element::Element;
use sluice_core::domain::model::PipelineModel;
use sluice_core::domain::runtime::PipelinePauseValue;
use sluice_core::dto::build::{RetryRequest, StartPipelineRequest};

use super::{BuildService, ensure_same_pipeline};
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::repository::Permission;
use crate::service::parameter::{self, RetrySource};

impl BuildService {
    /// Re-runs a finished build as a new build
    ///
    /// The new build executes the model the original build ran, at the
    /// original version, with edits saved while tasks were paused applied.
    /// With `task_id` set the run resumes from that stage, job or task.
    pub async fn retry(&self, request: RetryRequest) -> Result<String> {
        self.validate_permission(
            request.check_permission,
            &request.user_id,
            &request.project_id,
            &request.pipeline_id,
            Permission::Execute,
        )
        .await?;

        let guard = self.locks.acquire_build_lock(&request.build_id).await?;
        let result = self.retry_locked(&request).await;
        guard.release().await;
        result
    }

    async fn retry_locked(&self, request: &RetryRequest) -> Result<String> {
        let build_id = request.build_id.as_str();
        let build = self.build_record(build_id).await?;
        if !build.status.is_finish() {
            return Err(OrchestratorError::conflict(
                ErrorCode::DuplicateRetry,
                format!("build {build_id} is still {:?}", build.status),
            ));
        }
        ensure_same_pipeline(&build, &request.pipeline_id)?;

        let mut model = self.build_model(build_id).await?;
        if !model.can_manual_startup() {
            return Err(OrchestratorError::invalid(
                ErrorCode::ManualStartDenied,
                format!("build {build_id} cannot be started manually"),
            ));
        }

        let vars = self.variables.get_all_variables(build_id).await?;
        let snapshot = self.variables.get_startup_params(build_id).await?;
        let params = parameter::retry_params(
            &RetrySource {
                build_id,
                model: &model,
                vars: &vars,
                snapshot: snapshot.as_deref(),
            },
            request.task_id.as_deref(),
            &request.user_id,
        )?;

        self.apply_pause_values(build_id, &mut model).await?;

        let pipeline = self
            .pipeline_info(&request.project_id, &request.pipeline_id, Some(request.channel))
            .await?;
        let start_type = parameter::retry_start_type(&vars);

        let new_build_id = self
            .start_pipeline(StartPipelineRequest {
                user_id: request.user_id.clone(),
                pipeline,
                start_type,
                params,
                channel: request.channel,
                is_mobile: request.is_mobile,
                model,
                sign_pipeline_version: Some(build.version),
                frequency_limit: true,
                build_no: None,
                start_values: None,
                handle_post: false,
            })
            .await?;

        info!(
            build_id = %build_id,
            new_build_id = %new_build_id,
            task_id = ?request.task_id,
            user_id = %request.user_id,
            "build retried"
        );
        Ok(new_build_id)
    }

    /// Replaces elements with the latest value saved for each paused task
    async fn apply_pause_values(&self, build_id: &str, model: &mut PipelineModel) -> Result<()> {
        let mut latest: HashMap<String, PipelinePauseValue> = HashMap::new();
        for value in self.pause_values.list(build_id).await? {
            match latest.get(&value.task_id) {
                Some(newer) if newer.created_at > value.created_at => {}
                _ => {
                    latest.insert(value.task_id.clone(), value);
                }
            }
        }

        for value in latest.into_values() {
            let element: Element = serde_json::from_str(&value.new_value)?;
            if !model.replace_element(element) {
                debug!(build_id = %build_id, task_id = %value.task_id, "paused element no longer in model");
            }
        }
        Ok(())
    }
}
