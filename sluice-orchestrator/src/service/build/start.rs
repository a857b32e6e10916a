//! Admission of new builds

use std::collections::HashMap;
use tracing::{debug, info, warn};

use sluice_core::domain::build::StartType;
use sluice_core::domain::event::{BuildStartEvent, PipelineEvent};
use sluice_core::domain::param::{BuildParameter, BuildParameters, Provenance, keys};
use sluice_core::domain::quality::QualityRuleSet;
use sluice_core::dto::build::{
    ManualStartRequest, StartBuildCommand, StartPipelineRequest, SubPipelineStartRequest,
};

use super::BuildService;
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::repository::Permission;
use crate::service::interceptor::InterceptData;
use crate::service::parameter::{self, SystemParams};

impl BuildService {
    /// Admits and persists one build
    ///
    /// Unless the channel is exempt, a frequency-limited start holds the
    /// pipeline lock for the whole admission and is rejected when another
    /// start already holds it.
    pub async fn start_pipeline(&self, request: StartPipelineRequest) -> Result<String> {
        let guard = if request.frequency_limit && !self.config.is_exempt(request.channel) {
            let pipeline_id = &request.pipeline.pipeline_id;
            match self.locks.try_acquire_pipeline_lock(pipeline_id).await? {
                Some(guard) => Some(guard),
                None => {
                    warn!(pipeline_id = %pipeline_id, "start rejected, pipeline is being started");
                    return Err(OrchestratorError::FrequencyLimited {
                        pipeline_id: pipeline_id.clone(),
                    });
                }
            }
        } else {
            None
        };

        let result = self.admit(request).await;
        if let Some(guard) = guard {
            guard.release().await;
        }
        result
    }

    async fn admit(&self, request: StartPipelineRequest) -> Result<String> {
        let StartPipelineRequest {
            user_id,
            mut pipeline,
            start_type,
            mut params,
            channel,
            is_mobile,
            model,
            sign_pipeline_version,
            build_no,
            start_values,
            handle_post,
            ..
        } = request;

        model
            .validate()
            .map_err(|e| OrchestratorError::invalid(ErrorCode::InvalidModel, e.to_string()))?;

        if let Some(version) = sign_pipeline_version {
            pipeline.version = version;
        }

        let template_id = if model.instance_from_template {
            self.pipelines.get_template_id(&pipeline.pipeline_id).await?
        } else {
            None
        };
        let matches = self
            .quality
            .match_rules(&pipeline.project_id, &pipeline.pipeline_id, template_id.as_deref())
            .await?;
        let quality = QualityRuleSet::from_matches(&matches);

        let model = self
            .rewriter
            .rewrite(
                &pipeline.project_id,
                &model,
                &mut params,
                &quality,
                start_values.as_ref(),
                handle_post,
            )
            .await?;

        let verdict = self
            .interceptors
            .filter(&InterceptData {
                pipeline: &pipeline,
                model: Some(&model),
                start_type,
            })
            .await?;
        if !verdict.is_ok() {
            return Err(OrchestratorError::AdmissionRejected {
                status: verdict.status,
                message: verdict.message,
            });
        }

        // Delegated starts run as the user who caused them
        let delegated = match start_type {
            StartType::Pipeline => params.value_of(keys::PIPELINE_START_PIPELINE_USER_ID),
            StartType::WebHook => params.value_of(keys::PIPELINE_START_WEBHOOK_USER_ID),
            _ => None,
        };
        let start_user = delegated
            .filter(|user| !user.trim().is_empty())
            .unwrap_or_else(|| user_id.clone());

        let build_msg = parameter::effective_build_msg(
            params.value_of(keys::PIPELINE_BUILD_MSG).as_deref(),
            start_type,
            channel,
        );
        if let Some(no) = build_no {
            params.insert(BuildParameter::new(keys::BUILD_NO, i64::from(no), Provenance::System));
        }
        SystemParams {
            pipeline: &pipeline,
            user_id: &user_id,
            start_user_name: &start_user,
            start_type,
            channel,
            is_mobile,
            build_msg,
        }
        .apply(&mut params);

        let parent_build_id = params.value_of(keys::PIPELINE_START_PARENT_BUILD_ID);
        let parent_task_id = params.value_of(keys::PIPELINE_START_PARENT_BUILD_TASK_ID);
        let retry_count = params
            .value_of(keys::PIPELINE_RETRY_COUNT)
            .and_then(|count| count.trim().parse::<u32>().ok())
            .unwrap_or(0);

        let snapshot = parameter::startup_snapshot(&model, &params)?;
        let project_id = pipeline.project_id.clone();
        let pipeline_id = pipeline.pipeline_id.clone();

        let build_id = self
            .builds
            .start_build(StartBuildCommand {
                pipeline,
                model,
                params,
                start_type,
                channel,
                start_user: start_user.clone(),
                build_no,
                parent_build_id,
                parent_task_id,
                retry_count,
            })
            .await?;
        self.variables.save_startup_params(&build_id, snapshot).await?;
        self.variables.init_build_parameters(&build_id).await?;

        info!(
            project_id = %project_id,
            pipeline_id = %pipeline_id,
            build_id = %build_id,
            start_type = %start_type,
            start_user = %start_user,
            "build started"
        );

        let event = PipelineEvent::BuildStart(BuildStartEvent {
            source: "start_pipeline".to_string(),
            project_id,
            pipeline_id,
            build_id: build_id.clone(),
            user_id: start_user,
        });
        if let Err(err) = self.events.dispatch(event).await {
            warn!(build_id = %build_id, error = %err, "failed to dispatch build start event");
        }

        Ok(build_id)
    }

    /// Manual or remote start from the startup form
    pub async fn build_manual_startup(&self, request: ManualStartRequest) -> Result<String> {
        let ManualStartRequest {
            user_id,
            start_type,
            project_id,
            pipeline_id,
            values,
            channel,
            check_permission,
            is_mobile,
            build_no,
            frequency_limit,
        } = request;

        self.validate_permission(check_permission, &user_id, &project_id, &pipeline_id, Permission::Execute)
            .await?;
        let pipeline = self.pipeline_info(&project_id, &pipeline_id, Some(channel)).await?;
        let model = self.model_version(&pipeline_id, None).await?;

        if start_type == StartType::Remote {
            if !model.can_remote_startup() {
                return Err(OrchestratorError::invalid(
                    ErrorCode::RemoteStartDenied,
                    format!("pipeline {pipeline_id} has no enabled remote trigger"),
                ));
            }
        } else if !model.can_manual_startup() {
            return Err(OrchestratorError::invalid(
                ErrorCode::ManualStartDenied,
                format!("pipeline {pipeline_id} has no enabled manual trigger"),
            ));
        }

        // Only pipelines that declare a build number accept one
        if let Some(no) = build_no {
            if model.trigger().is_some_and(|t| t.build_no.is_some()) {
                self.pipelines.update_build_no(&pipeline_id, no).await?;
                debug!(pipeline_id = %pipeline_id, build_no = no, "build number updated");
            }
        }

        let params = parameter::parse_manual_start_params(&model, &values);

        self.start_pipeline(StartPipelineRequest {
            user_id,
            pipeline,
            start_type,
            params,
            channel,
            is_mobile,
            model,
            sign_pipeline_version: None,
            frequency_limit,
            build_no,
            start_values: Some(values),
            handle_post: true,
        })
        .await
    }

    /// Starts a sub-pipeline on behalf of a parent build's task
    ///
    /// The new build id is linked back onto the parent task.
    pub async fn subpipeline_startup(&self, request: SubPipelineStartRequest) -> Result<String> {
        self.validate_permission(
            request.check_permission,
            &request.user_id,
            &request.project_id,
            &request.pipeline_id,
            Permission::Execute,
        )
        .await?;
        let pipeline = self
            .pipeline_info(&request.project_id, &request.pipeline_id, Some(request.channel))
            .await?;
        let model = self
            .model_version(&request.pipeline_id, Some(pipeline.version))
            .await?;

        let trigger_user = request
            .trigger_user
            .clone()
            .unwrap_or_else(|| request.user_id.clone());
        let mut inputs = BuildParameters::new();
        for (key, value) in [
            (keys::PIPELINE_START_PIPELINE_USER_ID, trigger_user),
            (keys::PIPELINE_START_PARENT_PIPELINE_ID, request.parent_pipeline_id.clone()),
            (keys::PIPELINE_START_PARENT_BUILD_ID, request.parent_build_id.clone()),
            (keys::PIPELINE_START_PARENT_BUILD_TASK_ID, request.parent_task_id.clone()),
        ] {
            inputs.insert(BuildParameter::new(key, value, Provenance::System));
        }
        for (key, value) in &request.parameters {
            inputs.insert(BuildParameter::new(
                key.clone(),
                parameter::json_to_param(value.clone()),
                Provenance::Manual,
            ));
        }
        let params = parameter::merge_with_defaults(&model, inputs);

        let user_id = pipeline.last_modify_user.clone();
        let sub_build_id = self
            .start_pipeline(StartPipelineRequest {
                user_id,
                pipeline,
                start_type: request.start_type,
                params,
                channel: request.channel,
                is_mobile: request.is_mobile,
                model,
                sign_pipeline_version: None,
                frequency_limit: false,
                build_no: None,
                start_values: None,
                handle_post: true,
            })
            .await?;

        self.builds
            .update_task_sub_build_id(&request.parent_build_id, &request.parent_task_id, &sub_build_id)
            .await?;
        info!(
            parent_build_id = %request.parent_build_id,
            parent_task_id = %request.parent_task_id,
            sub_build_id = %sub_build_id,
            "sub-pipeline started"
        );
        Ok(sub_build_id)
    }

    /// Scheduled start; a pipeline that no longer exists starts nothing
    pub async fn timer_trigger_pipeline_build(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        parameters: HashMap<String, String>,
        check_permission: bool,
    ) -> Result<Option<String>> {
        self.validate_permission(check_permission, user_id, project_id, pipeline_id, Permission::Execute)
            .await?;
        let Some(pipeline) = self
            .pipelines
            .get_pipeline_info(project_id, pipeline_id, None)
            .await?
        else {
            warn!(project_id = %project_id, pipeline_id = %pipeline_id, "timer fired for missing pipeline");
            return Ok(None);
        };
        let model = self.model_version(pipeline_id, None).await?;

        let inputs: BuildParameters = parameters
            .into_iter()
            .map(|(key, value)| BuildParameter::new(key, value, Provenance::Manual))
            .collect();
        let params = parameter::merge_with_defaults(&model, inputs);
        let channel = pipeline.channel;

        let build_id = self
            .start_pipeline(StartPipelineRequest {
                user_id: user_id.to_string(),
                pipeline,
                start_type: StartType::TimeTrigger,
                params,
                channel,
                is_mobile: false,
                model,
                sign_pipeline_version: None,
                frequency_limit: false,
                build_no: None,
                start_values: None,
                handle_post: true,
            })
            .await?;
        Ok(Some(build_id))
    }
}
