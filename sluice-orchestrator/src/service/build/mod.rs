//! Build Service
//!
//! The state-transition authority of the orchestrator. Starts, retries,
//! stops, reviews and resumes builds; every mutation of a build goes through
//! here, under the lock of the pipeline or build it touches.
//!
//! The operations are split by concern:
//! - `start`: admitting new builds (manual, remote, sub-pipeline, timer)
//! - `retry`: re-running a finished build, fully or from an anchor
//! - `control`: shutdowns, reviews, paused stages, worker exits
//! - `pause`: continuing or terminating a paused task

mod control;
mod pause;
mod retry;
mod start;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use sluice_core::domain::build::{BuildRecord, BuildStatus, ChannelCode};
use sluice_core::domain::element::ElementKind;
use sluice_core::domain::model::PipelineModel;
use sluice_core::domain::param::BuildParameters;
use sluice_core::domain::pipeline::PipelineInfo;
use sluice_core::dto::build::{BuildHistoryWithVars, BuildManualStartupInfo};

use crate::config::OrchestratorConfig;
use crate::error::{ErrorCode, OrchestratorError, Resource, Result};
use crate::repository::{
    BuildRepository, ElementMetadataService, EventDispatcher, LockStore, LogPrinter,
    PauseValueRepository, Permission, PermissionService, PipelineRepository, QualityRuleService,
    StageRepository, VariableRepository,
};
use crate::service::interceptor::InterceptorChain;
use crate::service::lock::{LockConfig, LockCoordinator};
use crate::service::parameter;
use crate::service::rewriter::ModelRewriter;

/// External collaborators a [`BuildService`] drives
#[derive(Clone)]
pub struct Collaborators {
    pub pipelines: Arc<dyn PipelineRepository>,
    pub builds: Arc<dyn BuildRepository>,
    pub variables: Arc<dyn VariableRepository>,
    pub stages: Arc<dyn StageRepository>,
    pub pause_values: Arc<dyn PauseValueRepository>,
    pub permissions: Arc<dyn PermissionService>,
    pub events: Arc<dyn EventDispatcher>,
    pub logs: Arc<dyn LogPrinter>,
    pub elements: Arc<dyn ElementMetadataService>,
    pub quality: Arc<dyn QualityRuleService>,
    pub lock_store: Arc<dyn LockStore>,
}

/// Build orchestration service
pub struct BuildService {
    pipelines: Arc<dyn PipelineRepository>,
    builds: Arc<dyn BuildRepository>,
    variables: Arc<dyn VariableRepository>,
    stages: Arc<dyn StageRepository>,
    pause_values: Arc<dyn PauseValueRepository>,
    permissions: Arc<dyn PermissionService>,
    events: Arc<dyn EventDispatcher>,
    logs: Arc<dyn LogPrinter>,
    quality: Arc<dyn QualityRuleService>,
    rewriter: ModelRewriter,
    interceptors: InterceptorChain,
    locks: LockCoordinator,
    config: OrchestratorConfig,
}

impl BuildService {
    pub fn new(collaborators: Collaborators, interceptors: InterceptorChain, config: OrchestratorConfig) -> Self {
        let locks = LockCoordinator::new(collaborators.lock_store, LockConfig::from(&config));
        let rewriter = ModelRewriter::new(collaborators.elements, config.default_post_version.clone());
        Self {
            pipelines: collaborators.pipelines,
            builds: collaborators.builds,
            variables: collaborators.variables,
            stages: collaborators.stages,
            pause_values: collaborators.pause_values,
            permissions: collaborators.permissions,
            events: collaborators.events,
            logs: collaborators.logs,
            quality: collaborators.quality,
            rewriter,
            interceptors,
            locks,
            config,
        }
    }

    /// Service with the run-lock, running-quota and freeze-window checks
    pub fn with_standard_interceptors(collaborators: Collaborators, config: OrchestratorConfig) -> Self {
        let interceptors =
            InterceptorChain::standard(collaborators.builds.clone(), config.freeze_windows.clone());
        Self::new(collaborators, interceptors, config)
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // Shared lookups
    // =========================================================================

    async fn validate_permission(
        &self,
        check: bool,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        permission: Permission,
    ) -> Result<()> {
        if !check {
            return Ok(());
        }
        if self
            .permissions
            .check_permission(user_id, project_id, pipeline_id, permission)
            .await?
        {
            return Ok(());
        }
        Err(OrchestratorError::PermissionDenied {
            user_id: user_id.to_string(),
            message: format!("no {permission} permission on pipeline {pipeline_id}"),
        })
    }

    /// Pipeline header; a pipeline of another channel is a validation failure
    async fn pipeline_info(
        &self,
        project_id: &str,
        pipeline_id: &str,
        channel: Option<ChannelCode>,
    ) -> Result<PipelineInfo> {
        let info = self
            .pipelines
            .get_pipeline_info(project_id, pipeline_id, None)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(Resource::Pipeline, pipeline_id))?;

        if let Some(channel) = channel {
            if info.channel != channel {
                return Err(OrchestratorError::invalid(
                    ErrorCode::ChannelMismatch,
                    format!(
                        "pipeline {pipeline_id} belongs to channel {}, not {channel}",
                        info.channel
                    ),
                ));
            }
        }
        Ok(info)
    }

    async fn model_version(&self, pipeline_id: &str, version: Option<i32>) -> Result<PipelineModel> {
        self.pipelines
            .get_model(pipeline_id, version)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(Resource::Model, pipeline_id))
    }

    async fn build_record(&self, build_id: &str) -> Result<BuildRecord> {
        self.builds
            .get_build(build_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(Resource::Build, build_id))
    }

    async fn build_model(&self, build_id: &str) -> Result<PipelineModel> {
        self.builds
            .get_build_model(build_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(Resource::Model, build_id))
    }

    /// Build that must belong to `pipeline_id`
    async fn pipeline_build(&self, pipeline_id: &str, build_id: &str) -> Result<BuildRecord> {
        let build = self.build_record(build_id).await?;
        ensure_same_pipeline(&build, pipeline_id)?;
        Ok(build)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Form shown before a manual start
    ///
    /// With "use latest parameters" on the manual trigger, defaults come from
    /// the startup snapshot of the pipeline's latest finished build when it
    /// has one.
    pub async fn build_manual_startup_info(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        channel: ChannelCode,
        check_permission: bool,
    ) -> Result<BuildManualStartupInfo> {
        self.validate_permission(check_permission, user_id, project_id, pipeline_id, Permission::Execute)
            .await?;
        self.pipeline_info(project_id, pipeline_id, Some(channel)).await?;
        let model = self.model_version(pipeline_id, None).await?;
        let trigger = model.trigger().ok_or_else(|| {
            OrchestratorError::invalid(ErrorCode::InvalidModel, "model has no trigger container")
        })?;

        let (can_manual_startup, can_element_skip, use_latest) = match model
            .enabled_trigger(|kind| matches!(kind, ElementKind::ManualTrigger { .. }))
            .map(|e| &e.kind)
        {
            Some(ElementKind::ManualTrigger {
                can_element_skip,
                use_latest_parameters,
            }) => (true, *can_element_skip, *use_latest_parameters),
            _ => (false, false, false),
        };

        let mut properties = trigger.params.clone();
        if use_latest {
            let latest = self
                .builds
                .get_latest_build_with_status(project_id, pipeline_id, &BuildStatus::FINISHED)
                .await?;
            if let Some(latest) = latest {
                if let Some(raw) = self.variables.get_startup_params(&latest.build_id).await? {
                    let snapshot = parameter::decode_snapshot(&raw)?;
                    parameter::overlay_latest(&mut properties, &snapshot);
                }
            }
        }

        let mut form = vec![parameter::build_msg_property()];
        form.extend(properties);

        let mut build_no = trigger.build_no.clone();
        if let Some(declared) = build_no.as_mut() {
            if let Some(current) = self.pipelines.get_build_no(project_id, pipeline_id).await? {
                declared.build_no = current;
            }
        }

        Ok(BuildManualStartupInfo {
            can_manual_startup,
            can_element_skip,
            properties: form,
            build_no,
        })
    }

    /// Startup parameters of a build, without skip flags
    pub async fn get_build_parameters(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        check_permission: bool,
    ) -> Result<BuildParameters> {
        self.validate_permission(check_permission, user_id, project_id, pipeline_id, Permission::View)
            .await?;
        self.pipeline_build(pipeline_id, build_id).await?;
        match self.variables.get_startup_params(build_id).await? {
            Some(raw) => parameter::snapshot_params(&raw),
            None => Ok(BuildParameters::new()),
        }
    }

    /// Runtime variables of a build restricted to `names`
    pub async fn get_build_vars_by_names(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        names: &[String],
        check_permission: bool,
    ) -> Result<HashMap<String, String>> {
        self.validate_permission(check_permission, user_id, project_id, pipeline_id, Permission::View)
            .await?;
        let mut vars = self.variables.get_all_variables(build_id).await?;
        vars.retain(|name, _| names.contains(name));
        Ok(vars)
    }

    /// Build record together with all its runtime variables
    pub async fn get_build_status_with_vars(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        check_permission: bool,
    ) -> Result<BuildHistoryWithVars> {
        self.validate_permission(check_permission, user_id, project_id, pipeline_id, Permission::View)
            .await?;
        let build = self.pipeline_build(pipeline_id, build_id).await?;
        let variables = self.variables.get_all_variables(build_id).await?;
        Ok(BuildHistoryWithVars { build, variables })
    }

    /// Records of the given builds that belong to the project
    pub async fn get_batch_build_status(&self, project_id: &str, build_ids: &[String]) -> Result<Vec<BuildRecord>> {
        let mut builds = self.builds.get_builds(build_ids).await?;
        builds.retain(|b| b.project_id == project_id);
        Ok(builds)
    }

    pub async fn get_latest_success_build(&self, project_id: &str, pipeline_id: &str) -> Result<Option<BuildRecord>> {
        Ok(self
            .builds
            .get_latest_build_with_status(project_id, pipeline_id, &[BuildStatus::Succeed])
            .await?)
    }

    pub async fn update_remark(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        remark: Option<String>,
    ) -> Result<()> {
        self.validate_permission(true, user_id, project_id, pipeline_id, Permission::Execute)
            .await?;
        self.pipeline_build(pipeline_id, build_id).await?;
        self.builds.update_remark(build_id, remark).await?;
        info!(build_id = %build_id, user_id = %user_id, "build remark updated");
        Ok(())
    }
}

fn ensure_same_pipeline(build: &BuildRecord, pipeline_id: &str) -> Result<()> {
    if build.pipeline_id == pipeline_id {
        return Ok(());
    }
    tracing::warn!(
        build_id = %build.build_id,
        expected = %pipeline_id,
        actual = %build.pipeline_id,
        "build belongs to another pipeline"
    );
    Err(OrchestratorError::invalid(
        ErrorCode::PipelineMismatch,
        format!(
            "build {} does not belong to pipeline {pipeline_id}",
            build.build_id
        ),
    ))
}
