//! Shutdowns, reviews, paused stages and worker exits

use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use sluice_core::domain::build::{BuildRecord, BuildStatus, ChannelCode, StartType};
use sluice_core::domain::element::{ElementKind, ManualReviewParam};
use sluice_core::domain::event::{ActionType, BuildContainerEvent, PipelineEvent};
use sluice_core::domain::model::PipelineModel;
use sluice_core::domain::review::{ManualReviewAction, ReviewParam, StageReviewRequest};
use sluice_core::dto::build::WorkerResult;

use super::{BuildService, ensure_same_pipeline};
use crate::error::{ErrorCode, OrchestratorError, Resource, Result};
use crate::repository::Permission;
use crate::service::env::parse_env;
use crate::service::interceptor::InterceptData;

fn shutdown_key(build_id: &str) -> String {
    format!("sluice:shutdown:{build_id}")
}

/// Review element of a build with runtime variables substituted
struct ReviewForm {
    reviewers: Vec<String>,
    desc: Option<String>,
    params: Vec<ManualReviewParam>,
}

impl ReviewForm {
    fn resolve(model: &PipelineModel, element_id: &str, vars: &HashMap<String, String>) -> Result<Self> {
        let Some(ElementKind::ManualReviewUserTask {
            review_users,
            desc,
            params,
        }) = model.find_element(element_id).map(|e| &e.kind)
        else {
            return Err(OrchestratorError::not_found(Resource::Element, element_id));
        };

        // Each entry may expand to a comma separated list
        let reviewers = review_users
            .iter()
            .flat_map(|entry| {
                parse_env(entry, vars)
                    .split(',')
                    .map(|user| user.trim().to_string())
                    .filter(|user| !user.is_empty())
                    .collect::<Vec<_>>()
            })
            .collect();

        Ok(Self {
            reviewers,
            desc: desc.as_deref().map(|d| parse_env(d, vars)),
            params: substitute(params, vars),
        })
    }

    fn ensure_reviewer(&self, user_id: &str) -> Result<()> {
        if self.reviewers.iter().any(|r| r == user_id) {
            return Ok(());
        }
        Err(OrchestratorError::ReviewerMismatch {
            user_id: user_id.to_string(),
        })
    }
}

fn substitute(params: &[ManualReviewParam], vars: &HashMap<String, String>) -> Vec<ManualReviewParam> {
    params
        .iter()
        .map(|param| ManualReviewParam {
            value: parse_env(&param.value, vars),
            ..param.clone()
        })
        .collect()
}

impl BuildService {
    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Cancels a build on a user's request
    ///
    /// Parent builds that started this one through a sub-pipeline task are
    /// failed as well.
    pub async fn build_manual_shutdown(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        channel: ChannelCode,
        check_permission: bool,
    ) -> Result<()> {
        self.validate_permission(check_permission, user_id, project_id, pipeline_id, Permission::Execute)
            .await?;
        self.pipeline_info(project_id, pipeline_id, Some(channel)).await?;

        let guard = self.locks.acquire_build_lock(build_id).await?;
        let result = self.manual_shutdown_locked(user_id, pipeline_id, build_id).await;
        guard.release().await;
        result
    }

    async fn manual_shutdown_locked(&self, user_id: &str, pipeline_id: &str, build_id: &str) -> Result<()> {
        let build = self.pipeline_build(pipeline_id, build_id).await?;
        if build.is_canceled_by_user() {
            return Err(OrchestratorError::conflict(
                ErrorCode::CanceledByOtherUser,
                format!(
                    "build {build_id} was already canceled by {}",
                    build.cancel_user.as_deref().unwrap_or_default()
                ),
            ));
        }
        if build.status.is_finish() {
            return Err(OrchestratorError::conflict(
                ErrorCode::BuildFinished,
                format!("build {build_id} already finished as {:?}", build.status),
            ));
        }

        self.cascade_to_parents(&build).await;

        let tasks = self.builds.get_running_tasks(build_id).await?;
        let message = format!("Pipeline terminated by user, operator: {user_id}");
        if tasks.is_empty() {
            self.print_line(build_id, &message, "", "", 1).await;
        }
        for task in &tasks {
            self.print_line(build_id, &message, &task.task_id, &task.container_id, task.execute_count)
                .await;
        }
        for task in &tasks {
            if let Err(err) = self.builds.cancel_task(build_id, &task.task_id, user_id).await {
                warn!(build_id = %build_id, task_id = %task.task_id, error = %err, "failed to cancel task");
            }
        }

        self.builds
            .cancel_build(build_id, user_id, BuildStatus::Canceled)
            .await?;
        self.builds.update_cancel_user(build_id, user_id).await?;

        info!(build_id = %build_id, user_id = %user_id, running_tasks = tasks.len(), "build canceled");
        Ok(())
    }

    /// Fails a build on behalf of the system
    ///
    /// Missing, finished and already canceled builds are left alone, so
    /// repeated requests for one build are harmless.
    pub async fn service_shutdown(
        &self,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        channel: ChannelCode,
    ) -> Result<()> {
        debug!(project_id = %project_id, build_id = %build_id, channel = %channel, "service shutdown requested");
        let dedup = self
            .locks
            .acquire_generic_lock(&shutdown_key(build_id), self.config.shutdown_dedup_ttl)
            .await?;
        let guard = match self.locks.acquire_build_lock(build_id).await {
            Ok(guard) => guard,
            Err(err) => {
                dedup.release().await;
                return Err(err.into());
            }
        };

        let result = self.service_shutdown_locked(pipeline_id, build_id).await;
        guard.release().await;
        dedup.release().await;
        result
    }

    async fn service_shutdown_locked(&self, pipeline_id: &str, build_id: &str) -> Result<()> {
        let Some(build) = self.builds.get_build(build_id).await? else {
            warn!(build_id = %build_id, "service shutdown of missing build");
            return Ok(());
        };
        ensure_same_pipeline(&build, pipeline_id)?;
        if build.is_canceled_by_user() || build.status.is_finish() {
            debug!(build_id = %build_id, status = ?build.status, "build already stopped");
            return Ok(());
        }

        self.cascade_to_parents(&build).await;
        self.fail_by_service(&build).await;
        Ok(())
    }

    async fn fail_by_service(&self, build: &BuildRecord) {
        let build_id = build.build_id.as_str();
        if let Err(err) = self
            .builds
            .cancel_build(build_id, &build.start_user, BuildStatus::Failed)
            .await
        {
            warn!(build_id = %build_id, error = %err, "failed to fail build");
            return;
        }
        if let Err(err) = self.builds.update_cancel_user(build_id, &build.start_user).await {
            warn!(build_id = %build_id, error = %err, "failed to record cancel user");
            return;
        }
        info!(build_id = %build_id, "build failed by service");
    }

    /// Walks up the sub-pipeline chain failing every running parent
    async fn cascade_to_parents(&self, build: &BuildRecord) {
        let mut visited = HashSet::from([build.build_id.clone()]);
        let mut link = build
            .parent_link()
            .map(|(b, t)| (b.to_string(), t.to_string()));
        let mut depth = 0;

        while let Some((parent_id, parent_task_id)) = link.take() {
            if depth >= self.config.max_cascade_depth {
                warn!(build_id = %build.build_id, depth, "cascade stopped at depth limit");
                break;
            }
            if !visited.insert(parent_id.clone()) {
                warn!(build_id = %build.build_id, parent_id = %parent_id, "cycle in parent chain");
                break;
            }
            depth += 1;

            debug!(parent_id = %parent_id, parent_task_id = %parent_task_id, "cascading shutdown");
            match self.fail_parent(&parent_id).await {
                Ok(Some(parent)) => {
                    link = parent
                        .parent_link()
                        .map(|(b, t)| (b.to_string(), t.to_string()));
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(parent_id = %parent_id, error = %err, "failed to cascade shutdown");
                    break;
                }
            }
        }
    }

    /// Fails a running parent; `None` when it is missing or already stopped
    async fn fail_parent(&self, parent_id: &str) -> Result<Option<BuildRecord>> {
        let dedup = self
            .locks
            .acquire_generic_lock(&shutdown_key(parent_id), self.config.shutdown_dedup_ttl)
            .await?;
        let guard = match self.locks.acquire_build_lock(parent_id).await {
            Ok(guard) => guard,
            Err(err) => {
                dedup.release().await;
                return Err(err.into());
            }
        };

        let result = match self.builds.get_build(parent_id).await {
            Ok(Some(parent)) if !parent.status.is_finish() && !parent.is_canceled_by_user() => {
                self.fail_by_service(&parent).await;
                Ok(Some(parent))
            }
            Ok(_) => Ok(None),
            Err(err) => Err(err.into()),
        };

        guard.release().await;
        dedup.release().await;
        result
    }

    pub(super) async fn print_line(&self, build_id: &str, message: &str, tag: &str, job_id: &str, execute_count: u32) {
        if let Err(err) = self
            .logs
            .add_line(build_id, message, tag, job_id, execute_count)
            .await
        {
            warn!(build_id = %build_id, error = %err, "failed to print build log line");
        }
    }

    // =========================================================================
    // Manual review
    // =========================================================================

    /// Forwards a reviewer's decision to a manual review task
    ///
    /// Reviewers and parameter values may reference runtime variables as
    /// `${name}`. An abort records the reviewer as the cancel user.
    #[allow(clippy::too_many_arguments)]
    pub async fn build_manual_review(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        element_id: &str,
        review: ReviewParam,
        channel: ChannelCode,
        check_permission: bool,
    ) -> Result<()> {
        self.validate_permission(check_permission, user_id, project_id, pipeline_id, Permission::Execute)
            .await?;
        self.pipeline_info(project_id, pipeline_id, Some(channel)).await?;

        let guard = self.locks.acquire_build_lock(build_id).await?;
        let result = self
            .manual_review_locked(user_id, pipeline_id, build_id, element_id, review)
            .await;
        guard.release().await;
        result
    }

    async fn manual_review_locked(
        &self,
        user_id: &str,
        pipeline_id: &str,
        build_id: &str,
        element_id: &str,
        mut review: ReviewParam,
    ) -> Result<()> {
        self.pipeline_build(pipeline_id, build_id).await?;
        let model = self.build_model(build_id).await?;
        let vars = self.variables.get_all_variables(build_id).await?;

        let form = ReviewForm::resolve(&model, element_id, &vars)?;
        form.ensure_reviewer(user_id)?;

        review.params = substitute(&review.params, &vars);
        self.builds
            .manual_deal_task(build_id, element_id, user_id, &review)
            .await?;
        if review.status == Some(ManualReviewAction::Abort) {
            self.builds.update_cancel_user(build_id, user_id).await?;
        }

        info!(
            build_id = %build_id,
            element_id = %element_id,
            user_id = %user_id,
            action = ?review.status,
            "manual review submitted"
        );
        Ok(())
    }

    /// Review form of a manual review task as its reviewer should see it
    pub async fn go_to_review(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        element_id: &str,
    ) -> Result<ReviewParam> {
        self.pipeline_build(pipeline_id, build_id).await?;
        let model = self.build_model(build_id).await?;
        let vars = self.variables.get_all_variables(build_id).await?;

        let form = ReviewForm::resolve(&model, element_id, &vars)?;
        form.ensure_reviewer(user_id)?;

        Ok(ReviewParam {
            project_id: project_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            build_id: build_id.to_string(),
            review_users: form.reviewers,
            status: None,
            desc: form.desc,
            suggest: String::new(),
            params: form.params,
        })
    }

    // =========================================================================
    // Paused stages
    // =========================================================================

    /// Starts or cancels a stage waiting for manual approval
    #[allow(clippy::too_many_arguments)]
    pub async fn build_manual_start_stage(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        stage_id: &str,
        is_cancel: bool,
        review: Option<StageReviewRequest>,
    ) -> Result<()> {
        let build_guard = self.locks.acquire_build_lock(build_id).await?;
        let run_guard = match self.locks.acquire_pipeline_run_lock(pipeline_id).await {
            Ok(guard) => guard,
            Err(err) => {
                build_guard.release().await;
                return Err(err.into());
            }
        };

        let result = self
            .start_stage_locked(user_id, project_id, pipeline_id, build_id, stage_id, is_cancel, review)
            .await;
        run_guard.release().await;
        build_guard.release().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_stage_locked(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        stage_id: &str,
        is_cancel: bool,
        review: Option<StageReviewRequest>,
    ) -> Result<()> {
        let pipeline = self.pipeline_info(project_id, pipeline_id, None).await?;
        self.pipeline_build(pipeline_id, build_id).await?;

        let mut stage = self
            .stages
            .get_stage(build_id, stage_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(Resource::Stage, stage_id))?;
        if !stage.is_trigger_user(user_id) {
            return Err(OrchestratorError::PermissionDenied {
                user_id: user_id.to_string(),
                message: format!("not a trigger user of stage {stage_id}"),
            });
        }
        if stage.status != BuildStatus::Pause {
            return Err(OrchestratorError::conflict(
                ErrorCode::StageNotPaused,
                format!("stage {stage_id} is {:?}, not paused", stage.status),
            ));
        }

        let verdict = self
            .interceptors
            .filter(&InterceptData {
                pipeline: &pipeline,
                model: None,
                start_type: StartType::Manual,
            })
            .await?;
        if !verdict.is_ok() {
            return Err(OrchestratorError::AdmissionRejected {
                status: verdict.status,
                message: verdict.message,
            });
        }

        if is_cancel {
            self.stages.cancel_stage(user_id, build_id, stage_id).await?;
            info!(build_id = %build_id, stage_id = %stage_id, user_id = %user_id, "paused stage canceled");
            return Ok(());
        }

        if let Some(review) = review {
            stage.control_option.review_params = review.review_params;
        }
        self.stages
            .start_stage(user_id, build_id, stage_id, stage.control_option)
            .await?;
        info!(build_id = %build_id, stage_id = %stage_id, user_id = %user_id, "paused stage started");
        Ok(())
    }

    // =========================================================================
    // Worker exits
    // =========================================================================

    /// Terminates the job of a worker that exited abnormally
    ///
    /// The event carries the ids of the stored build; the ones reported by
    /// the worker are only logged.
    pub async fn worker_build_finish(
        &self,
        project_id: &str,
        pipeline_id: &str,
        build_id: &str,
        vm_seq_id: &str,
        result: WorkerResult,
    ) -> Result<()> {
        if result.success {
            info!(
                project_id = %project_id,
                pipeline_id = %pipeline_id,
                build_id = %build_id,
                vm_seq_id = %vm_seq_id,
                "worker finished"
            );
            return Ok(());
        }

        let Some(build) = self.builds.get_build(build_id).await? else {
            warn!(build_id = %build_id, "worker exit reported for missing build");
            return Ok(());
        };
        if build.status.is_finish() {
            debug!(build_id = %build_id, "worker exit after build finished");
            return Ok(());
        }

        let model = self.build_model(build_id).await?;
        let located = model.stages.iter().find_map(|stage| {
            stage
                .containers
                .iter()
                .find(|c| c.id.as_deref() == Some(vm_seq_id))
                .map(|c| (stage.id.clone().unwrap_or_default(), c.type_name()))
        });
        let Some((stage_id, container_type)) = located else {
            warn!(build_id = %build_id, vm_seq_id = %vm_seq_id, "worker exit for unknown job");
            return Ok(());
        };

        let message = result.message.unwrap_or_default();
        warn!(
            build_id = %build_id,
            vm_seq_id = %vm_seq_id,
            reported_pipeline_id = %pipeline_id,
            "worker exited abnormally: {message}"
        );

        let event = PipelineEvent::BuildContainer(BuildContainerEvent {
            source: "worker_build_finish".to_string(),
            project_id: build.project_id,
            pipeline_id: build.pipeline_id,
            user_id: build.start_user,
            build_id: build_id.to_string(),
            stage_id,
            container_id: vm_seq_id.to_string(),
            container_type: container_type.to_string(),
            action_type: ActionType::Terminate,
            reason: Some(format!("Job#{vm_seq_id} worker exception: {message}")),
        });
        self.events.dispatch(event).await?;
        Ok(())
    }
}
