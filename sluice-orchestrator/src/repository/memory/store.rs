//! In-memory build store
//!
//! Implements every storage-side repository over one mutex-guarded state so
//! an orchestrator can run embedded or under test without a database.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sluice_core::domain::build::{BuildRecord, BuildStatus, ChannelCode};
use sluice_core::domain::model::PipelineModel;
use sluice_core::domain::param::BuildParameters;
use sluice_core::domain::pipeline::PipelineInfo;
use sluice_core::domain::review::ReviewParam;
use sluice_core::domain::runtime::{
    PipelinePauseValue, StageControlOption, StageRuntimeState, TaskRuntimeState,
};
use sluice_core::dto::build::StartBuildCommand;

use crate::repository::{
    BuildRepository, PauseValueRepository, PipelineRepository, StageRepository, VariableRepository,
};

struct PipelineEntry {
    info: PipelineInfo,
    models: BTreeMap<i32, PipelineModel>,
    build_no: Option<i32>,
    template_id: Option<String>,
}

/// Reviewer decision forwarded to a manual review task
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewDecision {
    pub build_id: String,
    pub task_id: String,
    pub user_id: String,
    pub review: ReviewParam,
}

/// Manual action taken on a paused stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageAction {
    Started {
        build_id: String,
        stage_id: String,
        user_id: String,
        control_option: StageControlOption,
    },
    Canceled {
        build_id: String,
        stage_id: String,
        user_id: String,
    },
}

#[derive(Default)]
struct State {
    pipelines: HashMap<String, PipelineEntry>,
    /// Build ids in start order
    build_order: Vec<String>,
    records: HashMap<String, BuildRecord>,
    build_models: HashMap<String, PipelineModel>,
    build_params: HashMap<String, BuildParameters>,
    build_nums: HashMap<String, i32>,
    variables: HashMap<String, HashMap<String, String>>,
    startup_params: HashMap<String, String>,
    tasks: HashMap<String, Vec<TaskRuntimeState>>,
    stages: HashMap<String, Vec<StageRuntimeState>>,
    pause_values: Vec<PipelinePauseValue>,
    sub_builds: Vec<(String, String, String)>,
    canceled_tasks: Vec<(String, String, String)>,
    reviews: Vec<ReviewDecision>,
    stage_actions: Vec<StageAction>,
}

/// In-memory implementation of the storage repositories
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Registers a pipeline with its model stored under `info.version`
    pub fn add_pipeline(&self, info: PipelineInfo, model: PipelineModel) {
        let mut models = BTreeMap::new();
        models.insert(info.version, model);
        self.state().pipelines.insert(
            info.pipeline_id.clone(),
            PipelineEntry {
                info,
                models,
                build_no: None,
                template_id: None,
            },
        );
    }

    /// Saves a new model version and makes it the pipeline's HEAD
    pub fn publish_version(&self, pipeline_id: &str, version: i32, model: PipelineModel) {
        if let Some(entry) = self.state().pipelines.get_mut(pipeline_id) {
            entry.models.insert(version, model);
            entry.info.version = version;
        }
    }

    pub fn set_template(&self, pipeline_id: &str, template_id: &str) {
        if let Some(entry) = self.state().pipelines.get_mut(pipeline_id) {
            entry.template_id = Some(template_id.to_string());
        }
    }

    /// Stores an existing build together with the model it executed
    pub fn insert_build(&self, record: BuildRecord, model: PipelineModel) {
        let mut state = self.state();
        state.build_order.push(record.build_id.clone());
        state.build_models.insert(record.build_id.clone(), model);
        state.records.insert(record.build_id.clone(), record);
    }

    pub fn set_variables(&self, build_id: &str, variables: HashMap<String, String>) {
        self.state()
            .variables
            .insert(build_id.to_string(), variables);
    }

    pub fn set_startup_params(&self, build_id: &str, raw: &str) {
        self.state()
            .startup_params
            .insert(build_id.to_string(), raw.to_string());
    }

    pub fn put_task(&self, task: TaskRuntimeState) {
        let mut state = self.state();
        let tasks = state.tasks.entry(task.build_id.clone()).or_default();
        match tasks.iter_mut().find(|t| t.task_id == task.task_id) {
            Some(slot) => *slot = task,
            None => tasks.push(task),
        }
    }

    pub fn put_stage(&self, stage: StageRuntimeState) {
        let mut state = self.state();
        let stages = state.stages.entry(stage.build_id.clone()).or_default();
        match stages.iter_mut().find(|s| s.stage_id == stage.stage_id) {
            Some(slot) => *slot = stage,
            None => stages.push(stage),
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn build(&self, build_id: &str) -> Option<BuildRecord> {
        self.state().records.get(build_id).cloned()
    }

    /// Full parameter list a build was started with
    pub fn build_params(&self, build_id: &str) -> Option<BuildParameters> {
        self.state().build_params.get(build_id).cloned()
    }

    pub fn build_model(&self, build_id: &str) -> Option<PipelineModel> {
        self.state().build_models.get(build_id).cloned()
    }

    pub fn startup_params(&self, build_id: &str) -> Option<String> {
        self.state().startup_params.get(build_id).cloned()
    }

    pub fn pause_values(&self) -> Vec<PipelinePauseValue> {
        self.state().pause_values.clone()
    }

    /// (parent build, parent task, sub build) links
    pub fn sub_builds(&self) -> Vec<(String, String, String)> {
        self.state().sub_builds.clone()
    }

    /// (build, task, user) of every task cancellation
    pub fn canceled_tasks(&self) -> Vec<(String, String, String)> {
        self.state().canceled_tasks.clone()
    }

    pub fn reviews(&self) -> Vec<ReviewDecision> {
        self.state().reviews.clone()
    }

    pub fn stage_actions(&self) -> Vec<StageAction> {
        self.state().stage_actions.clone()
    }

    pub fn build_count(&self) -> usize {
        self.state().records.len()
    }
}

#[async_trait]
impl PipelineRepository for MemoryStore {
    async fn get_pipeline_info(
        &self,
        project_id: &str,
        pipeline_id: &str,
        channel: Option<ChannelCode>,
    ) -> Result<Option<PipelineInfo>> {
        let state = self.state();
        Ok(state
            .pipelines
            .get(pipeline_id)
            .map(|entry| &entry.info)
            .filter(|info| info.project_id == project_id)
            .filter(|info| channel.is_none_or(|c| c == info.channel))
            .cloned())
    }

    async fn get_model(&self, pipeline_id: &str, version: Option<i32>) -> Result<Option<PipelineModel>> {
        let state = self.state();
        Ok(state.pipelines.get(pipeline_id).and_then(|entry| {
            let version = version.unwrap_or(entry.info.version);
            entry.models.get(&version).cloned()
        }))
    }

    async fn get_build_no(&self, project_id: &str, pipeline_id: &str) -> Result<Option<i32>> {
        let state = self.state();
        Ok(state
            .pipelines
            .get(pipeline_id)
            .filter(|entry| entry.info.project_id == project_id)
            .and_then(|entry| entry.build_no))
    }

    async fn update_build_no(&self, pipeline_id: &str, build_no: i32) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .pipelines
            .get_mut(pipeline_id)
            .ok_or_else(|| anyhow::anyhow!("pipeline {pipeline_id} does not exist"))?;
        entry.build_no = Some(build_no);
        Ok(())
    }

    async fn get_template_id(&self, pipeline_id: &str) -> Result<Option<String>> {
        Ok(self
            .state()
            .pipelines
            .get(pipeline_id)
            .and_then(|entry| entry.template_id.clone()))
    }
}

#[async_trait]
impl BuildRepository for MemoryStore {
    async fn start_build(&self, command: StartBuildCommand) -> Result<String> {
        let build_id = format!("b-{}", uuid::Uuid::new_v4().simple());
        let mut state = self.state();

        let pipeline_id = command.pipeline.pipeline_id.clone();
        let build_num = {
            let counter = state.build_nums.entry(pipeline_id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let record = BuildRecord {
            build_id: build_id.clone(),
            pipeline_id,
            project_id: command.pipeline.project_id.clone(),
            version: command.pipeline.version,
            build_num,
            trigger: command.start_type,
            channel: command.channel,
            status: BuildStatus::Queue,
            start_user: command.start_user,
            start_time: Some(chrono::Utc::now()),
            end_time: None,
            parent_build_id: command.parent_build_id,
            parent_task_id: command.parent_task_id,
            cancel_user: None,
            remark: None,
            retry_count: command.retry_count,
        };

        state.build_order.push(build_id.clone());
        state.records.insert(build_id.clone(), record);
        state.build_models.insert(build_id.clone(), command.model);
        state.build_params.insert(build_id.clone(), command.params);

        Ok(build_id)
    }

    async fn get_build(&self, build_id: &str) -> Result<Option<BuildRecord>> {
        Ok(self.state().records.get(build_id).cloned())
    }

    async fn get_builds(&self, build_ids: &[String]) -> Result<Vec<BuildRecord>> {
        let state = self.state();
        Ok(build_ids
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn get_latest_build_with_status(
        &self,
        project_id: &str,
        pipeline_id: &str,
        statuses: &[BuildStatus],
    ) -> Result<Option<BuildRecord>> {
        let state = self.state();
        Ok(state
            .build_order
            .iter()
            .rev()
            .filter_map(|id| state.records.get(id))
            .find(|r| {
                r.project_id == project_id
                    && r.pipeline_id == pipeline_id
                    && statuses.contains(&r.status)
            })
            .cloned())
    }

    async fn get_build_model(&self, build_id: &str) -> Result<Option<PipelineModel>> {
        Ok(self.state().build_models.get(build_id).cloned())
    }

    async fn cancel_build(&self, build_id: &str, _user_id: &str, status: BuildStatus) -> Result<()> {
        let mut state = self.state();
        let record = state
            .records
            .get_mut(build_id)
            .ok_or_else(|| anyhow::anyhow!("build {build_id} does not exist"))?;
        record.status = status;
        record.end_time = Some(chrono::Utc::now());
        Ok(())
    }

    async fn update_cancel_user(&self, build_id: &str, user_id: &str) -> Result<()> {
        if let Some(record) = self.state().records.get_mut(build_id) {
            record.cancel_user = Some(user_id.to_string());
        }
        Ok(())
    }

    async fn update_remark(&self, build_id: &str, remark: Option<String>) -> Result<()> {
        if let Some(record) = self.state().records.get_mut(build_id) {
            record.remark = remark;
        }
        Ok(())
    }

    async fn update_task_sub_build_id(&self, build_id: &str, task_id: &str, sub_build_id: &str) -> Result<()> {
        self.state().sub_builds.push((
            build_id.to_string(),
            task_id.to_string(),
            sub_build_id.to_string(),
        ));
        Ok(())
    }

    async fn get_task(&self, build_id: &str, task_id: &str) -> Result<Option<TaskRuntimeState>> {
        let state = self.state();
        Ok(state
            .tasks
            .get(build_id)
            .and_then(|tasks| tasks.iter().find(|t| t.task_id == task_id))
            .cloned())
    }

    async fn get_running_tasks(&self, build_id: &str) -> Result<Vec<TaskRuntimeState>> {
        let state = self.state();
        Ok(state
            .tasks
            .get(build_id)
            .map(|tasks| {
                tasks
                    .iter()
                    .filter(|t| t.status.is_running())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn cancel_task(&self, build_id: &str, task_id: &str, user_id: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(task) = state
            .tasks
            .get_mut(build_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.task_id == task_id))
        {
            task.status = BuildStatus::Canceled;
        }
        state.canceled_tasks.push((
            build_id.to_string(),
            task_id.to_string(),
            user_id.to_string(),
        ));
        Ok(())
    }

    async fn manual_deal_task(
        &self,
        build_id: &str,
        task_id: &str,
        user_id: &str,
        review: &ReviewParam,
    ) -> Result<()> {
        self.state().reviews.push(ReviewDecision {
            build_id: build_id.to_string(),
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            review: review.clone(),
        });
        Ok(())
    }

    async fn count_running_builds(&self, pipeline_id: &str) -> Result<usize> {
        Ok(self
            .state()
            .records
            .values()
            .filter(|r| r.pipeline_id == pipeline_id && r.status.is_running())
            .count())
    }
}

#[async_trait]
impl VariableRepository for MemoryStore {
    async fn get_all_variables(&self, build_id: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .state()
            .variables
            .get(build_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn init_build_parameters(&self, build_id: &str) -> Result<()> {
        let mut state = self.state();
        let params = state
            .build_params
            .get(build_id)
            .map(BuildParameters::to_string_map)
            .ok_or_else(|| anyhow::anyhow!("build {build_id} has no parameters"))?;
        state
            .variables
            .entry(build_id.to_string())
            .or_default()
            .extend(params);
        Ok(())
    }

    async fn save_startup_params(&self, build_id: &str, params: String) -> Result<()> {
        self.state()
            .startup_params
            .insert(build_id.to_string(), params);
        Ok(())
    }

    async fn get_startup_params(&self, build_id: &str) -> Result<Option<String>> {
        Ok(self.state().startup_params.get(build_id).cloned())
    }
}

#[async_trait]
impl StageRepository for MemoryStore {
    async fn get_stage(&self, build_id: &str, stage_id: &str) -> Result<Option<StageRuntimeState>> {
        let state = self.state();
        Ok(state
            .stages
            .get(build_id)
            .and_then(|stages| stages.iter().find(|s| s.stage_id == stage_id))
            .cloned())
    }

    async fn start_stage(
        &self,
        user_id: &str,
        build_id: &str,
        stage_id: &str,
        control_option: StageControlOption,
    ) -> Result<()> {
        let mut state = self.state();
        if let Some(stage) = state
            .stages
            .get_mut(build_id)
            .and_then(|stages| stages.iter_mut().find(|s| s.stage_id == stage_id))
        {
            stage.status = BuildStatus::Running;
            stage.control_option = control_option.clone();
        }
        state.stage_actions.push(StageAction::Started {
            build_id: build_id.to_string(),
            stage_id: stage_id.to_string(),
            user_id: user_id.to_string(),
            control_option,
        });
        Ok(())
    }

    async fn cancel_stage(&self, user_id: &str, build_id: &str, stage_id: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(stage) = state
            .stages
            .get_mut(build_id)
            .and_then(|stages| stages.iter_mut().find(|s| s.stage_id == stage_id))
        {
            stage.status = BuildStatus::Canceled;
        }
        state.stage_actions.push(StageAction::Canceled {
            build_id: build_id.to_string(),
            stage_id: stage_id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl PauseValueRepository for MemoryStore {
    async fn save(&self, value: PipelinePauseValue) -> Result<()> {
        self.state().pause_values.push(value);
        Ok(())
    }

    async fn list(&self, build_id: &str) -> Result<Vec<PipelinePauseValue>> {
        Ok(self
            .state()
            .pause_values
            .iter()
            .filter(|v| v.build_id == build_id)
            .cloned()
            .collect())
    }
}
