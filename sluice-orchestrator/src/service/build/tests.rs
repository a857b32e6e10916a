use super::*;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::time::Duration;

use sluice_core::domain::build::StartType;
use sluice_core::domain::element::{Element, ManualReviewParam};
use sluice_core::domain::event::{ActionType, PipelineEvent};
use sluice_core::domain::model::{Container, ContainerKind, Stage, TriggerOptions};
use sluice_core::domain::param::{BuildFormProperty, ParamType, ParamValue, keys};
use sluice_core::domain::pipeline::{PipelineSetting, RunLockType};
use sluice_core::domain::review::{ManualReviewAction, ReviewParam, StageReviewRequest};
use sluice_core::domain::runtime::{
    PipelinePauseValue, StageControlOption, StageRuntimeState, TaskRuntimeState,
};
use sluice_core::dto::build::{
    ManualStartRequest, PauseAtomRequest, RetryRequest, StartPipelineRequest,
    SubPipelineStartRequest, WorkerResult,
};

use crate::repository::memory::{MemoryBackend, StageAction};
use crate::service::interceptor::InterceptStatus;

const PROJECT: &str = "proj";
const PIPELINE: &str = "p-1";

// =============================================================================
// Fixtures
// =============================================================================

fn string_param(id: &str, default: &str) -> BuildFormProperty {
    BuildFormProperty {
        id: id.to_string(),
        required: false,
        param_type: ParamType::String,
        default_value: ParamValue::from(default),
        desc: None,
    }
}

fn job(id: &str, elements: Vec<Element>) -> Container {
    Container {
        id: Some(id.to_string()),
        name: format!("job {id}"),
        kind: ContainerKind::VmBuild,
        elements,
    }
}

fn model_with(trigger: Vec<Element>, params: Vec<BuildFormProperty>, jobs: Vec<Container>) -> PipelineModel {
    PipelineModel {
        name: "demo".to_string(),
        description: None,
        stages: vec![
            Stage {
                id: Some("stage-1".to_string()),
                name: "trigger".to_string(),
                containers: vec![Container {
                    id: Some("0".to_string()),
                    name: "trigger".to_string(),
                    kind: ContainerKind::Trigger(TriggerOptions {
                        params,
                        build_no: None,
                    }),
                    elements: trigger,
                }],
            },
            Stage {
                id: Some("stage-2".to_string()),
                name: "build".to_string(),
                containers: jobs,
            },
        ],
        instance_from_template: false,
    }
}

fn script_model(script: &str) -> PipelineModel {
    model_with(
        vec![Element::manual_trigger("t-1")],
        vec![string_param("greeting", "hello")],
        vec![job("job-1", vec![Element::script("e-1", script)])],
    )
}

fn default_model() -> PipelineModel {
    script_model("echo ${greeting}")
}

fn review_model() -> PipelineModel {
    model_with(
        vec![Element::manual_trigger("t-1")],
        Vec::new(),
        vec![job(
            "job-1",
            vec![Element::new(
                "review-1",
                "approve",
                ElementKind::ManualReviewUserTask {
                    review_users: vec!["${approvers}".to_string()],
                    desc: Some("deploy to ${env}".to_string()),
                    params: vec![ManualReviewParam {
                        key: "target".to_string(),
                        value: "${env}".to_string(),
                        required: false,
                    }],
                },
            )],
        )],
    )
}

fn info(pipeline_id: &str, version: i32) -> PipelineInfo {
    PipelineInfo {
        project_id: PROJECT.to_string(),
        pipeline_id: pipeline_id.to_string(),
        pipeline_name: "demo".to_string(),
        version,
        channel: ChannelCode::Bs,
        creator: "alice".to_string(),
        last_modify_user: "alice".to_string(),
        setting: PipelineSetting::default(),
    }
}

fn record(build_id: &str, status: BuildStatus) -> BuildRecord {
    BuildRecord {
        build_id: build_id.to_string(),
        pipeline_id: PIPELINE.to_string(),
        project_id: PROJECT.to_string(),
        version: 1,
        build_num: 1,
        trigger: StartType::Manual,
        channel: ChannelCode::Bs,
        status,
        start_user: "alice".to_string(),
        start_time: Some(Utc::now()),
        end_time: None,
        parent_build_id: None,
        parent_task_id: None,
        cancel_user: None,
        remark: None,
        retry_count: 0,
    }
}

fn child_of(build_id: &str, parent_id: &str) -> BuildRecord {
    BuildRecord {
        trigger: StartType::Pipeline,
        parent_build_id: Some(parent_id.to_string()),
        parent_task_id: Some("t-sub".to_string()),
        ..record(build_id, BuildStatus::Running)
    }
}

fn manual_request(values: &[(&str, &str)]) -> ManualStartRequest {
    ManualStartRequest {
        user_id: "alice".to_string(),
        start_type: StartType::Manual,
        project_id: PROJECT.to_string(),
        pipeline_id: PIPELINE.to_string(),
        values: values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        channel: ChannelCode::Bs,
        check_permission: true,
        is_mobile: false,
        build_no: None,
        frequency_limit: true,
    }
}

fn retry_request(build_id: &str, task_id: Option<&str>) -> RetryRequest {
    RetryRequest {
        user_id: "alice".to_string(),
        project_id: PROJECT.to_string(),
        pipeline_id: PIPELINE.to_string(),
        build_id: build_id.to_string(),
        task_id: task_id.map(str::to_string),
        is_mobile: false,
        channel: ChannelCode::Bs,
        check_permission: true,
    }
}

fn paused_task(build_id: &str, status: BuildStatus) -> TaskRuntimeState {
    TaskRuntimeState {
        build_id: build_id.to_string(),
        task_id: "e-1".to_string(),
        task_name: "checkout".to_string(),
        stage_id: "stage-2".to_string(),
        container_id: "job-1".to_string(),
        status,
        task_params: json!({"data": {"input": {"branch": "main", "depth": 1}}}),
        execute_count: 1,
    }
}

fn checkout(branch: &str) -> Element {
    let mut element = Element::market("e-1", "checkout", "1.*");
    if let ElementKind::MarketBuild { input, .. } = &mut element.kind {
        input.insert("branch".to_string(), json!(branch));
        input.insert("depth".to_string(), json!(1));
    }
    element
}

fn pause_request(build_id: &str, element: Element, is_continue: bool) -> PauseAtomRequest {
    PauseAtomRequest {
        user_id: "alice".to_string(),
        project_id: PROJECT.to_string(),
        pipeline_id: PIPELINE.to_string(),
        build_id: build_id.to_string(),
        stage_id: "stage-2".to_string(),
        container_id: "job-1".to_string(),
        task_id: "e-1".to_string(),
        is_continue,
        element,
        check_permission: true,
    }
}

struct Harness {
    backend: MemoryBackend,
    service: BuildService,
}

fn harness_with(config: OrchestratorConfig) -> Harness {
    let backend = MemoryBackend::new();
    backend.store.add_pipeline(info(PIPELINE, 1), default_model());
    let service = BuildService::new(backend.collaborators(), InterceptorChain::new(), config);
    Harness { backend, service }
}

fn harness() -> Harness {
    harness_with(OrchestratorConfig::default())
}

impl Harness {
    async fn finish(&self, build_id: &str, status: BuildStatus) {
        self.backend
            .store
            .cancel_build(build_id, "system", status)
            .await
            .unwrap();
    }

    fn param(&self, build_id: &str, key: &str) -> Option<String> {
        self.backend.store.build_params(build_id).unwrap().value_of(key)
    }
}

// =============================================================================
// Starting builds
// =============================================================================

#[tokio::test]
async fn test_manual_startup_persists_build() {
    let h = harness();

    let build_id = h
        .service
        .build_manual_startup(manual_request(&[("greeting", "hi")]))
        .await
        .unwrap();

    let build = h.backend.store.build(&build_id).unwrap();
    assert_eq!(build.trigger, StartType::Manual);
    assert_eq!(build.start_user, "alice");
    assert_eq!(build.version, 1);

    assert_eq!(h.param(&build_id, "greeting").as_deref(), Some("hi"));
    assert_eq!(
        h.param(&build_id, keys::PIPELINE_BUILD_MSG).as_deref(),
        Some("Manually triggered")
    );
    assert_eq!(h.param(&build_id, keys::PIPELINE_START_TYPE).as_deref(), Some("MANUAL"));

    // Snapshot keeps declared parameters and the build message only
    let snapshot =
        parameter::decode_snapshot(&h.backend.store.startup_params(&build_id).unwrap()).unwrap();
    assert_eq!(snapshot.get("greeting"), Some(&json!("hi")));
    assert!(snapshot.contains_key(keys::PIPELINE_BUILD_MSG));
    assert!(!snapshot.contains_key(keys::PIPELINE_START_USER_ID));

    let vars = h.backend.store.get_all_variables(&build_id).await.unwrap();
    assert_eq!(vars.get(keys::PIPELINE_START_USER_ID).map(String::as_str), Some("alice"));

    let events = h.backend.events.events();
    assert!(matches!(&events[..], [PipelineEvent::BuildStart(e)] if e.build_id == build_id));
}

#[tokio::test]
async fn test_manual_startup_skips_requested_elements() {
    let h = harness();
    let skip = keys::skip_element("e-1");

    let build_id = h
        .service
        .build_manual_startup(manual_request(&[(skip.as_str(), "true")]))
        .await
        .unwrap();

    let model = h.backend.store.build_model(&build_id).unwrap();
    assert!(model.find_element("e-1").unwrap().skipped);
    assert_eq!(h.param(&build_id, &skip).as_deref(), Some("true"));
}

#[tokio::test]
async fn test_pipeline_lock_is_exclusive() {
    let h = harness();
    let held = h
        .service
        .locks()
        .try_acquire_pipeline_lock(PIPELINE)
        .await
        .unwrap()
        .unwrap();

    let err = h
        .service
        .build_manual_startup(manual_request(&[]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FrequencyLimited);
    assert_eq!(h.backend.store.build_count(), 0);

    // Exempt channels start regardless
    let exempt = h
        .service
        .start_pipeline(StartPipelineRequest {
            user_id: "alice".to_string(),
            pipeline: info(PIPELINE, 1),
            start_type: StartType::Service,
            params: BuildParameters::new(),
            channel: ChannelCode::Codecc,
            is_mobile: false,
            model: default_model(),
            sign_pipeline_version: None,
            frequency_limit: true,
            build_no: None,
            start_values: None,
            handle_post: true,
        })
        .await
        .unwrap();
    assert_eq!(
        h.param(&exempt, keys::PIPELINE_BUILD_MSG).as_deref(),
        Some("Triggered by CodeCC")
    );

    held.release().await;
    h.service
        .build_manual_startup(manual_request(&[]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_startup_rejections_are_distinct() {
    let h = harness();
    h.backend.permissions.deny("mallory", PIPELINE);

    let mut denied = manual_request(&[]);
    denied.user_id = "mallory".to_string();
    let err = h.service.build_manual_startup(denied).await.unwrap_err();
    assert!(err.is_permission_denied());

    let mut missing = manual_request(&[]);
    missing.pipeline_id = "p-missing".to_string();
    let err = h.service.build_manual_startup(missing).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PipelineNotFound);

    let mut other_channel = manual_request(&[]);
    other_channel.channel = ChannelCode::Am;
    let err = h.service.build_manual_startup(other_channel).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChannelMismatch);

    let mut remote = manual_request(&[]);
    remote.start_type = StartType::Remote;
    let err = h.service.build_manual_startup(remote).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::RemoteStartDenied);
}

#[tokio::test]
async fn test_admission_rejected_by_run_lock() {
    let backend = MemoryBackend::new();
    let mut locked = info(PIPELINE, 1);
    locked.setting.run_lock_type = RunLockType::Lock;
    backend.store.add_pipeline(locked, default_model());
    let service =
        BuildService::with_standard_interceptors(backend.collaborators(), OrchestratorConfig::default());

    let err = service
        .build_manual_startup(manual_request(&[]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::AdmissionRejected {
            status: InterceptStatus::PipelineLocked,
            ..
        }
    ));
    assert_eq!(backend.store.build_count(), 0);
}

#[tokio::test]
async fn test_dispatch_failure_does_not_fail_start() {
    let h = harness();
    h.backend.events.fail_dispatches();

    let build_id = h
        .service
        .build_manual_startup(manual_request(&[]))
        .await
        .unwrap();
    assert!(h.backend.store.build(&build_id).is_some());
}

#[tokio::test]
async fn test_subpipeline_startup_links_parent() {
    let h = harness();
    h.backend.store.add_pipeline(info("p-child", 1), default_model());
    h.backend
        .store
        .insert_build(record("b-parent", BuildStatus::Running), default_model());

    let sub_build_id = h
        .service
        .subpipeline_startup(SubPipelineStartRequest {
            user_id: "alice".to_string(),
            start_type: StartType::Pipeline,
            project_id: PROJECT.to_string(),
            parent_pipeline_id: PIPELINE.to_string(),
            parent_build_id: "b-parent".to_string(),
            parent_task_id: "t-sub".to_string(),
            pipeline_id: "p-child".to_string(),
            channel: ChannelCode::Bs,
            parameters: HashMap::from([("greeting".to_string(), json!("from parent"))]),
            check_permission: true,
            is_mobile: false,
            trigger_user: Some("carol".to_string()),
        })
        .await
        .unwrap();

    let build = h.backend.store.build(&sub_build_id).unwrap();
    assert_eq!(build.trigger, StartType::Pipeline);
    assert_eq!(build.start_user, "carol");
    assert_eq!(build.parent_link(), Some(("b-parent", "t-sub")));
    assert_eq!(h.param(&sub_build_id, "greeting").as_deref(), Some("from parent"));
    assert_eq!(
        h.backend.store.sub_builds(),
        vec![("b-parent".to_string(), "t-sub".to_string(), sub_build_id)]
    );
}

#[tokio::test]
async fn test_timer_trigger() {
    let h = harness();

    let missing = h
        .service
        .timer_trigger_pipeline_build("alice", PROJECT, "p-missing", HashMap::new(), false)
        .await
        .unwrap();
    assert!(missing.is_none());

    let build_id = h
        .service
        .timer_trigger_pipeline_build("alice", PROJECT, PIPELINE, HashMap::new(), false)
        .await
        .unwrap()
        .unwrap();
    let build = h.backend.store.build(&build_id).unwrap();
    assert_eq!(build.trigger, StartType::TimeTrigger);
    assert_eq!(h.param(&build_id, "greeting").as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_startup_info_uses_latest_finished_build() {
    let backend = MemoryBackend::new();
    let model = model_with(
        vec![Element::new(
            "t-1",
            "manual",
            ElementKind::ManualTrigger {
                can_element_skip: true,
                use_latest_parameters: true,
            },
        )],
        vec![string_param("greeting", "hello")],
        vec![job("job-1", vec![Element::script("e-1", "true")])],
    );
    backend.store.add_pipeline(info(PIPELINE, 1), model);
    let service = BuildService::new(backend.collaborators(), InterceptorChain::new(), OrchestratorConfig::default());

    let form = service
        .build_manual_startup_info("alice", PROJECT, PIPELINE, ChannelCode::Bs, true)
        .await
        .unwrap();
    assert!(form.can_manual_startup);
    assert!(form.can_element_skip);
    assert_eq!(form.properties[0].id, keys::PIPELINE_BUILD_MSG);
    assert_eq!(form.properties[1].default_value, ParamValue::from("hello"));

    // A build that has not finished yet does not supply defaults
    let finished = service
        .build_manual_startup(manual_request(&[("greeting", "bye")]))
        .await
        .unwrap();
    let form = service
        .build_manual_startup_info("alice", PROJECT, PIPELINE, ChannelCode::Bs, true)
        .await
        .unwrap();
    assert_eq!(form.properties[1].default_value, ParamValue::from("hello"));

    backend
        .store
        .cancel_build(&finished, "system", BuildStatus::Succeed)
        .await
        .unwrap();
    let queued = service
        .build_manual_startup(manual_request(&[("greeting", "still-queued")]))
        .await
        .unwrap();
    assert_eq!(backend.store.build(&queued).unwrap().status, BuildStatus::Queue);

    let form = service
        .build_manual_startup_info("alice", PROJECT, PIPELINE, ChannelCode::Bs, true)
        .await
        .unwrap();
    assert_eq!(form.properties[1].default_value, ParamValue::from("bye"));
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test]
async fn test_retry_runs_original_version() {
    let h = harness();
    let first = h
        .service
        .build_manual_startup(manual_request(&[]))
        .await
        .unwrap();
    h.finish(&first, BuildStatus::Failed).await;

    h.backend
        .store
        .publish_version(PIPELINE, 2, script_model("echo v2"));

    let retried = h.service.retry(retry_request(&first, None)).await.unwrap();

    let build = h.backend.store.build(&retried).unwrap();
    assert_eq!(build.version, 1);
    let model = h.backend.store.build_model(&retried).unwrap();
    assert!(matches!(
        &model.find_element("e-1").unwrap().kind,
        ElementKind::LinuxScript { script } if script == "echo ${greeting}"
    ));
    assert_eq!(h.param(&retried, keys::PIPELINE_VERSION).as_deref(), Some("1"));
    assert_eq!(h.param(&retried, keys::PIPELINE_RETRY_BUILD_ID), Some(first));
}

#[tokio::test]
async fn test_retry_count_increments() {
    let h = harness();
    let first = h
        .service
        .build_manual_startup(manual_request(&[]))
        .await
        .unwrap();
    h.finish(&first, BuildStatus::Failed).await;

    let second = h.service.retry(retry_request(&first, None)).await.unwrap();
    assert_eq!(h.param(&second, keys::PIPELINE_RETRY_COUNT).as_deref(), Some("1"));
    h.finish(&second, BuildStatus::Failed).await;

    let third = h.service.retry(retry_request(&second, None)).await.unwrap();
    assert_eq!(h.param(&third, keys::PIPELINE_RETRY_COUNT).as_deref(), Some("2"));
    assert_eq!(h.backend.store.build(&third).unwrap().retry_count, 2);
}

#[tokio::test]
async fn test_full_retry_reuses_snapshot() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Failed), default_model());
    h.backend.store.set_startup_params(
        "b-1",
        r#"{"greeting":"1","pipeline.retry.count":"2","pipeline.retry.start.task.id":"e-1"}"#,
    );

    let retried = h.service.retry(retry_request("b-1", None)).await.unwrap();

    assert_eq!(h.param(&retried, "greeting").as_deref(), Some("1"));
    assert_eq!(h.param(&retried, keys::PIPELINE_RETRY_COUNT).as_deref(), Some("3"));
    assert_eq!(h.param(&retried, keys::PIPELINE_RETRY_START_TASK_ID), None);
}

#[tokio::test]
async fn test_scoped_retry_resumes_from_job() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Failed), default_model());
    h.backend.store.set_variables(
        "b-1",
        HashMap::from([("greeting".to_string(), "x".to_string())]),
    );

    let retried = h
        .service
        .retry(retry_request("b-1", Some("job-1")))
        .await
        .unwrap();
    assert_eq!(
        h.param(&retried, keys::PIPELINE_RETRY_START_TASK_ID).as_deref(),
        Some("e-1")
    );
    assert_eq!(h.param(&retried, "greeting").as_deref(), Some("x"));

    h.finish(&retried, BuildStatus::Failed).await;
    let err = h
        .service
        .retry(retry_request(&retried, Some("nowhere")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TaskNotFound);
}

#[tokio::test]
async fn test_retry_of_running_build_conflicts() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());

    let err = h.service.retry(retry_request("b-1", None)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateRetry);
    assert_eq!(h.backend.store.build_count(), 1);
}

#[tokio::test]
async fn test_retry_applies_latest_pause_value() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Failed), default_model());

    let now = Utc::now();
    for (script, created_at) in [("echo newer", now), ("echo older", now - ChronoDuration::minutes(5))] {
        h.backend
            .store
            .save(PipelinePauseValue {
                build_id: "b-1".to_string(),
                task_id: "e-1".to_string(),
                new_value: serde_json::to_string(&Element::script("e-1", script)).unwrap(),
                default_value: "{}".to_string(),
                created_at,
            })
            .await
            .unwrap();
    }

    let retried = h.service.retry(retry_request("b-1", None)).await.unwrap();
    let model = h.backend.store.build_model(&retried).unwrap();
    assert!(matches!(
        &model.find_element("e-1").unwrap().kind,
        ElementKind::LinuxScript { script } if script == "echo newer"
    ));
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_concurrent_manual_shutdowns() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());

    let (first, second) = tokio::join!(
        h.service
            .build_manual_shutdown("alice", PROJECT, PIPELINE, "b-1", ChannelCode::Bs, true),
        h.service
            .build_manual_shutdown("bob", PROJECT, PIPELINE, "b-1", ChannelCode::Bs, true),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let err = outcomes.into_iter().find_map(Result::err).unwrap();
    assert_eq!(err.code(), ErrorCode::CanceledByOtherUser);

    let build = h.backend.store.build("b-1").unwrap();
    assert_eq!(build.status, BuildStatus::Canceled);
    assert!(build.is_canceled_by_user());
}

#[tokio::test]
async fn test_manual_shutdown_of_finished_build_conflicts() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Succeed), default_model());

    let err = h
        .service
        .build_manual_shutdown("alice", PROJECT, PIPELINE, "b-1", ChannelCode::Bs, true)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BuildFinished);

    let build = h.backend.store.build("b-1").unwrap();
    assert_eq!(build.status, BuildStatus::Succeed);
    assert!(build.cancel_user.is_none());
    assert!(h.backend.logs.lines().is_empty());
}

#[tokio::test]
async fn test_manual_shutdown_logs_and_cancels_tasks() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());
    h.backend.store.put_task(paused_task("b-1", BuildStatus::Running));

    h.service
        .build_manual_shutdown("alice", PROJECT, PIPELINE, "b-1", ChannelCode::Bs, true)
        .await
        .unwrap();

    let lines = h.backend.logs.lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].message, "Pipeline terminated by user, operator: alice");
    assert_eq!(lines[0].tag, "e-1");
    assert_eq!(lines[0].job_id, "job-1");
    assert_eq!(
        h.backend.store.canceled_tasks(),
        vec![("b-1".to_string(), "e-1".to_string(), "alice".to_string())]
    );
    assert_eq!(
        h.backend.store.build("b-1").unwrap().cancel_user.as_deref(),
        Some("alice")
    );
}

#[tokio::test]
async fn test_manual_shutdown_without_tasks_logs_build_line() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Queue), default_model());

    h.service
        .build_manual_shutdown("alice", PROJECT, PIPELINE, "b-1", ChannelCode::Bs, true)
        .await
        .unwrap();

    let lines = h.backend.logs.lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].tag, "");
    assert_eq!(lines[0].job_id, "");

    let err = h
        .service
        .build_manual_shutdown("alice", PROJECT, PIPELINE, "b-missing", ChannelCode::Bs, true)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_shutdown_cascades_to_parents() {
    let h = harness();
    let mut grandparent = record("b-grand", BuildStatus::Running);
    grandparent.start_user = "gina".to_string();
    h.backend.store.insert_build(grandparent, default_model());
    let mut parent = child_of("b-parent", "b-grand");
    parent.start_user = "paul".to_string();
    h.backend.store.insert_build(parent, default_model());
    h.backend
        .store
        .insert_build(child_of("b-child", "b-parent"), default_model());

    h.service
        .build_manual_shutdown("alice", PROJECT, PIPELINE, "b-child", ChannelCode::Bs, true)
        .await
        .unwrap();

    let parent = h.backend.store.build("b-parent").unwrap();
    assert_eq!(parent.status, BuildStatus::Failed);
    assert_eq!(parent.cancel_user.as_deref(), Some("paul"));
    let grandparent = h.backend.store.build("b-grand").unwrap();
    assert_eq!(grandparent.status, BuildStatus::Failed);
    assert_eq!(grandparent.cancel_user.as_deref(), Some("gina"));
    assert_eq!(
        h.backend.store.build("b-child").unwrap().status,
        BuildStatus::Canceled
    );
}

#[tokio::test]
async fn test_cascade_stops_at_finished_parent_and_cycles() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-parent", BuildStatus::Succeed), default_model());
    h.backend
        .store
        .insert_build(child_of("b-child", "b-parent"), default_model());

    h.service
        .service_shutdown(PROJECT, PIPELINE, "b-child", ChannelCode::Bs)
        .await
        .unwrap();
    assert_eq!(
        h.backend.store.build("b-parent").unwrap().status,
        BuildStatus::Succeed
    );
    assert_eq!(
        h.backend.store.build("b-child").unwrap().status,
        BuildStatus::Failed
    );

    // Two builds naming each other as parent
    h.backend
        .store
        .insert_build(child_of("b-a", "b-b"), default_model());
    h.backend
        .store
        .insert_build(child_of("b-b", "b-a"), default_model());
    h.service
        .service_shutdown(PROJECT, PIPELINE, "b-a", ChannelCode::Bs)
        .await
        .unwrap();
    assert_eq!(h.backend.store.build("b-a").unwrap().status, BuildStatus::Failed);
    assert_eq!(h.backend.store.build("b-b").unwrap().status, BuildStatus::Failed);
}

#[tokio::test]
async fn test_service_shutdown_is_idempotent() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());

    for _ in 0..2 {
        h.service
            .service_shutdown(PROJECT, PIPELINE, "b-1", ChannelCode::Bs)
            .await
            .unwrap();
    }
    let build = h.backend.store.build("b-1").unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    assert_eq!(build.cancel_user.as_deref(), Some("alice"));

    h.service
        .service_shutdown(PROJECT, PIPELINE, "b-missing", ChannelCode::Bs)
        .await
        .unwrap();
}

// =============================================================================
// Reviews and paused stages
// =============================================================================

fn review_harness() -> Harness {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Reviewing), review_model());
    h.backend.store.set_variables(
        "b-1",
        HashMap::from([
            ("approvers".to_string(), "alice, bob".to_string()),
            ("env".to_string(), "prod".to_string()),
        ]),
    );
    h
}

#[tokio::test]
async fn test_go_to_review_resolves_variables() {
    let h = review_harness();

    let form = h
        .service
        .go_to_review("bob", PROJECT, PIPELINE, "b-1", "review-1")
        .await
        .unwrap();
    assert_eq!(form.review_users, vec!["alice".to_string(), "bob".to_string()]);
    assert_eq!(form.desc.as_deref(), Some("deploy to prod"));
    assert_eq!(form.params[0].value, "prod");
    assert_eq!(form.status, None);

    let err = h
        .service
        .go_to_review("carol", PROJECT, PIPELINE, "b-1", "review-1")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReviewerMismatch);

    let err = h
        .service
        .go_to_review("bob", PROJECT, PIPELINE, "b-1", "e-unknown")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ElementNotFound);
}

#[tokio::test]
async fn test_manual_review_abort_records_cancel_user() {
    let h = review_harness();

    let review = ReviewParam {
        status: Some(ManualReviewAction::Abort),
        params: vec![ManualReviewParam {
            key: "target".to_string(),
            value: "${env} only".to_string(),
            required: false,
        }],
        ..ReviewParam::default()
    };
    h.service
        .build_manual_review("alice", PROJECT, PIPELINE, "b-1", "review-1", review, ChannelCode::Bs, true)
        .await
        .unwrap();

    let reviews = h.backend.store.reviews();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].task_id, "review-1");
    assert_eq!(reviews[0].review.params[0].value, "prod only");
    assert_eq!(
        h.backend.store.build("b-1").unwrap().cancel_user.as_deref(),
        Some("alice")
    );
}

#[tokio::test]
async fn test_manual_start_stage() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());
    let mut stage = StageRuntimeState {
        build_id: "b-1".to_string(),
        stage_id: "stage-2".to_string(),
        status: BuildStatus::Running,
        control_option: StageControlOption {
            manual_trigger: true,
            trigger_users: vec!["alice".to_string()],
            review_params: Vec::new(),
        },
    };
    h.backend.store.put_stage(stage.clone());

    let err = h
        .service
        .build_manual_start_stage("alice", PROJECT, PIPELINE, "b-1", "stage-2", false, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::StageNotPaused);

    stage.status = BuildStatus::Pause;
    h.backend.store.put_stage(stage);

    let err = h
        .service
        .build_manual_start_stage("bob", PROJECT, PIPELINE, "b-1", "stage-2", false, None)
        .await
        .unwrap_err();
    assert!(err.is_permission_denied());

    let review = StageReviewRequest {
        review_params: vec![ManualReviewParam {
            key: "ticket".to_string(),
            value: "OPS-1".to_string(),
            required: true,
        }],
    };
    h.service
        .build_manual_start_stage("alice", PROJECT, PIPELINE, "b-1", "stage-2", false, Some(review))
        .await
        .unwrap();

    let actions = h.backend.store.stage_actions();
    assert!(matches!(
        &actions[..],
        [StageAction::Started { control_option, .. }] if control_option.review_params[0].value == "OPS-1"
    ));
}

// =============================================================================
// Paused tasks
// =============================================================================

#[tokio::test]
async fn test_pause_atom_with_identical_values() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());
    h.backend.store.put_task(paused_task("b-1", BuildStatus::Pause));

    h.service
        .execute_pause_atom(pause_request("b-1", checkout("main"), true))
        .await
        .unwrap();

    assert!(h.backend.store.pause_values().is_empty());
    assert!(h.backend.logs.lines().is_empty());
    let events = h.backend.events.events();
    assert!(matches!(
        &events[..],
        [PipelineEvent::TaskPause(e)] if e.action_type == ActionType::Refresh
    ));
}

#[tokio::test]
async fn test_pause_atom_records_edits() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());
    h.backend.store.put_task(paused_task("b-1", BuildStatus::Pause));

    let mut request = pause_request("b-1", checkout("release"), false);
    request.container_id = "job-reported".to_string();
    h.service.execute_pause_atom(request).await.unwrap();

    let lines: Vec<String> = h
        .backend
        .logs
        .lines()
        .into_iter()
        .map(|line| line.message)
        .collect();
    assert_eq!(
        lines,
        vec![
            "plugin: checkout, params branch updated:".to_string(),
            "before: main".to_string(),
            "after: release".to_string(),
        ]
    );
    assert_eq!(h.backend.logs.lines()[0].job_id, "startVM-job-1");

    let saved = h.backend.store.pause_values();
    assert_eq!(saved.len(), 1);
    let element: Element = serde_json::from_str(&saved[0].new_value).unwrap();
    assert_eq!(element, checkout("release"));

    let events = h.backend.events.events();
    assert!(matches!(
        &events[..],
        [PipelineEvent::TaskPause(e)] if e.action_type == ActionType::Terminate
    ));
}

#[tokio::test]
async fn test_pause_atom_rejections() {
    let h = harness_with(OrchestratorConfig {
        max_element_bytes: 32,
        ..OrchestratorConfig::default()
    });
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());
    h.backend.store.put_task(paused_task("b-1", BuildStatus::Running));

    let err = h
        .service
        .execute_pause_atom(pause_request("b-1", checkout("main"), true))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ElementTooLarge);

    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());
    h.backend.store.put_task(paused_task("b-1", BuildStatus::Running));
    let err = h
        .service
        .execute_pause_atom(pause_request("b-1", checkout("main"), true))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TaskNotPaused);
    assert!(h.backend.events.events().is_empty());
}

#[tokio::test]
async fn test_pause_atom_waits_for_build_lock() {
    let h = harness_with(OrchestratorConfig {
        lock_acquire_timeout: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    });
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());
    h.backend.store.put_task(paused_task("b-1", BuildStatus::Pause));

    let held = h.service.locks().acquire_build_lock("b-1").await.unwrap();
    let err = h
        .service
        .execute_pause_atom(pause_request("b-1", checkout("release"), true))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockTimeout);
    assert!(h.backend.events.events().is_empty());
    assert!(h.backend.store.pause_values().is_empty());

    held.release().await;
    h.service
        .execute_pause_atom(pause_request("b-1", checkout("release"), true))
        .await
        .unwrap();
    assert_eq!(h.backend.events.events().len(), 1);
    assert_eq!(h.backend.store.pause_values().len(), 1);
}

// =============================================================================
// Worker exits and reads
// =============================================================================

#[tokio::test]
async fn test_worker_build_finish_terminates_job() {
    let h = harness();
    h.backend
        .store
        .insert_build(record("b-1", BuildStatus::Running), default_model());

    let ok = WorkerResult {
        success: true,
        message: None,
    };
    h.service
        .worker_build_finish(PROJECT, PIPELINE, "b-1", "job-1", ok)
        .await
        .unwrap();
    assert!(h.backend.events.events().is_empty());

    let failed = WorkerResult {
        success: false,
        message: Some("out of memory".to_string()),
    };
    h.service
        .worker_build_finish(PROJECT, PIPELINE, "b-1", "job-9", failed.clone())
        .await
        .unwrap();
    assert!(h.backend.events.events().is_empty());

    // Ids reported by the worker are not trusted
    h.service
        .worker_build_finish("", "", "b-1", "job-1", failed)
        .await
        .unwrap();
    let events = h.backend.events.events();
    let [PipelineEvent::BuildContainer(event)] = &events[..] else {
        panic!("expected one container event, got {events:?}");
    };
    assert_eq!(event.project_id, PROJECT);
    assert_eq!(event.pipeline_id, PIPELINE);
    assert_eq!(event.stage_id, "stage-2");
    assert_eq!(event.container_type, "vmBuild");
    assert_eq!(event.action_type, ActionType::Terminate);
    assert_eq!(
        event.reason.as_deref(),
        Some("Job#job-1 worker exception: out of memory")
    );
}

#[tokio::test]
async fn test_build_reads() {
    let h = harness();
    let build_id = h
        .service
        .build_manual_startup(manual_request(&[("greeting", "hi")]))
        .await
        .unwrap();
    h.finish(&build_id, BuildStatus::Succeed).await;

    let params = h
        .service
        .get_build_parameters("alice", PROJECT, PIPELINE, &build_id, true)
        .await
        .unwrap();
    assert_eq!(params.value_of("greeting").as_deref(), Some("hi"));

    let vars = h
        .service
        .get_build_vars_by_names("alice", PROJECT, PIPELINE, &build_id, &["greeting".to_string()], true)
        .await
        .unwrap();
    assert_eq!(vars.len(), 1);

    let with_vars = h
        .service
        .get_build_status_with_vars("alice", PROJECT, PIPELINE, &build_id, true)
        .await
        .unwrap();
    assert_eq!(with_vars.build.status, BuildStatus::Succeed);
    assert!(with_vars.variables.contains_key(keys::PIPELINE_START_USER_ID));

    let mut foreign = record("b-foreign", BuildStatus::Running);
    foreign.project_id = "other".to_string();
    h.backend.store.insert_build(foreign, default_model());
    let batch = h
        .service
        .get_batch_build_status(PROJECT, &[build_id.clone(), "b-foreign".to_string()])
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);

    let latest = h
        .service
        .get_latest_success_build(PROJECT, PIPELINE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.build_id, build_id);

    h.service
        .update_remark("alice", PROJECT, PIPELINE, &build_id, Some("flaky".to_string()))
        .await
        .unwrap();
    assert_eq!(
        h.backend.store.build(&build_id).unwrap().remark.as_deref(),
        Some("flaky")
    );

    let err = h
        .service
        .update_remark("alice", PROJECT, "p-other", &build_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PipelineMismatch);
}
