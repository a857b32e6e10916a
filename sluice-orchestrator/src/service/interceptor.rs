//! Interceptor Chain
//!
//! Ordered admission checks run before a build (or a paused stage) is let
//! through. The first interceptor that does not answer OK decides the result.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use sluice_core::domain::build::StartType;
use sluice_core::domain::model::PipelineModel;
use sluice_core::domain::pipeline::{PipelineInfo, RunLockType};

use crate::repository::BuildRepository;

/// Outcome category of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptStatus {
    Ok,
    PipelineLocked,
    QuotaExceeded,
    FreezeWindow,
}

impl InterceptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InterceptStatus::Ok => "OK",
            InterceptStatus::PipelineLocked => "PIPELINE_LOCKED",
            InterceptStatus::QuotaExceeded => "QUOTA_EXCEEDED",
            InterceptStatus::FreezeWindow => "FREEZE_WINDOW",
        }
    }
}

impl fmt::Display for InterceptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptResult {
    pub status: InterceptStatus,
    pub message: String,
}

impl InterceptResult {
    pub fn ok() -> Self {
        Self {
            status: InterceptStatus::Ok,
            message: String::new(),
        }
    }

    pub fn reject(status: InterceptStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == InterceptStatus::Ok
    }
}

/// What an interceptor gets to look at
///
/// `model` is `None` when no new build is being admitted (resuming a paused
/// stage of an existing build).
pub struct InterceptData<'a> {
    pub pipeline: &'a PipelineInfo,
    pub model: Option<&'a PipelineModel>,
    pub start_type: StartType,
}

#[async_trait]
pub trait PipelineInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, data: &InterceptData<'_>) -> anyhow::Result<InterceptResult>;
}

/// Runs interceptors in registration order
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn PipelineInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Arc<dyn PipelineInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Run-lock, running-quota and freeze-window checks, in that order
    pub fn standard(builds: Arc<dyn BuildRepository>, windows: Vec<FreezeWindow>) -> Self {
        Self::new()
            .with(Arc::new(RunLockInterceptor))
            .with(Arc::new(RunningQuotaInterceptor::new(builds)))
            .with(Arc::new(FreezeWindowInterceptor::new(windows)))
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn filter(&self, data: &InterceptData<'_>) -> anyhow::Result<InterceptResult> {
        for interceptor in &self.interceptors {
            let result = interceptor.execute(data).await?;
            if !result.is_ok() {
                tracing::warn!(
                    pipeline_id = %data.pipeline.pipeline_id,
                    interceptor = interceptor.name(),
                    status = %result.status,
                    "admission rejected: {}",
                    result.message
                );
                return Ok(result);
            }
        }
        Ok(InterceptResult::ok())
    }
}

// =============================================================================
// Built-in interceptors
// =============================================================================

/// Rejects pipelines whose settings lock them against running
pub struct RunLockInterceptor;

#[async_trait]
impl PipelineInterceptor for RunLockInterceptor {
    fn name(&self) -> &'static str {
        "run_lock"
    }

    async fn execute(&self, data: &InterceptData<'_>) -> anyhow::Result<InterceptResult> {
        if data.pipeline.setting.run_lock_type == RunLockType::Lock {
            return Ok(InterceptResult::reject(
                InterceptStatus::PipelineLocked,
                format!("pipeline {} is locked", data.pipeline.pipeline_id),
            ));
        }
        Ok(InterceptResult::ok())
    }
}

/// Caps how many builds of a pipeline run at once
///
/// Single-run pipelines allow one running build. Only applies when a new
/// build is being admitted.
pub struct RunningQuotaInterceptor {
    builds: Arc<dyn BuildRepository>,
}

impl RunningQuotaInterceptor {
    pub fn new(builds: Arc<dyn BuildRepository>) -> Self {
        Self { builds }
    }
}

#[async_trait]
impl PipelineInterceptor for RunningQuotaInterceptor {
    fn name(&self) -> &'static str {
        "running_quota"
    }

    async fn execute(&self, data: &InterceptData<'_>) -> anyhow::Result<InterceptResult> {
        if data.model.is_none() {
            return Ok(InterceptResult::ok());
        }

        let limit = match data.pipeline.setting.run_lock_type {
            RunLockType::Single => Some(1),
            _ => data.pipeline.setting.max_concurrency,
        };
        let Some(limit) = limit else {
            return Ok(InterceptResult::ok());
        };

        let running = self
            .builds
            .count_running_builds(&data.pipeline.pipeline_id)
            .await?;
        if running >= limit {
            return Ok(InterceptResult::reject(
                InterceptStatus::QuotaExceeded,
                format!("{running} builds already running, limit is {limit}"),
            ));
        }
        Ok(InterceptResult::ok())
    }
}

/// Time-of-day window, in UTC; wraps past midnight when `start > end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl FreezeWindow {
    pub fn contains(&self, at: NaiveTime) -> bool {
        if self.start <= self.end {
            at >= self.start && at < self.end
        } else {
            at >= self.start || at < self.end
        }
    }
}

impl FromStr for FreezeWindow {
    type Err = anyhow::Error;

    /// Parses `HH:MM-HH:MM`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("freeze window '{s}' must look like HH:MM-HH:MM"))?;
        Ok(Self {
            start: NaiveTime::parse_from_str(start.trim(), "%H:%M")?,
            end: NaiveTime::parse_from_str(end.trim(), "%H:%M")?,
        })
    }
}

impl fmt::Display for FreezeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute()
        )
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Rejects admissions that fall inside a freeze window
pub struct FreezeWindowInterceptor {
    windows: Vec<FreezeWindow>,
    clock: Clock,
}

impl FreezeWindowInterceptor {
    pub fn new(windows: Vec<FreezeWindow>) -> Self {
        Self::with_clock(windows, Arc::new(Utc::now))
    }

    pub fn with_clock(windows: Vec<FreezeWindow>, clock: Clock) -> Self {
        Self { windows, clock }
    }
}

#[async_trait]
impl PipelineInterceptor for FreezeWindowInterceptor {
    fn name(&self) -> &'static str {
        "freeze_window"
    }

    async fn execute(&self, _data: &InterceptData<'_>) -> anyhow::Result<InterceptResult> {
        let now = (self.clock)().time();
        match self.windows.iter().find(|w| w.contains(now)) {
            Some(window) => Ok(InterceptResult::reject(
                InterceptStatus::FreezeWindow,
                format!("builds are frozen during {window} UTC"),
            )),
            None => Ok(InterceptResult::ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sluice_core::domain::build::{BuildRecord, BuildStatus, ChannelCode};
    use sluice_core::domain::pipeline::PipelineSetting;

    use crate::repository::memory::MemoryStore;

    fn pipeline(setting: PipelineSetting) -> PipelineInfo {
        PipelineInfo {
            project_id: "proj".to_string(),
            pipeline_id: "p-1".to_string(),
            pipeline_name: "demo".to_string(),
            version: 1,
            channel: ChannelCode::Bs,
            creator: "alice".to_string(),
            last_modify_user: "alice".to_string(),
            setting,
        }
    }

    fn model() -> PipelineModel {
        PipelineModel {
            name: "demo".to_string(),
            description: None,
            stages: vec![],
            instance_from_template: false,
        }
    }

    fn running_build(id: &str) -> BuildRecord {
        BuildRecord {
            build_id: id.to_string(),
            pipeline_id: "p-1".to_string(),
            project_id: "proj".to_string(),
            version: 1,
            build_num: 1,
            trigger: StartType::Manual,
            channel: ChannelCode::Bs,
            status: BuildStatus::Running,
            start_user: "alice".to_string(),
            start_time: None,
            end_time: None,
            parent_build_id: None,
            parent_task_id: None,
            cancel_user: None,
            remark: None,
            retry_count: 0,
        }
    }

    struct Reject;

    #[async_trait]
    impl PipelineInterceptor for Reject {
        fn name(&self) -> &'static str {
            "reject"
        }

        async fn execute(&self, _data: &InterceptData<'_>) -> anyhow::Result<InterceptResult> {
            Ok(InterceptResult::reject(InterceptStatus::QuotaExceeded, "no"))
        }
    }

    #[tokio::test]
    async fn test_first_rejection_wins() {
        let info = pipeline(PipelineSetting {
            run_lock_type: RunLockType::Lock,
            max_concurrency: None,
        });
        let chain = InterceptorChain::new()
            .with(Arc::new(RunLockInterceptor))
            .with(Arc::new(Reject));
        let data = InterceptData {
            pipeline: &info,
            model: None,
            start_type: StartType::Manual,
        };

        let result = chain.filter(&data).await.unwrap();
        assert_eq!(result.status, InterceptStatus::PipelineLocked);
    }

    #[tokio::test]
    async fn test_empty_chain_admits() {
        let info = pipeline(PipelineSetting::default());
        let data = InterceptData {
            pipeline: &info,
            model: None,
            start_type: StartType::Manual,
        };
        assert!(InterceptorChain::new().filter(&data).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_running_quota() {
        let store = Arc::new(MemoryStore::new());
        store.insert_build(running_build("b-1"), model());
        let quota = RunningQuotaInterceptor::new(store.clone());

        let single = pipeline(PipelineSetting {
            run_lock_type: RunLockType::Single,
            max_concurrency: None,
        });
        let m = model();
        let admitting = InterceptData {
            pipeline: &single,
            model: Some(&m),
            start_type: StartType::Manual,
        };
        let result = quota.execute(&admitting).await.unwrap();
        assert_eq!(result.status, InterceptStatus::QuotaExceeded);

        // Resuming a stage admits no new build
        let resuming = InterceptData {
            pipeline: &single,
            model: None,
            start_type: StartType::Manual,
        };
        assert!(quota.execute(&resuming).await.unwrap().is_ok());

        let roomy = pipeline(PipelineSetting {
            run_lock_type: RunLockType::Multiple,
            max_concurrency: Some(2),
        });
        let data = InterceptData {
            pipeline: &roomy,
            model: Some(&m),
            start_type: StartType::Manual,
        };
        assert!(quota.execute(&data).await.unwrap().is_ok());
    }

    #[test]
    fn test_freeze_window_wraps_midnight() {
        let window: FreezeWindow = "22:00-06:00".parse().unwrap();
        assert!(window.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(5, 59, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(6, 0, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        assert_eq!(window.to_string(), "22:00-06:00");
        assert!("22:00".parse::<FreezeWindow>().is_err());
    }

    #[tokio::test]
    async fn test_freeze_window_interceptor() {
        let windows = vec!["12:00-13:00".parse().unwrap()];
        let at_noon = FreezeWindowInterceptor::with_clock(
            windows.clone(),
            Arc::new(|| Utc.with_ymd_and_hms(2026, 3, 2, 12, 30, 0).unwrap()),
        );
        let evening = FreezeWindowInterceptor::with_clock(
            windows,
            Arc::new(|| Utc.with_ymd_and_hms(2026, 3, 2, 18, 0, 0).unwrap()),
        );
        let info = pipeline(PipelineSetting::default());
        let data = InterceptData {
            pipeline: &info,
            model: None,
            start_type: StartType::TimeTrigger,
        };

        assert_eq!(
            at_noon.execute(&data).await.unwrap().status,
            InterceptStatus::FreezeWindow
        );
        assert!(evening.execute(&data).await.unwrap().is_ok());
    }
}
