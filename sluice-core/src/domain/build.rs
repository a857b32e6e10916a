//! Build domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Build record
///
/// Created when a build starts and mutated by every state transition.
/// Records are never deleted; their lifecycle is carried by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub build_id: String,
    pub pipeline_id: String,
    pub project_id: String,
    /// Model version this build executes
    pub version: i32,
    pub build_num: i32,
    pub trigger: StartType,
    pub channel: ChannelCode,
    pub status: BuildStatus,
    pub start_user: String,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub parent_build_id: Option<String>,
    pub parent_task_id: Option<String>,
    pub cancel_user: Option<String>,
    pub remark: Option<String>,
    pub retry_count: u32,
}

impl BuildRecord {
    /// Whether this build was started by a parent pipeline that is not itself
    pub fn parent_link(&self) -> Option<(&str, &str)> {
        if self.trigger != StartType::Pipeline {
            return None;
        }
        match (&self.parent_build_id, &self.parent_task_id) {
            (Some(build), Some(task)) if build != &self.build_id => Some((build, task)),
            _ => None,
        }
    }

    pub fn is_canceled_by_user(&self) -> bool {
        self.cancel_user
            .as_deref()
            .is_some_and(|user| !user.trim().is_empty())
    }
}

/// Build (and stage/task) execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Queue,
    Running,
    Pause,
    Reviewing,
    Succeed,
    Failed,
    Canceled,
    QualityCheckFail,
    Skip,
}

impl BuildStatus {
    /// Terminal states; only these may be retried
    pub const FINISHED: [BuildStatus; 4] = [
        BuildStatus::Succeed,
        BuildStatus::Failed,
        BuildStatus::Canceled,
        BuildStatus::QualityCheckFail,
    ];

    pub fn is_finish(self) -> bool {
        Self::FINISHED.contains(&self)
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            BuildStatus::Running | BuildStatus::Pause | BuildStatus::Reviewing
        )
    }

    /// Status shown to users; quality check failures read as plain failures
    pub fn display_status(self) -> Self {
        match self {
            BuildStatus::QualityCheckFail => BuildStatus::Failed,
            other => other,
        }
    }
}

/// How a build was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartType {
    Manual,
    TimeTrigger,
    WebHook,
    Service,
    Pipeline,
    Remote,
}

impl StartType {
    pub fn as_str(self) -> &'static str {
        match self {
            StartType::Manual => "MANUAL",
            StartType::TimeTrigger => "TIME_TRIGGER",
            StartType::WebHook => "WEB_HOOK",
            StartType::Service => "SERVICE",
            StartType::Pipeline => "PIPELINE",
            StartType::Remote => "REMOTE",
        }
    }

    /// Parses a stored start type; unknown names fall back to manual
    pub fn parse_or_manual(value: &str) -> Self {
        match value {
            "TIME_TRIGGER" => StartType::TimeTrigger,
            "WEB_HOOK" => StartType::WebHook,
            "SERVICE" => StartType::Service,
            "PIPELINE" => StartType::Pipeline,
            "REMOTE" => StartType::Remote,
            _ => StartType::Manual,
        }
    }
}

impl fmt::Display for StartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel a pipeline belongs to and a request arrives through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelCode {
    #[default]
    Bs,
    Am,
    Codecc,
    Git,
    Openapi,
}

impl ChannelCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelCode::Bs => "BS",
            ChannelCode::Am => "AM",
            ChannelCode::Codecc => "CODECC",
            ChannelCode::Git => "GIT",
            ChannelCode::Openapi => "OPENAPI",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BS" => Some(ChannelCode::Bs),
            "AM" => Some(ChannelCode::Am),
            "CODECC" => Some(ChannelCode::Codecc),
            "GIT" => Some(ChannelCode::Git),
            "OPENAPI" => Some(ChannelCode::Openapi),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_states() {
        assert!(BuildStatus::Succeed.is_finish());
        assert!(BuildStatus::Failed.is_finish());
        assert!(BuildStatus::Canceled.is_finish());
        assert!(BuildStatus::QualityCheckFail.is_finish());
        assert!(!BuildStatus::Running.is_finish());
        assert!(!BuildStatus::Pause.is_finish());
        assert!(!BuildStatus::Queue.is_finish());
    }

    #[test]
    fn test_display_status_folds_quality_fail() {
        assert_eq!(
            BuildStatus::QualityCheckFail.display_status(),
            BuildStatus::Failed
        );
        assert_eq!(BuildStatus::Running.display_status(), BuildStatus::Running);
    }

    #[test]
    fn test_start_type_round_trip_names() {
        for start_type in [
            StartType::Manual,
            StartType::TimeTrigger,
            StartType::WebHook,
            StartType::Service,
            StartType::Pipeline,
            StartType::Remote,
        ] {
            assert_eq!(StartType::parse_or_manual(start_type.as_str()), start_type);
        }
        assert_eq!(StartType::parse_or_manual(""), StartType::Manual);
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!(ChannelCode::parse("codecc"), Some(ChannelCode::Codecc));
        assert_eq!(ChannelCode::parse("nope"), None);
    }
}
