//! Orchestrator errors
//!
//! Every rejection surfaced to callers carries a stable [`ErrorCode`] and a
//! human-readable message. Not-found and permission failures are separate
//! variants so callers can always tell "absent" from "forbidden".

use std::fmt;
use thiserror::Error;

use crate::service::interceptor::InterceptStatus;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Kind of resource a lookup failed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Pipeline,
    Model,
    Build,
    Stage,
    Task,
    Element,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::Pipeline => "pipeline",
            Resource::Model => "pipeline model",
            Resource::Build => "build",
            Resource::Stage => "stage",
            Resource::Task => "task",
            Resource::Element => "element",
        })
    }
}

/// Stable machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    PipelineNotFound,
    ModelNotFound,
    BuildNotFound,
    StageNotFound,
    TaskNotFound,
    ElementNotFound,
    PermissionDenied,
    DuplicateRetry,
    CanceledByOtherUser,
    BuildFinished,
    StageNotPaused,
    TaskNotPaused,
    FrequencyLimited,
    PipelineMismatch,
    ChannelMismatch,
    ManualStartDenied,
    RemoteStartDenied,
    ElementTooLarge,
    InvalidModel,
    AdmissionRejected,
    ReviewerMismatch,
    Encoding,
    LockTimeout,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::PipelineNotFound => "PIPELINE_NOT_FOUND",
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::BuildNotFound => "BUILD_NOT_FOUND",
            ErrorCode::StageNotFound => "STAGE_NOT_FOUND",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::ElementNotFound => "ELEMENT_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::DuplicateRetry => "DUPLICATE_RETRY",
            ErrorCode::CanceledByOtherUser => "CANCELED_BY_OTHER_USER",
            ErrorCode::BuildFinished => "BUILD_ALREADY_FINISHED",
            ErrorCode::StageNotPaused => "STAGE_NOT_PAUSED",
            ErrorCode::TaskNotPaused => "TASK_NOT_PAUSED",
            ErrorCode::FrequencyLimited => "FREQUENCY_LIMITED",
            ErrorCode::PipelineMismatch => "PIPELINE_MISMATCH",
            ErrorCode::ChannelMismatch => "CHANNEL_MISMATCH",
            ErrorCode::ManualStartDenied => "MANUAL_START_DENIED",
            ErrorCode::RemoteStartDenied => "REMOTE_START_DENIED",
            ErrorCode::ElementTooLarge => "ELEMENT_TOO_LARGE",
            ErrorCode::InvalidModel => "INVALID_MODEL",
            ErrorCode::AdmissionRejected => "ADMISSION_REJECTED",
            ErrorCode::ReviewerMismatch => "REVIEWER_MISMATCH",
            ErrorCode::Encoding => "ENCODING_ERROR",
            ErrorCode::LockTimeout => "LOCK_TIMEOUT",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A pipeline, model, build, stage, task or element is absent
    #[error("{resource} '{id}' not found")]
    NotFound { resource: Resource, id: String },

    #[error("permission denied for user '{user_id}': {message}")]
    PermissionDenied { user_id: String, message: String },

    /// The requested transition clashes with the current state
    #[error("{message}")]
    Conflict { code: ErrorCode, message: String },

    #[error("pipeline '{pipeline_id}' is started too frequently")]
    FrequencyLimited { pipeline_id: String },

    #[error("{message}")]
    ValidationFailed { code: ErrorCode, message: String },

    /// An admission interceptor vetoed the request
    #[error("admission rejected ({status}): {message}")]
    AdmissionRejected {
        status: InterceptStatus,
        message: String,
    },

    #[error("user '{user_id}' is not in the reviewer list")]
    ReviewerMismatch { user_id: String },

    #[error("failed to decode persisted parameters: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("timed out acquiring lock '{key}'")]
    LockTimeout { key: String },

    /// A collaborator (storage, messaging, ...) failed
    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn not_found(resource: Resource, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn conflict(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            code,
            message: message.into(),
        }
    }

    /// Stable code of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { resource, .. } => match resource {
                Resource::Pipeline => ErrorCode::PipelineNotFound,
                Resource::Model => ErrorCode::ModelNotFound,
                Resource::Build => ErrorCode::BuildNotFound,
                Resource::Stage => ErrorCode::StageNotFound,
                Resource::Task => ErrorCode::TaskNotFound,
                Resource::Element => ErrorCode::ElementNotFound,
            },
            Self::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Self::Conflict { code, .. } | Self::ValidationFailed { code, .. } => *code,
            Self::FrequencyLimited { .. } => ErrorCode::FrequencyLimited,
            Self::AdmissionRejected { .. } => ErrorCode::AdmissionRejected,
            Self::ReviewerMismatch { .. } => ErrorCode::ReviewerMismatch,
            Self::Encoding(_) => ErrorCode::Encoding,
            Self::LockTimeout { .. } => ErrorCode::LockTimeout,
            Self::Repository(_) => ErrorCode::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}
