//! Manual review domain types

use serde::{Deserialize, Serialize};

use crate::domain::element::ManualReviewParam;

/// Decision of a reviewer on a manual review element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualReviewAction {
    Process,
    Abort,
}

/// Review request and resolved review form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewParam {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub pipeline_id: String,
    #[serde(default)]
    pub build_id: String,
    #[serde(default)]
    pub review_users: Vec<String>,
    #[serde(default)]
    pub status: Option<ManualReviewAction>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub suggest: String,
    #[serde(default)]
    pub params: Vec<ManualReviewParam>,
}

/// Review parameters supplied when manually starting a paused stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReviewRequest {
    #[serde(default)]
    pub review_params: Vec<ManualReviewParam>,
}
