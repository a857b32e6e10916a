//! Element domain types
//!
//! Elements are the build steps of a container. Each concrete kind carries its
//! own payload; callers dispatch on [`ElementKind`] with an exhaustive match.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Version assumed for marketplace elements that do not pin one
pub const DEFAULT_MARKET_VERSION: &str = "1.*";

/// A single step in a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Set by the model rewriter when the run asked to skip this element
    #[serde(default)]
    pub skipped: bool,
    /// Present on companion elements synthesized for post-processing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_info: Option<PostInfo>,
    #[serde(flatten)]
    pub kind: ElementKind,
}

fn enabled_by_default() -> bool {
    true
}

/// Concrete element kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type", rename_all = "camelCase")]
pub enum ElementKind {
    #[serde(rename_all = "camelCase")]
    ManualTrigger {
        #[serde(default)]
        can_element_skip: bool,
        #[serde(default)]
        use_latest_parameters: bool,
    },
    #[serde(rename_all = "camelCase")]
    RemoteTrigger {
        #[serde(default)]
        remote_token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TimerTrigger {
        #[serde(default)]
        cron: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    WebhookTrigger {
        repository: String,
        #[serde(default)]
        event_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MarketBuild {
        atom_code: String,
        #[serde(default)]
        version: String,
        #[serde(default)]
        input: Map<String, JsonValue>,
    },
    #[serde(rename_all = "camelCase")]
    MarketBuildLess {
        atom_code: String,
        #[serde(default)]
        version: String,
        #[serde(default)]
        input: Map<String, JsonValue>,
    },
    LinuxScript {
        script: String,
    },
    #[serde(rename_all = "camelCase")]
    ManualReviewUserTask {
        review_users: Vec<String>,
        #[serde(default)]
        desc: Option<String>,
        #[serde(default)]
        params: Vec<ManualReviewParam>,
    },
    #[serde(rename_all = "camelCase")]
    SubPipelineCall {
        sub_pipeline_id: String,
        #[serde(default)]
        parameters: Map<String, JsonValue>,
    },
    #[serde(rename_all = "camelCase")]
    QualityGateIn {
        intercept_task: String,
        #[serde(default)]
        intercept_task_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    QualityGateOut {
        intercept_task: String,
        #[serde(default)]
        intercept_task_name: Option<String>,
    },
}

/// Link from a synthesized post element back to the element that owns it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostInfo {
    pub parent_element_id: String,
    pub post_entry: String,
}

/// One editable parameter of a manual review element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualReviewParam {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub required: bool,
}

impl Element {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
            enabled: true,
            skipped: false,
            post_info: None,
            kind,
        }
    }

    pub fn manual_trigger(id: impl Into<String>) -> Self {
        Self::new(
            id,
            "manual",
            ElementKind::ManualTrigger {
                can_element_skip: false,
                use_latest_parameters: false,
            },
        )
    }

    pub fn script(id: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(
            id,
            "script",
            ElementKind::LinuxScript {
                script: script.into(),
            },
        )
    }

    pub fn market(id: impl Into<String>, atom_code: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(
            id,
            "market",
            ElementKind::MarketBuild {
                atom_code: atom_code.into(),
                version: version.into(),
                input: Map::new(),
            },
        )
    }

    /// Code used to match quality rules and marketplace metadata
    pub fn atom_code(&self) -> &str {
        match &self.kind {
            ElementKind::MarketBuild { atom_code, .. }
            | ElementKind::MarketBuildLess { atom_code, .. } => atom_code,
            ElementKind::ManualTrigger { .. } => "manualTrigger",
            ElementKind::RemoteTrigger { .. } => "remoteTrigger",
            ElementKind::TimerTrigger { .. } => "timerTrigger",
            ElementKind::WebhookTrigger { .. } => "webhookTrigger",
            ElementKind::LinuxScript { .. } => "linuxScript",
            ElementKind::ManualReviewUserTask { .. } => "manualReviewUserTask",
            ElementKind::SubPipelineCall { .. } => "subPipelineCall",
            ElementKind::QualityGateIn { .. } => "qualityGateInTask",
            ElementKind::QualityGateOut { .. } => "qualityGateOutTask",
        }
    }

    pub fn is_quality_gate(&self) -> bool {
        matches!(
            self.kind,
            ElementKind::QualityGateIn { .. } | ElementKind::QualityGateOut { .. }
        )
    }

    pub fn is_market(&self) -> bool {
        matches!(
            self.kind,
            ElementKind::MarketBuild { .. } | ElementKind::MarketBuildLess { .. }
        )
    }

    /// Marketplace version, if this is a marketplace element
    pub fn market_version(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::MarketBuild { version, .. }
            | ElementKind::MarketBuildLess { version, .. } => Some(version),
            _ => None,
        }
    }

    /// Input parameters the element exposes for editing and diffing
    pub fn input(&self) -> Map<String, JsonValue> {
        match &self.kind {
            ElementKind::MarketBuild { input, .. } | ElementKind::MarketBuildLess { input, .. } => {
                input.clone()
            }
            ElementKind::LinuxScript { script } => {
                let mut map = Map::new();
                map.insert("script".to_string(), JsonValue::String(script.clone()));
                map
            }
            ElementKind::SubPipelineCall { parameters, .. } => parameters.clone(),
            ElementKind::ManualReviewUserTask { params, .. } => params
                .iter()
                .map(|p| (p.key.clone(), JsonValue::String(p.value.clone())))
                .collect(),
            _ => Map::new(),
        }
    }
}
