//! Build parameter domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Well-known parameter keys written or read by the orchestrator
pub mod keys {
    pub const PIPELINE_VERSION: &str = "pipeline.version";
    pub const PIPELINE_NAME: &str = "pipeline.name";
    pub const PIPELINE_BUILD_MSG: &str = "pipeline.build.msg";
    pub const PIPELINE_START_USER_ID: &str = "pipeline.start.user.id";
    pub const PIPELINE_START_USER_NAME: &str = "pipeline.start.user.name";
    pub const PIPELINE_START_TYPE: &str = "pipeline.start.type";
    pub const PIPELINE_START_CHANNEL: &str = "pipeline.start.channel";
    pub const PIPELINE_START_MOBILE: &str = "pipeline.start.isMobile";
    pub const PIPELINE_START_TASK_ID: &str = "pipeline.start.task.id";
    pub const PIPELINE_START_WEBHOOK_USER_ID: &str = "pipeline.start.webhook.user.id";
    pub const PIPELINE_START_PIPELINE_USER_ID: &str = "pipeline.start.pipeline.user.id";
    pub const PIPELINE_START_PARENT_PIPELINE_ID: &str = "pipeline.start.parent.pipeline.id";
    pub const PIPELINE_START_PARENT_BUILD_ID: &str = "pipeline.start.parent.build.id";
    pub const PIPELINE_START_PARENT_BUILD_TASK_ID: &str = "pipeline.start.parent.build.task.id";
    pub const PIPELINE_RETRY_COUNT: &str = "pipeline.retry.count";
    pub const PIPELINE_RETRY_BUILD_ID: &str = "pipeline.retry.build.id";
    pub const PIPELINE_RETRY_START_TASK_ID: &str = "pipeline.retry.start.task.id";
    pub const BUILD_NO: &str = "BuildNo";

    /// Prefix of the per-element skip flags
    pub const SKIP_ELEMENT_PREFIX: &str = "pipeline.skip.element.";

    /// Skip-flag key for one element id
    pub fn skip_element(element_id: &str) -> String {
        format!("{SKIP_ELEMENT_PREFIX}{element_id}")
    }
}

/// Polymorphic parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl ParamValue {
    /// Coerces the value into the shape a declared type expects
    ///
    /// Booleans declared on the form accept the strings `"true"`/`"false"`;
    /// anything else keeps its original representation.
    pub fn coerce(self, param_type: ParamType) -> Self {
        match (param_type, self) {
            (ParamType::Boolean, ParamValue::String(s)) => match s.trim() {
                "true" => ParamValue::Bool(true),
                "false" => ParamValue::Bool(false),
                _ => ParamValue::String(s),
            },
            (_, value) => value,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Number(n) => write!(f, "{n}"),
            ParamValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Number(value.into())
    }
}

/// Declared type of a parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParamType {
    #[default]
    String,
    Text,
    Boolean,
    Enum,
    Number,
}

/// Where a parameter value came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Manual,
    TemplateDefault,
    PriorRun,
    System,
}

/// A startup parameter declared on the trigger container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFormProperty {
    pub id: String,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    pub default_value: ParamValue,
    #[serde(default)]
    pub desc: Option<String>,
}

/// One resolved parameter of a build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildParameter {
    pub key: String,
    pub value: ParamValue,
    #[serde(default)]
    pub value_type: Option<ParamType>,
    #[serde(default)]
    pub provenance: Provenance,
}

impl BuildParameter {
    pub fn new(key: impl Into<String>, value: impl Into<ParamValue>, provenance: Provenance) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            value_type: None,
            provenance,
        }
    }

    pub fn typed(mut self, value_type: ParamType) -> Self {
        self.value_type = Some(value_type);
        self
    }
}

/// Ordered parameter list with unique keys
///
/// Inserting an existing key replaces the value in place, so display order is
/// the order in which keys were first seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildParameters(Vec<BuildParameter>);

impl BuildParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, param: BuildParameter) {
        match self.0.iter_mut().find(|p| p.key == param.key) {
            Some(slot) => *slot = param,
            None => self.0.push(param),
        }
    }

    /// Inserts only when the key is not present yet
    pub fn insert_default(&mut self, param: BuildParameter) {
        if !self.contains(&param.key) {
            self.0.push(param);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<BuildParameter> {
        let index = self.0.iter().position(|p| p.key == key)?;
        Some(self.0.remove(index))
    }

    pub fn get(&self, key: &str) -> Option<&BuildParameter> {
        self.0.iter().find(|p| p.key == key)
    }

    /// Value of `key` rendered as a string
    pub fn value_of(&self, key: &str) -> Option<String> {
        self.get(key).map(|p| p.value.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BuildParameter> {
        self.0.iter()
    }

    /// Keeps only the parameters matching `pred`
    pub fn retain(&mut self, pred: impl FnMut(&BuildParameter) -> bool) {
        self.0.retain(pred);
    }

    /// Plain key/value view, as stored in a startup snapshot
    pub fn to_value_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.0
            .iter()
            .map(|p| {
                let value = serde_json::to_value(&p.value).unwrap_or(serde_json::Value::Null);
                (p.key.clone(), value)
            })
            .collect()
    }

    /// String view used for runtime variables
    pub fn to_string_map(&self) -> HashMap<String, String> {
        self.0
            .iter()
            .map(|p| (p.key.clone(), p.value.to_string()))
            .collect()
    }
}

impl FromIterator<BuildParameter> for BuildParameters {
    fn from_iter<I: IntoIterator<Item = BuildParameter>>(iter: I) -> Self {
        let mut params = BuildParameters::new();
        for param in iter {
            params.insert(param);
        }
        params
    }
}

impl IntoIterator for BuildParameters {
    type Item = BuildParameter;
    type IntoIter = std::vec::IntoIter<BuildParameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a BuildParameters {
    type Item = &'a BuildParameter;
    type IntoIter = std::slice::Iter<'a, BuildParameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
