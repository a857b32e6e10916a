//! Parameter Resolver
//!
//! Builds the typed parameter list of a run from declared defaults, the
//! latest startup snapshot, caller-supplied values, retry state and the
//! system keys every build carries.

use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

use sluice_core::domain::build::{ChannelCode, StartType};
use sluice_core::domain::model::PipelineModel;
use sluice_core::domain::param::{
    BuildFormProperty, BuildParameter, BuildParameters, ParamType, ParamValue, Provenance, keys,
};
use sluice_core::domain::pipeline::PipelineInfo;

use crate::error::{OrchestratorError, Resource, Result};

// =============================================================================
// Startup snapshot
// =============================================================================

/// Decodes a stored startup snapshot; blank snapshots decode to nothing
pub fn decode_snapshot(raw: &str) -> Result<Map<String, JsonValue>> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// Startup snapshot of a run
///
/// Keeps the parameters declared on the trigger container plus the build
/// number and build message, encoded as a JSON object string.
pub fn startup_snapshot(model: &PipelineModel, params: &BuildParameters) -> Result<String> {
    let declared = model.trigger_param_ids();
    let snapshot: Map<String, JsonValue> = params
        .to_value_map()
        .into_iter()
        .filter(|(key, _)| {
            declared.contains(key) || key == keys::BUILD_NO || key == keys::PIPELINE_BUILD_MSG
        })
        .collect();
    Ok(serde_json::to_string(&snapshot)?)
}

/// Parameters of a stored snapshot as shown to users, skip flags excluded
pub fn snapshot_params(raw: &str) -> Result<BuildParameters> {
    Ok(decode_snapshot(raw)?
        .into_iter()
        .filter(|(key, _)| !key.starts_with(keys::SKIP_ELEMENT_PREFIX))
        .map(|(key, value)| BuildParameter::new(key, json_to_param(value), Provenance::PriorRun))
        .collect())
}

pub(crate) fn json_to_param(value: JsonValue) -> ParamValue {
    match value {
        JsonValue::Bool(b) => ParamValue::Bool(b),
        JsonValue::Number(n) => ParamValue::Number(n),
        JsonValue::String(s) => ParamValue::String(s),
        JsonValue::Null => ParamValue::String(String::new()),
        other => ParamValue::String(other.to_string()),
    }
}

// =============================================================================
// Startup form
// =============================================================================

/// Form entry for the build message, always shown first
pub fn build_msg_property() -> BuildFormProperty {
    BuildFormProperty {
        id: keys::PIPELINE_BUILD_MSG.to_string(),
        required: true,
        param_type: ParamType::String,
        default_value: ParamValue::from(""),
        desc: Some("Build message".to_string()),
    }
}

/// Replaces declared defaults with the values of a prior run
///
/// Keys absent from the snapshot keep their declared default. Boolean
/// defaults read the stored value as a boolean.
pub fn overlay_latest(properties: &mut [BuildFormProperty], snapshot: &Map<String, JsonValue>) {
    for property in properties.iter_mut() {
        let Some(stored) = snapshot.get(&property.id) else {
            continue;
        };
        let value = json_to_param(stored.clone());
        property.default_value = match property.default_value {
            ParamValue::Bool(_) => ParamValue::Bool(value.to_string().trim() == "true"),
            _ => value,
        };
    }
}

// =============================================================================
// Start parameters
// =============================================================================

/// Parameters of a manual or remote start
///
/// Only declared parameters are taken: supplied values win over defaults and
/// are coerced to the declared type. A supplied build message is kept too.
pub fn parse_manual_start_params(model: &PipelineModel, values: &HashMap<String, String>) -> BuildParameters {
    let mut params: BuildParameters = model
        .trigger()
        .map(|trigger| {
            trigger
                .params
                .iter()
                .map(|property| {
                    let (value, provenance) = match values.get(&property.id) {
                        Some(value) => (
                            ParamValue::from(value.as_str()).coerce(property.param_type),
                            Provenance::Manual,
                        ),
                        None => (property.default_value.clone(), Provenance::TemplateDefault),
                    };
                    BuildParameter {
                        key: property.id.clone(),
                        value,
                        value_type: Some(property.param_type),
                        provenance,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(msg) = values.get(keys::PIPELINE_BUILD_MSG) {
        params.insert(BuildParameter::new(
            keys::PIPELINE_BUILD_MSG,
            msg.as_str(),
            Provenance::Manual,
        ));
    }
    params
}

/// Fills declared defaults in behind the given inputs
pub fn merge_with_defaults(model: &PipelineModel, inputs: BuildParameters) -> BuildParameters {
    let mut params = inputs;
    if let Some(trigger) = model.trigger() {
        for property in &trigger.params {
            params.insert_default(
                BuildParameter::new(
                    property.id.clone(),
                    property.default_value.clone(),
                    Provenance::TemplateDefault,
                )
                .typed(property.param_type),
            );
        }
    }
    params
}

// =============================================================================
// Retry
// =============================================================================

/// Where a scoped retry resumes
///
/// Depth-first in declaration order: a stage with that id, else the first
/// element of a container with that id, else the element with that id.
pub fn find_retry_anchor(model: &PipelineModel, task_id: &str) -> Option<String> {
    for stage in &model.stages {
        if stage.id.as_deref() == Some(task_id) {
            return Some(task_id.to_string());
        }
        for container in &stage.containers {
            let container_matches = container.id.as_deref() == Some(task_id);
            for (index, element) in container.elements.iter().enumerate() {
                if container_matches && index == 0 {
                    if let Some(id) = &element.id {
                        return Some(id.clone());
                    }
                }
                if element.id.as_deref() == Some(task_id) {
                    return Some(task_id.to_string());
                }
            }
        }
    }
    None
}

/// Retry count of the next run: previous count plus one, or 1
pub fn next_retry_count(vars: &HashMap<String, String>, reused: &BuildParameters) -> u32 {
    vars.get(keys::PIPELINE_RETRY_COUNT)
        .cloned()
        .or_else(|| reused.value_of(keys::PIPELINE_RETRY_COUNT))
        .and_then(|count| count.trim().parse::<u32>().ok())
        .map_or(1, |count| count + 1)
}

/// Previous run of a retry
pub struct RetrySource<'a> {
    pub build_id: &'a str,
    pub model: &'a PipelineModel,
    /// Runtime variables of the build
    pub vars: &'a HashMap<String, String>,
    /// Raw startup snapshot of the build
    pub snapshot: Option<&'a str>,
}

/// Parameters of a retry run
///
/// A scoped retry (`task_id` given) reuses the runtime variables and sets the
/// resume anchor. A full retry reuses the startup snapshot minus any previous
/// anchor.
pub fn retry_params(source: &RetrySource<'_>, task_id: Option<&str>, user_id: &str) -> Result<BuildParameters> {
    let mut params = match task_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(task_id) => {
            let anchor = find_retry_anchor(source.model, task_id)
                .ok_or_else(|| OrchestratorError::not_found(Resource::Task, task_id))?;

            let mut vars: Vec<_> = source.vars.iter().collect();
            vars.sort_by(|a, b| a.0.cmp(b.0));
            let mut params: BuildParameters = vars
                .into_iter()
                .map(|(key, value)| BuildParameter::new(key.clone(), value.as_str(), Provenance::PriorRun))
                .collect();
            params.insert(BuildParameter::new(
                keys::PIPELINE_RETRY_START_TASK_ID,
                anchor,
                Provenance::System,
            ));
            params
        }
        None => {
            let snapshot = match source.snapshot {
                Some(raw) => decode_snapshot(raw)?,
                None => Map::new(),
            };
            snapshot
                .into_iter()
                .filter(|(key, _)| key != keys::PIPELINE_RETRY_START_TASK_ID)
                .map(|(key, value)| BuildParameter::new(key, json_to_param(value), Provenance::PriorRun))
                .collect()
        }
    };

    let retry_count = next_retry_count(source.vars, &params);
    let original = |key: &str| source.vars.get(key).cloned().unwrap_or_default();

    params.insert(BuildParameter::new(
        keys::PIPELINE_RETRY_COUNT,
        i64::from(retry_count),
        Provenance::System,
    ));
    params.insert(BuildParameter::new(keys::PIPELINE_START_USER_ID, user_id, Provenance::System));
    params.insert(BuildParameter::new(
        keys::PIPELINE_RETRY_BUILD_ID,
        source.build_id,
        Provenance::System,
    ));
    params.insert(BuildParameter::new(
        keys::PIPELINE_START_TYPE,
        original(keys::PIPELINE_START_TYPE),
        Provenance::System,
    ));
    params.insert(BuildParameter::new(
        keys::PIPELINE_START_TASK_ID,
        original(keys::PIPELINE_START_TASK_ID),
        Provenance::System,
    ));
    Ok(params)
}

/// Start type a retry runs with: the original one, manual when unknown
pub fn retry_start_type(vars: &HashMap<String, String>) -> StartType {
    vars.get(keys::PIPELINE_START_TYPE)
        .map_or(StartType::Manual, |value| StartType::parse_or_manual(value))
}

// =============================================================================
// System parameters
// =============================================================================

/// Build message used when the caller gave none
pub fn default_build_msg(start_type: StartType, channel: ChannelCode) -> &'static str {
    match start_type {
        StartType::Manual => "Manually triggered",
        StartType::TimeTrigger => "Triggered by schedule",
        StartType::WebHook => "Triggered by webhook",
        StartType::Service if channel == ChannelCode::Codecc => "Triggered by CodeCC",
        StartType::Service => "Triggered by service",
        StartType::Pipeline => "Triggered by parent pipeline",
        StartType::Remote => "Triggered remotely",
    }
}

pub fn effective_build_msg(msg: Option<&str>, start_type: StartType, channel: ChannelCode) -> String {
    match msg.map(str::trim).filter(|m| !m.is_empty()) {
        Some(msg) => msg.to_string(),
        None => default_build_msg(start_type, channel).to_string(),
    }
}

/// Keys every build carries, overwriting whatever the caller passed
pub struct SystemParams<'a> {
    pub pipeline: &'a PipelineInfo,
    pub user_id: &'a str,
    pub start_user_name: &'a str,
    pub start_type: StartType,
    pub channel: ChannelCode,
    pub is_mobile: bool,
    pub build_msg: String,
}

impl SystemParams<'_> {
    pub fn apply(self, params: &mut BuildParameters) {
        let system = [
            (keys::PIPELINE_VERSION, ParamValue::from(i64::from(self.pipeline.version))),
            (keys::PIPELINE_START_USER_ID, ParamValue::from(self.user_id)),
            (keys::PIPELINE_START_TYPE, ParamValue::from(self.start_type.as_str())),
            (keys::PIPELINE_START_CHANNEL, ParamValue::from(self.channel.as_str())),
            (keys::PIPELINE_START_MOBILE, ParamValue::from(self.is_mobile)),
            (keys::PIPELINE_NAME, ParamValue::from(self.pipeline.pipeline_name.as_str())),
            (keys::PIPELINE_START_USER_NAME, ParamValue::from(self.start_user_name)),
            (keys::PIPELINE_BUILD_MSG, ParamValue::from(self.build_msg)),
        ];
        for (key, value) in system {
            params.insert(BuildParameter::new(key, value, Provenance::System));
        }
    }
}
