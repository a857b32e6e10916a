//! Pipeline model domain types
//!
//! A model is the declarative shape of a pipeline: stages hold containers,
//! containers hold elements. Stage 0 is always the trigger stage.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::element::{Element, ElementKind};
use crate::domain::param::BuildFormProperty;

/// Structural problems found while validating a model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("pipeline model has no stages")]
    NoStages,

    #[error("trigger stage must hold exactly one container, found {0}")]
    TriggerContainerCount(usize),

    #[error("first container of the trigger stage is not a trigger container")]
    NotATriggerContainer,

    #[error("stage {0} is empty")]
    EmptyStage(usize),

    #[error("element '{0}' appears more than once")]
    DuplicateElementId(String),
}

/// Pipeline model
///
/// Structure shared between the orchestrator (rewrites and persists) and the
/// execution runtime (walks it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineModel {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub instance_from_template: bool,
}

impl PipelineModel {
    /// Checks the stage/container invariants every model must satisfy
    pub fn validate(&self) -> Result<(), ModelError> {
        let trigger_stage = self.stages.first().ok_or(ModelError::NoStages)?;
        if trigger_stage.containers.len() != 1 {
            return Err(ModelError::TriggerContainerCount(
                trigger_stage.containers.len(),
            ));
        }
        if !trigger_stage.containers[0].is_trigger() {
            return Err(ModelError::NotATriggerContainer);
        }

        for (index, stage) in self.stages.iter().enumerate().skip(1) {
            if stage.containers.is_empty() {
                return Err(ModelError::EmptyStage(index));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for element in self.elements() {
            if let Some(id) = &element.id {
                if !seen.insert(id.as_str()) {
                    return Err(ModelError::DuplicateElementId(id.clone()));
                }
            }
        }

        Ok(())
    }

    /// The trigger container's options, if the model is well formed
    pub fn trigger(&self) -> Option<&TriggerOptions> {
        self.stages
            .first()
            .and_then(|stage| stage.containers.first())
            .and_then(|container| match &container.kind {
                ContainerKind::Trigger(options) => Some(options),
                _ => None,
            })
    }

    /// Elements of the trigger container
    pub fn trigger_elements(&self) -> &[Element] {
        self.stages
            .first()
            .and_then(|stage| stage.containers.first())
            .map(|container| container.elements.as_slice())
            .unwrap_or_default()
    }

    /// Ids of the parameters declared on the trigger container
    pub fn trigger_param_ids(&self) -> Vec<String> {
        self.trigger()
            .map(|t| t.params.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether an enabled manual-trigger element exists
    pub fn can_manual_startup(&self) -> bool {
        self.enabled_trigger(|kind| matches!(kind, ElementKind::ManualTrigger { .. }))
            .is_some()
    }

    /// Whether an enabled remote-trigger element exists
    pub fn can_remote_startup(&self) -> bool {
        self.enabled_trigger(|kind| matches!(kind, ElementKind::RemoteTrigger { .. }))
            .is_some()
    }

    /// First enabled trigger element whose kind satisfies `pred`
    pub fn enabled_trigger(&self, pred: impl Fn(&ElementKind) -> bool) -> Option<&Element> {
        self.trigger_elements()
            .iter()
            .find(|e| e.enabled && pred(&e.kind))
    }

    /// All elements of the model in declaration order, trigger stage included
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.stages
            .iter()
            .flat_map(|s| s.containers.iter())
            .flat_map(|c| c.elements.iter())
    }

    /// Finds an element by id outside the trigger stage
    pub fn find_element(&self, element_id: &str) -> Option<&Element> {
        self.stages
            .iter()
            .skip(1)
            .flat_map(|s| s.containers.iter())
            .flat_map(|c| c.elements.iter())
            .find(|e| e.id.as_deref() == Some(element_id))
    }

    /// Replaces the element with the same id, returning whether one matched
    pub fn replace_element(&mut self, replacement: Element) -> bool {
        let Some(id) = replacement.id.clone() else {
            return false;
        };
        for stage in self.stages.iter_mut().skip(1) {
            for container in &mut stage.containers {
                if let Some(slot) = container
                    .elements
                    .iter_mut()
                    .find(|e| e.id.as_deref() == Some(id.as_str()))
                {
                    *slot = replacement;
                    return true;
                }
            }
        }
        false
    }
}

/// A stage groups containers that run in parallel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub containers: Vec<Container>,
}

/// A container (job) runs its elements sequentially
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub kind: ContainerKind,
    #[serde(default)]
    pub elements: Vec<Element>,
}

impl Container {
    pub fn is_trigger(&self) -> bool {
        matches!(self.kind, ContainerKind::Trigger(_))
    }

    /// Short type name used in container events
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ContainerKind::Trigger(_) => "trigger",
            ContainerKind::VmBuild => "vmBuild",
            ContainerKind::Normal => "normal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type", rename_all = "camelCase")]
pub enum ContainerKind {
    Trigger(TriggerOptions),
    VmBuild,
    Normal,
}

/// Trigger container options: declared startup parameters and build number
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerOptions {
    #[serde(default)]
    pub params: Vec<BuildFormProperty>,
    #[serde(default)]
    pub build_no: Option<BuildNo>,
}

/// Build number declaration of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildNo {
    pub build_no: i32,
    #[serde(default)]
    pub required: bool,
}
