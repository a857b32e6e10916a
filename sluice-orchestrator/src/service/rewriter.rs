//! Model Rewriter
//!
//! Turns a declared model into the model one run executes. The structural
//! pass ([`rewrite_model`]) is pure and returns a new model; the
//! [`ModelRewriter`] then merges post-processing companions resolved by the
//! element metadata service.
//!
//! Per element of stages 1.. in declaration order:
//! - quality gates of earlier rewrites are dropped
//! - companions of earlier rewrites are dropped when post handling is on
//! - elements without an id get one
//! - `pipeline.skip.element.<id> = "true"` marks the element skipped
//! - gate elements go before/after elements bound by a quality rule, unless
//!   the element is skipped

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use sluice_core::domain::element::Element;
use sluice_core::domain::model::PipelineModel;
use sluice_core::domain::param::{BuildParameter, BuildParameters, Provenance, keys};
use sluice_core::domain::quality::{ControlPointPosition, QualityRuleSet};
use sluice_core::dto::element::{ElementBaseInfo, PostElementBatch};

use crate::repository::ElementMetadataService;

/// Inputs of one structural rewrite
pub struct RewriteInput<'a> {
    pub model: &'a PipelineModel,
    pub params: &'a BuildParameters,
    pub quality: &'a QualityRuleSet,
    /// Raw start values; skip requests are read from here
    pub start_values: Option<&'a HashMap<String, String>>,
    pub handle_post: bool,
    pub default_post_version: &'a str,
}

/// Container whose marketplace elements await post resolution
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPostBatch {
    pub stage_index: usize,
    pub container_index: usize,
    pub batch: PostElementBatch,
}

/// Result of the structural pass
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenModel {
    pub model: PipelineModel,
    /// Ids of elements the caller asked to skip
    pub skipped: Vec<String>,
    pub post_batches: Vec<PendingPostBatch>,
}

fn new_element_id() -> String {
    format!("e-{}", uuid::Uuid::new_v4().simple())
}

fn flag_set(values: Option<&HashMap<String, String>>, key: &str) -> bool {
    values.and_then(|v| v.get(key)).is_some_and(|v| v == "true")
}

/// Structural rewrite; the input model is left untouched
pub fn rewrite_model(input: &RewriteInput<'_>) -> RewrittenModel {
    let mut model = input.model.clone();
    let mut skipped = Vec::new();
    let mut post_batches = Vec::new();

    for (stage_index, stage) in model.stages.iter_mut().enumerate().skip(1) {
        for (container_index, container) in stage.containers.iter_mut().enumerate() {
            let declared = std::mem::take(&mut container.elements);
            let mut rewritten = Vec::with_capacity(declared.len());
            let mut items = Vec::new();

            for (index, mut element) in declared.into_iter().enumerate() {
                if element.is_quality_gate() {
                    continue;
                }
                if input.handle_post && element.post_info.is_some() {
                    continue;
                }

                let id = element.id.get_or_insert_with(new_element_id).clone();
                let skip_key = keys::skip_element(&id);
                let requested = flag_set(input.start_values, &skip_key);
                if requested {
                    debug!(element_id = %id, name = %element.name, "element will be skipped");
                    skipped.push(id.clone());
                }
                let skip = requested || input.params.value_of(&skip_key).as_deref() == Some("true");
                element.skipped = skip;

                if !skip {
                    rewritten.extend(input.quality.gate_for(&element, ControlPointPosition::Before));
                }

                if input.handle_post && element.is_market() {
                    let version = element
                        .market_version()
                        .filter(|v| !v.trim().is_empty())
                        .unwrap_or(input.default_post_version)
                        .to_string();
                    items.push(ElementBaseInfo {
                        element_id: id.clone(),
                        element_name: element.name.clone(),
                        atom_code: element.atom_code().to_string(),
                        version,
                        element_job_index: index,
                    });
                }

                let after = if skip {
                    None
                } else {
                    input.quality.gate_for(&element, ControlPointPosition::After)
                };
                rewritten.push(element);
                rewritten.extend(after);
            }

            if !items.is_empty() {
                post_batches.push(PendingPostBatch {
                    stage_index,
                    container_index,
                    batch: PostElementBatch {
                        items,
                        elements: rewritten.clone(),
                        start_values: input.start_values.cloned(),
                    },
                });
            }
            container.elements = rewritten;
        }
    }

    RewrittenModel {
        model,
        skipped,
        post_batches,
    }
}

/// Drops elements whose id was already seen, keeping the first
fn dedup_by_id(elements: Vec<Element>) -> Vec<Element> {
    let mut seen = HashSet::new();
    elements
        .into_iter()
        .filter(|element| match &element.id {
            Some(id) if !seen.insert(id.clone()) => {
                warn!(element_id = %id, "element metadata returned a duplicate element, dropping it");
                false
            }
            _ => true,
        })
        .collect()
}

/// Model rewriter bound to the element metadata service
pub struct ModelRewriter {
    elements: Arc<dyn ElementMetadataService>,
    default_post_version: String,
}

impl ModelRewriter {
    pub fn new(elements: Arc<dyn ElementMetadataService>, default_post_version: impl Into<String>) -> Self {
        Self {
            elements,
            default_post_version: default_post_version.into(),
        }
    }

    /// Produces the model of one run
    ///
    /// Requested skip flags are added to `params` so later consumers see
    /// them.
    pub async fn rewrite(
        &self,
        project_id: &str,
        model: &PipelineModel,
        params: &mut BuildParameters,
        quality: &QualityRuleSet,
        start_values: Option<&HashMap<String, String>>,
        handle_post: bool,
    ) -> anyhow::Result<PipelineModel> {
        let RewrittenModel {
            mut model,
            skipped,
            post_batches,
        } = rewrite_model(&RewriteInput {
            model,
            params,
            quality,
            start_values,
            handle_post,
            default_post_version: &self.default_post_version,
        });

        for id in skipped {
            params.insert(BuildParameter::new(keys::skip_element(&id), "true", Provenance::System));
        }

        for pending in post_batches {
            let resolved = self
                .elements
                .resolve_post_elements(project_id, pending.batch)
                .await?;
            if let Some(container) = model
                .stages
                .get_mut(pending.stage_index)
                .and_then(|stage| stage.containers.get_mut(pending.container_index))
            {
                container.elements = dedup_by_id(resolved);
            }
        }

        Ok(model)
    }
}
