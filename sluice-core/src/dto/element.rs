//! Element DTOs exchanged with the element metadata service

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::element::Element;

/// Marketplace element that may own post-processing companions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementBaseInfo {
    pub element_id: String,
    pub element_name: String,
    pub atom_code: String,
    pub version: String,
    /// Position of the element in its container's declared list
    pub element_job_index: usize,
}

/// One container's worth of post-processing resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostElementBatch {
    pub items: Vec<ElementBaseInfo>,
    /// Rewritten element list the companions are merged into
    pub elements: Vec<Element>,
    #[serde(default)]
    pub start_values: Option<HashMap<String, String>>,
}
