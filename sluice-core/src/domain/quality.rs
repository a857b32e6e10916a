//! Quality rule domain types
//!
//! Quality rules bind to element atom codes at a control point (before or
//! after the element runs). A matched rule set tells the model rewriter where
//! gate elements belong.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::domain::element::{Element, ElementKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlPointPosition {
    Before,
    After,
}

/// A quality rule that applies to a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityRuleMatch {
    pub rule_hash_id: String,
    pub rule_name: String,
    pub control_points: Vec<ControlPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPoint {
    pub atom_code: String,
    pub position: ControlPointPosition,
}

/// Atom codes that get a gate before/after them, with the rules per code
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityRuleSet {
    pub before: BTreeSet<String>,
    pub after: BTreeSet<String>,
    pub rules: HashMap<String, Vec<String>>,
}

impl QualityRuleSet {
    pub fn from_matches(matches: &[QualityRuleMatch]) -> Self {
        let mut set = QualityRuleSet::default();
        for rule in matches {
            for point in &rule.control_points {
                match point.position {
                    ControlPointPosition::Before => set.before.insert(point.atom_code.clone()),
                    ControlPointPosition::After => set.after.insert(point.atom_code.clone()),
                };
                let names = set.rules.entry(point.atom_code.clone()).or_default();
                if !names.contains(&rule.rule_name) {
                    names.push(rule.rule_name.clone());
                }
            }
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    /// Gate element to insert around `element`, if a rule binds its atom code
    ///
    /// Gate ids derive from the guarded element id so repeated rewrites of the
    /// same model produce the same ids.
    pub fn gate_for(&self, element: &Element, position: ControlPointPosition) -> Option<Element> {
        let code = element.atom_code();
        let listed = match position {
            ControlPointPosition::Before => self.before.contains(code),
            ControlPointPosition::After => self.after.contains(code),
        };
        if !listed || !self.rules.contains_key(code) {
            return None;
        }

        let element_id = element.id.as_deref().unwrap_or(code);
        let (id, name, kind) = match position {
            ControlPointPosition::Before => (
                format!("qg-in-{element_id}"),
                "Quality gate (in)",
                ElementKind::QualityGateIn {
                    intercept_task: code.to_string(),
                    intercept_task_name: Some(element.name.clone()),
                },
            ),
            ControlPointPosition::After => (
                format!("qg-out-{element_id}"),
                "Quality gate (out)",
                ElementKind::QualityGateOut {
                    intercept_task: code.to_string(),
                    intercept_task_name: Some(element.name.clone()),
                },
            ),
        };
        Some(Element::new(id, name, kind))
    }
}
