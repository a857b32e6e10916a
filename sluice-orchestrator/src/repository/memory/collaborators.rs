//! In-memory collaborators
//!
//! Permission store, event sink, log printer, marketplace metadata and
//! quality rules, each recording what it was asked so callers can inspect it.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sluice_core::domain::element::{Element, ElementKind, PostInfo};
use sluice_core::domain::event::PipelineEvent;
use sluice_core::domain::quality::QualityRuleMatch;
use sluice_core::dto::element::PostElementBatch;

use crate::repository::{
    ElementMetadataService, EventDispatcher, LogPrinter, Permission, PermissionService,
    QualityRuleService,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Permissions
// =============================================================================

/// Grants everything except explicitly denied (user, pipeline) pairs
#[derive(Default)]
pub struct MemoryPermissions {
    denied: Mutex<HashSet<(String, String)>>,
    /// Pipelines listed per (user, project)
    listed: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl MemoryPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, user_id: &str, pipeline_id: &str) {
        guard(&self.denied).insert((user_id.to_string(), pipeline_id.to_string()));
    }

    /// Makes `pipeline_ids` enumerable for the user within a project
    pub fn list_pipelines(&self, user_id: &str, project_id: &str, pipeline_ids: &[&str]) {
        guard(&self.listed).insert(
            (user_id.to_string(), project_id.to_string()),
            pipeline_ids.iter().map(|id| id.to_string()).collect(),
        );
    }
}

#[async_trait]
impl PermissionService for MemoryPermissions {
    async fn check_permission(
        &self,
        user_id: &str,
        _project_id: &str,
        pipeline_id: &str,
        _permission: Permission,
    ) -> Result<bool> {
        Ok(!guard(&self.denied).contains(&(user_id.to_string(), pipeline_id.to_string())))
    }

    async fn get_resource_by_permission(
        &self,
        user_id: &str,
        project_id: &str,
        _permission: Permission,
    ) -> Result<Vec<String>> {
        let denied = guard(&self.denied);
        Ok(guard(&self.listed)
            .get(&(user_id.to_string(), project_id.to_string()))
            .map(|ids| {
                ids.iter()
                    .filter(|id| !denied.contains(&(user_id.to_string(), id.to_string())))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// Events
// =============================================================================

/// Collects dispatched events
#[derive(Default)]
pub struct RecordingEventDispatcher {
    events: Mutex<Vec<PipelineEvent>>,
    fail: AtomicBool,
}

impl RecordingEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        guard(&self.events).clone()
    }

    /// Makes every following dispatch fail
    pub fn fail_dispatches(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventDispatcher for RecordingEventDispatcher {
    async fn dispatch(&self, event: PipelineEvent) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("event bus unavailable");
        }
        guard(&self.events).push(event);
        Ok(())
    }
}

// =============================================================================
// Build log
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub build_id: String,
    pub message: String,
    pub tag: String,
    pub job_id: String,
    pub execute_count: u32,
}

/// Collects printed build log lines
#[derive(Default)]
pub struct RecordingLogPrinter {
    lines: Mutex<Vec<LogLine>>,
}

impl RecordingLogPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<LogLine> {
        guard(&self.lines).clone()
    }
}

#[async_trait]
impl LogPrinter for RecordingLogPrinter {
    async fn add_line(
        &self,
        build_id: &str,
        message: &str,
        tag: &str,
        job_id: &str,
        execute_count: u32,
    ) -> Result<()> {
        guard(&self.lines).push(LogLine {
            build_id: build_id.to_string(),
            message: message.to_string(),
            tag: tag.to_string(),
            job_id: job_id.to_string(),
            execute_count,
        });
        Ok(())
    }
}

// =============================================================================
// Marketplace metadata
// =============================================================================

/// Synthesizes one post companion for every element whose atom code was
/// registered with [`with_post`](Self::with_post)
#[derive(Default)]
pub struct MemoryElementMetadata {
    post_atoms: HashSet<String>,
    /// Echo companions twice, imitating a misbehaving marketplace
    duplicate_companions: bool,
}

impl MemoryElementMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_post(mut self, atom_code: &str) -> Self {
        self.post_atoms.insert(atom_code.to_string());
        self
    }

    pub fn with_duplicates(mut self) -> Self {
        self.duplicate_companions = true;
        self
    }
}

#[async_trait]
impl ElementMetadataService for MemoryElementMetadata {
    async fn resolve_post_elements(&self, _project_id: &str, batch: PostElementBatch) -> Result<Vec<Element>> {
        let mut elements = batch.elements;
        for item in batch.items.iter().rev() {
            if !self.post_atoms.contains(&item.atom_code) {
                continue;
            }
            let mut companion = Element::new(
                format!("{}-post", item.element_id),
                format!("{} (post)", item.element_name),
                ElementKind::MarketBuild {
                    atom_code: item.atom_code.clone(),
                    version: item.version.clone(),
                    input: serde_json::Map::new(),
                },
            );
            companion.post_info = Some(PostInfo {
                parent_element_id: item.element_id.clone(),
                post_entry: "post".to_string(),
            });
            if self.duplicate_companions {
                elements.push(companion.clone());
            }
            elements.push(companion);
        }
        Ok(elements)
    }
}

// =============================================================================
// Quality rules
// =============================================================================

/// Quality rules keyed by pipeline id or template id
#[derive(Default)]
pub struct MemoryQualityRules {
    rules: Mutex<HashMap<String, Vec<QualityRuleMatch>>>,
}

impl MemoryQualityRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a rule to a pipeline id or a template id
    pub fn bind(&self, owner_id: &str, rule: QualityRuleMatch) {
        guard(&self.rules)
            .entry(owner_id.to_string())
            .or_default()
            .push(rule);
    }
}

#[async_trait]
impl QualityRuleService for MemoryQualityRules {
    async fn match_rules(
        &self,
        _project_id: &str,
        pipeline_id: &str,
        template_id: Option<&str>,
    ) -> Result<Vec<QualityRuleMatch>> {
        let rules = guard(&self.rules);
        let mut matched = rules.get(pipeline_id).cloned().unwrap_or_default();
        if let Some(template_rules) = template_id.and_then(|id| rules.get(id)) {
            matched.extend(template_rules.iter().cloned());
        }
        Ok(matched)
    }
}
