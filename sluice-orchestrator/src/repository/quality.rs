//! Quality rule service

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::domain::quality::QualityRuleMatch;

/// Looks up quality rules that apply to a pipeline
#[async_trait]
pub trait QualityRuleService: Send + Sync {
    /// Rules bound to the pipeline or, for template instances, its template
    async fn match_rules(
        &self,
        project_id: &str,
        pipeline_id: &str,
        template_id: Option<&str>,
    ) -> Result<Vec<QualityRuleMatch>>;
}
