//! Element metadata service

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::domain::element::Element;
use sluice_core::dto::element::PostElementBatch;

/// Marketplace metadata lookups
#[async_trait]
pub trait ElementMetadataService: Send + Sync {
    /// Resolves post-processing companions for one container
    ///
    /// Returns `batch.elements` with companion post elements merged in.
    async fn resolve_post_elements(&self, project_id: &str, batch: PostElementBatch) -> Result<Vec<Element>>;
}
