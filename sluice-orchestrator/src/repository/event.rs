//! Event dispatcher boundary

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::domain::event::PipelineEvent;

/// Hands lifecycle events to the execution runtime
///
/// Fire-and-forget from the orchestrator's point of view; delivery guarantees
/// belong to the messaging implementation.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, event: PipelineEvent) -> Result<()>;
}
