//! Build log printer

use anyhow::Result;
use async_trait::async_trait;

/// Writes operator-visible lines into a build's log
#[async_trait]
pub trait LogPrinter: Send + Sync {
    /// Appends a highlighted line
    ///
    /// # Arguments
    /// * `build_id` - Build the line belongs to
    /// * `message` - Line content
    /// * `tag` - Task id the line is attached to, empty for build-level lines
    /// * `job_id` - Container the line is attached to, empty for build-level lines
    /// * `execute_count` - Execution attempt of the task
    async fn add_line(
        &self,
        build_id: &str,
        message: &str,
        tag: &str,
        job_id: &str,
        execute_count: u32,
    ) -> Result<()>;
}
