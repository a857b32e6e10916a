//! Variable repository
//!
//! Runtime variables of builds and their startup snapshots.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Repository trait for build variables
#[async_trait]
pub trait VariableRepository: Send + Sync {
    /// All runtime variables of a build
    async fn get_all_variables(&self, build_id: &str) -> Result<HashMap<String, String>>;

    /// Copies the persisted build parameters into the runtime variables
    async fn init_build_parameters(&self, build_id: &str) -> Result<()>;

    /// Stores the startup snapshot as a JSON object string
    async fn save_startup_params(&self, build_id: &str, params: String) -> Result<()>;

    /// Raw startup snapshot; decoding is left to the caller
    async fn get_startup_params(&self, build_id: &str) -> Result<Option<String>>;
}
