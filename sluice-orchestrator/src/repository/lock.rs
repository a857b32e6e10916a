//! Lock store
//!
//! Backing storage for distributed locks. Acquisition policy (blocking,
//! backoff, guards) lives in `service::lock`.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Set-if-absent storage with expiry
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Stores `holder` under `key` unless a live entry exists
    ///
    /// Returns whether the entry was written. Expired entries count as absent.
    async fn try_insert(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Removes `key` only if it is still held by `holder`
    async fn remove(&self, key: &str, holder: &str) -> Result<bool>;
}
