//! Lock Coordinator
//!
//! Per-pipeline and per-build mutual exclusion on top of a [`LockStore`].
//!
//! Two capabilities are kept apart:
//! - [`NonBlockingLock`] answers immediately; used for the pipeline frequency
//!   limit where excess triggers are rejected rather than queued
//! - [`BlockingLock`] waits with exponential backoff and jitter up to the
//!   acquire timeout; used to serialize control operations on one build
//!
//! Guards must be released with [`LockGuard::release`]. A guard dropped
//! without release frees its key from a background task, and the store TTL
//! covers holders that crash.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::repository::LockStore;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock '{key}'")]
    Timeout { key: String, waited: Duration },

    #[error("lock store failed: {0}")]
    Store(#[from] anyhow::Error),
}

impl From<LockError> for OrchestratorError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { key, .. } => OrchestratorError::LockTimeout { key },
            LockError::Store(source) => OrchestratorError::Repository(source),
        }
    }
}

/// Lock timing configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub ttl: Duration,
    pub acquire_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&OrchestratorConfig> for LockConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            ttl: config.lock_ttl,
            acquire_timeout: config.lock_acquire_timeout,
            initial_backoff: config.lock_initial_backoff,
            max_backoff: config.lock_max_backoff,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

// =============================================================================
// Guard
// =============================================================================

/// Held lock
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    key: String,
    holder: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the lock
    ///
    /// Release failures are logged; the entry then expires through its TTL.
    pub async fn release(mut self) {
        self.released = true;
        match self.store.remove(&self.key, &self.holder).await {
            Ok(true) => debug!(key = %self.key, holder = %self.holder, "lock released"),
            Ok(false) => warn!(
                key = %self.key,
                holder = %self.holder,
                "lock release found no entry: already expired or taken"
            ),
            Err(e) => warn!(key = %self.key, error = %e, "lock release failed, waiting for TTL"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match store.remove(&key, &holder).await {
                        Ok(_) => debug!(key = %key, "lock released on drop"),
                        Err(e) => {
                            debug!(key = %key, error = %e, "lock release on drop failed (will expire via TTL)")
                        }
                    }
                });
            }
            Err(_) => debug!(key = %key, "no runtime to release dropped lock, waiting for TTL"),
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Try-once acquisition
#[async_trait]
pub trait NonBlockingLock: Send + Sync {
    /// Returns `None` when the key is held by someone else
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError>;
}

/// Bounded-wait acquisition
#[async_trait]
pub trait BlockingLock: Send + Sync {
    /// Waits until the key is free or the acquire timeout passes
    async fn lock(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError>;
}

/// Store-backed lock implementing both capabilities
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    async fn attempt(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        if self.store.try_insert(key, holder, ttl).await? {
            debug!(key = %key, holder = %holder, ttl_ms = ttl.as_millis() as u64, "lock acquired");
            Ok(Some(LockGuard {
                store: self.store.clone(),
                key: key.to_string(),
                holder: holder.to_string(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl NonBlockingLock for DistributedLock {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        let holder = uuid::Uuid::new_v4().to_string();
        self.attempt(key, &holder, ttl).await
    }
}

#[async_trait]
impl BlockingLock for DistributedLock {
    async fn lock(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let holder = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        let mut backoff_ms = self.config.initial_backoff.as_millis().max(1) as u64;
        let max_backoff_ms = self.config.max_backoff.as_millis().max(1) as u64;

        loop {
            if let Some(guard) = self.attempt(key, &holder, ttl).await? {
                return Ok(guard);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: now - started,
                });
            }

            // Rng is created per iteration so it is not held across the await
            let jitter = rand::rng().random_range(0..backoff_ms / 2 + 1);
            let sleep = Duration::from_millis(backoff_ms + jitter).min(deadline - now);

            debug!(key = %key, backoff_ms = sleep.as_millis() as u64, "lock held, backing off");
            tokio::time::sleep(sleep).await;

            backoff_ms = (backoff_ms * 2).min(max_backoff_ms);
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Named locks used by the build service
#[derive(Clone)]
pub struct LockCoordinator {
    non_blocking: Arc<dyn NonBlockingLock>,
    blocking: Arc<dyn BlockingLock>,
    ttl: Duration,
}

impl LockCoordinator {
    /// Coordinator whose both capabilities share one store
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        let ttl = config.ttl;
        let lock = Arc::new(DistributedLock::new(store, config));
        Self {
            non_blocking: lock.clone(),
            blocking: lock,
            ttl,
        }
    }

    pub fn from_parts(non_blocking: Arc<dyn NonBlockingLock>, blocking: Arc<dyn BlockingLock>, ttl: Duration) -> Self {
        Self {
            non_blocking,
            blocking,
            ttl,
        }
    }

    pub fn pipeline_key(pipeline_id: &str) -> String {
        format!("sluice:lock:pipeline:{pipeline_id}")
    }

    pub fn build_key(build_id: &str) -> String {
        format!("sluice:lock:build:{build_id}")
    }

    /// Frequency-limit lock of a pipeline; `None` when another start holds it
    pub async fn try_acquire_pipeline_lock(&self, pipeline_id: &str) -> Result<Option<LockGuard>, LockError> {
        self.non_blocking
            .try_lock(&Self::pipeline_key(pipeline_id), self.ttl)
            .await
    }

    /// Same key as the frequency lock, waited for instead of rejected
    pub async fn acquire_pipeline_run_lock(&self, pipeline_id: &str) -> Result<LockGuard, LockError> {
        self.blocking
            .lock(&Self::pipeline_key(pipeline_id), self.ttl)
            .await
    }

    pub async fn acquire_build_lock(&self, build_id: &str) -> Result<LockGuard, LockError> {
        self.blocking.lock(&Self::build_key(build_id), self.ttl).await
    }

    pub async fn acquire_generic_lock(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        self.blocking.lock(key, ttl).await
    }
}
