//! Orchestrator configuration
//!
//! Lock budgets, cascade bounds and admission settings. Values come from
//! defaults or `SLUICE_*` environment variables.

use anyhow::Context;
use std::time::Duration;

use sluice_core::domain::build::ChannelCode;
use sluice_core::domain::element::DEFAULT_MARKET_VERSION;

use crate::service::interceptor::FreezeWindow;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a lock survives a crashed holder
    pub lock_ttl: Duration,

    /// Maximum time a blocking lock acquisition waits
    pub lock_acquire_timeout: Duration,

    /// First backoff between blocking acquisition attempts
    pub lock_initial_backoff: Duration,

    /// Upper bound of the backoff between attempts
    pub lock_max_backoff: Duration,

    /// TTL of the dedup lock taken by service shutdowns
    pub shutdown_dedup_ttl: Duration,

    /// Channels whose starts skip the pipeline frequency lock
    pub exempt_channels: Vec<ChannelCode>,

    /// How many parent builds a shutdown may cascade through
    pub max_cascade_depth: usize,

    /// Largest serialized element accepted when resuming a paused task
    pub max_element_bytes: usize,

    /// Version given to marketplace elements that do not pin one
    pub default_post_version: String,

    /// UTC windows during which new builds are not admitted
    pub freeze_windows: Vec<FreezeWindow>,
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults
    pub fn new() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_acquire_timeout: Duration::from_secs(10),
            lock_initial_backoff: Duration::from_millis(10),
            lock_max_backoff: Duration::from_secs(1),
            shutdown_dedup_ttl: Duration::from_secs(10),
            exempt_channels: vec![ChannelCode::Codecc],
            max_cascade_depth: 16,
            max_element_bytes: 65_535,
            default_post_version: DEFAULT_MARKET_VERSION.to_string(),
            freeze_windows: Vec::new(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Recognized variables (all optional):
    /// - SLUICE_LOCK_TTL_SECS (default: 30)
    /// - SLUICE_LOCK_ACQUIRE_TIMEOUT_MS (default: 10000)
    /// - SLUICE_LOCK_INITIAL_BACKOFF_MS (default: 10)
    /// - SLUICE_LOCK_MAX_BACKOFF_MS (default: 1000)
    /// - SLUICE_SHUTDOWN_DEDUP_TTL_SECS (default: 10)
    /// - SLUICE_EXEMPT_CHANNELS (comma separated, default: CODECC)
    /// - SLUICE_MAX_CASCADE_DEPTH (default: 16)
    /// - SLUICE_MAX_ELEMENT_BYTES (default: 65535)
    /// - SLUICE_DEFAULT_POST_VERSION (default: 1.*)
    /// - SLUICE_FREEZE_WINDOWS (comma separated `HH:MM-HH:MM`, UTC)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::new();
        let number = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let exempt_channels = match lookup("SLUICE_EXEMPT_CHANNELS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    ChannelCode::parse(s).with_context(|| format!("unknown channel '{s}'"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => defaults.exempt_channels,
        };

        let freeze_windows = match lookup("SLUICE_FREEZE_WINDOWS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<FreezeWindow>().context("invalid SLUICE_FREEZE_WINDOWS"))
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            lock_ttl: number("SLUICE_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_ttl),
            lock_acquire_timeout: number("SLUICE_LOCK_ACQUIRE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_acquire_timeout),
            lock_initial_backoff: number("SLUICE_LOCK_INITIAL_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_initial_backoff),
            lock_max_backoff: number("SLUICE_LOCK_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_max_backoff),
            shutdown_dedup_ttl: number("SLUICE_SHUTDOWN_DEDUP_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_dedup_ttl),
            exempt_channels,
            max_cascade_depth: number("SLUICE_MAX_CASCADE_DEPTH")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_cascade_depth),
            max_element_bytes: number("SLUICE_MAX_ELEMENT_BYTES")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_element_bytes),
            default_post_version: lookup("SLUICE_DEFAULT_POST_VERSION")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.default_post_version),
            freeze_windows,
        })
    }

    /// Whether starts through `channel` skip the frequency lock
    pub fn is_exempt(&self, channel: ChannelCode) -> bool {
        self.exempt_channels.contains(&channel)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lock_ttl.is_zero() {
            anyhow::bail!("lock_ttl must be greater than 0");
        }

        if self.lock_acquire_timeout.is_zero() {
            anyhow::bail!("lock_acquire_timeout must be greater than 0");
        }

        if self.lock_initial_backoff.is_zero() {
            anyhow::bail!("lock_initial_backoff must be greater than 0");
        }

        if self.lock_max_backoff < self.lock_initial_backoff {
            anyhow::bail!("lock_max_backoff must not be smaller than lock_initial_backoff");
        }

        if self.max_cascade_depth == 0 {
            anyhow::bail!("max_cascade_depth must be greater than 0");
        }

        if self.max_element_bytes == 0 {
            anyhow::bail!("max_element_bytes must be greater than 0");
        }

        if self.default_post_version.trim().is_empty() {
            anyhow::bail!("default_post_version cannot be empty");
        }

        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new()
    }
}
