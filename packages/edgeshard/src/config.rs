//! Shard management configuration.
//!
//! `ShardConfig` is a plain serde value that can be written to and read
//! from a JSON file. Components never hold a copy for long: they keep a
//! [`ConfigHandle`] and take a `snapshot()` per operation, so an update or
//! a `reload_from()` takes effect on the next call without a restart.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};

// ── Defaults ────────────────────────────────────────────────────────

/// Edges per shard before a split is considered.
pub const DEFAULT_SHARD_SIZE: u64 = 500_000;

/// Lifetime of a cached write shard or read topology.
pub const DEFAULT_CACHE_TTL_MS: u64 = 30_000;

/// Minimum time a sealed group waits before compaction.
/// Must be at least `MIN_DELTA_TTL_RATIO` cache TTLs.
pub const DEFAULT_MIN_DELTA_MS: u64 = 120_000;

/// Smallest allowed `min_delta_ms / cache_ttl_ms`, as a fraction.
///
/// One TTL covers writers and readers still holding a cached shard after
/// a split. The remaining 1.5 TTL is the budget for appends already in
/// flight when their cache entry expired and for clock skew between
/// nodes. The same `min_delta_ms` is the compaction claim lease.
pub const MIN_DELTA_TTL_RATIO: (u64, u64) = (5, 2);

/// Rows moved per page during compaction.
pub const DEFAULT_COMPACTION_PAGE_SIZE: usize = 1_000;

/// Rows fetched per page by edge searches.
pub const DEFAULT_READ_PAGE_SIZE: usize = 1_000;

// ── ShardConfig ─────────────────────────────────────────────────────

/// Shard sizing and timing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Edge count threshold of the write shard before a split.
    pub shard_size: u64,
    /// Cache entry lifetime in milliseconds.
    pub cache_ttl_ms: u64,
    /// Minimum age of a sealed group before it may be compacted.
    pub min_delta_ms: u64,
    /// Minimum age of the writable group before it may be split.
    pub shard_min_age_ms: u64,
    /// Rows per page when migrating rows during compaction.
    pub compaction_page_size: usize,
    /// Rows per page for edge searches.
    pub read_page_size: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shard_size: DEFAULT_SHARD_SIZE,
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            min_delta_ms: DEFAULT_MIN_DELTA_MS,
            shard_min_age_ms: DEFAULT_CACHE_TTL_MS,
            compaction_page_size: DEFAULT_COMPACTION_PAGE_SIZE,
            read_page_size: DEFAULT_READ_PAGE_SIZE,
        }
    }
}

impl ShardConfig {
    /// Config with the three primary knobs set; the split age follows the TTL.
    pub fn new(shard_size: u64, cache_ttl: Duration, min_delta: Duration) -> Self {
        let cache_ttl_ms = cache_ttl.as_millis() as u64;
        Self {
            shard_size,
            cache_ttl_ms,
            min_delta_ms: min_delta.as_millis() as u64,
            shard_min_age_ms: cache_ttl_ms,
            ..Self::default()
        }
    }

    pub fn with_shard_min_age(mut self, age: Duration) -> Self {
        self.shard_min_age_ms = age.as_millis() as u64;
        self
    }

    pub fn with_compaction_page_size(mut self, rows: usize) -> Self {
        self.compaction_page_size = rows;
        self
    }

    pub fn with_read_page_size(mut self, rows: usize) -> Self {
        self.read_page_size = rows;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn min_delta(&self) -> Duration {
        Duration::from_millis(self.min_delta_ms)
    }

    /// Check sizes and the staleness window.
    ///
    /// `min_delta_ms` must be at least 2.5 times `cache_ttl_ms` (see
    /// [`MIN_DELTA_TTL_RATIO`]): a reader or writer holding a cached
    /// topology may still address a shard for up to one TTL after it
    /// stopped being current.
    pub fn validate(&self) -> Result<()> {
        if self.shard_size == 0 {
            return Err(ShardError::Config("shard_size must be > 0".to_string()));
        }
        if self.compaction_page_size == 0 || self.read_page_size == 0 {
            return Err(ShardError::Config("page sizes must be > 0".to_string()));
        }
        let (num, den) = MIN_DELTA_TTL_RATIO;
        if self.min_delta_ms.saturating_mul(den) < self.cache_ttl_ms.saturating_mul(num) {
            return Err(ShardError::Config(format!(
                "min_delta_ms ({}) must be at least {}/{} of cache_ttl_ms ({})",
                self.min_delta_ms, num, den, self.cache_ttl_ms
            )));
        }
        Ok(())
    }

    /// Read and validate config from a JSON file.
    pub fn read_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write config to a JSON file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

// ── ConfigHandle ────────────────────────────────────────────────────

/// Shared, hot-reloadable view of a [`ShardConfig`].
///
/// Cloning the handle shares the underlying config.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<ShardConfig>>,
}

impl ConfigHandle {
    pub fn new(config: ShardConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
        })
    }

    /// Current values. Callers must not keep the snapshot across operations.
    pub fn snapshot(&self) -> ShardConfig {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the config. Invalid configs are rejected and the old one kept.
    pub fn update(&self, config: ShardConfig) -> Result<()> {
        config.validate()?;
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::info!(
            shard_size = config.shard_size,
            cache_ttl_ms = config.cache_ttl_ms,
            min_delta_ms = config.min_delta_ms,
            "shard config updated"
        );
        *guard = config;
        Ok(())
    }

    /// Re-read the config file and apply it.
    pub fn reload_from(&self, path: &Path) -> Result<()> {
        let config = ShardConfig::read_from(path)?;
        self.update(config)
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ShardConfig::default())),
        }
    }
}
