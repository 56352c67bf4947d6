use std::time::Duration;

use crate::hll::{DEFAULT_PRECISION, MAX_PRECISION, MIN_PRECISION};

/// Default storage budget (100 MB)
const DEFAULT_MAX_STORAGE_BYTES: usize = 100 * 1024 * 1024;

/// Default number of expired keys the reaper removes per batch
const DEFAULT_REAPER_BATCH_SIZE: usize = 256;

/// Configuration for a store and its background reaper
///
/// # Example
///
/// ```rust
/// use tallykv_core::StoreConfig;
/// use std::time::Duration;
///
/// let config = StoreConfig::default()
///     .with_cleanup_interval(Duration::from_secs(30))
///     .with_max_storage_mb(256);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Interval between reaper sweeps (default: 60 seconds)
    pub cleanup_interval: Duration,
    /// Upper bound on keys removed per reaper batch (default: 256)
    pub reaper_batch_size: usize,
    /// Whether the background reaper is spawned at all (default: true)
    pub reaper_enabled: bool,
    /// Maximum storage size in bytes, keys plus values (0 = unlimited)
    pub max_storage_bytes: usize,
    /// Register index width for cardinality sketches (default: 14)
    pub hll_precision: u8,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            reaper_batch_size: DEFAULT_REAPER_BATCH_SIZE,
            reaper_enabled: true,
            max_storage_bytes: DEFAULT_MAX_STORAGE_BYTES,
            hll_precision: DEFAULT_PRECISION,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from `TALLYKV_*` environment variables.
    ///
    /// Missing or unparseable variables keep their default value:
    ///
    /// - `TALLYKV_CLEANUP_INTERVAL` - reaper interval in seconds
    /// - `TALLYKV_REAPER_BATCH` - keys per reaper batch
    /// - `TALLYKV_REAPER` - `0` or `false` disables the reaper
    /// - `TALLYKV_MAX_STORAGE_MB` - storage budget in megabytes (0 = unlimited)
    /// - `TALLYKV_HLL_PRECISION` - sketch precision, 4 to 18
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(secs) = lookup("TALLYKV_CLEANUP_INTERVAL").and_then(|v| v.parse::<u64>().ok()) {
            if secs > 0 {
                config.cleanup_interval = Duration::from_secs(secs);
            }
        }
        if let Some(batch) = lookup("TALLYKV_REAPER_BATCH").and_then(|v| v.parse::<usize>().ok()) {
            config = config.with_reaper_batch_size(batch);
        }
        if let Some(flag) = lookup("TALLYKV_REAPER") {
            let flag = flag.trim().to_ascii_lowercase();
            config.reaper_enabled = !matches!(flag.as_str(), "0" | "false" | "off");
        }
        if let Some(mb) = lookup("TALLYKV_MAX_STORAGE_MB").and_then(|v| v.parse::<usize>().ok()) {
            config = config.with_max_storage_mb(mb);
        }
        if let Some(p) = lookup("TALLYKV_HLL_PRECISION").and_then(|v| v.parse::<u8>().ok()) {
            if (MIN_PRECISION..=MAX_PRECISION).contains(&p) {
                config.hll_precision = p;
            } else {
                tracing::warn!(
                    "TALLYKV_HLL_PRECISION={} out of range, using {}",
                    p,
                    config.hll_precision
                );
            }
        }

        config
    }

    /// Sets the cleanup interval
    ///
    /// This determines how often the reaper wakes up to remove expired entries.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Sets how many expired keys one reaper batch may remove (minimum 1)
    pub fn with_reaper_batch_size(mut self, batch: usize) -> Self {
        self.reaper_batch_size = batch.max(1);
        self
    }

    /// Enables or disables the background reaper.
    ///
    /// With the reaper off, expired entries are still invisible to readers and
    /// are reclaimed on access or by an explicit [`Store::cleanup`](crate::Store::cleanup).
    pub fn with_reaper(mut self, enabled: bool) -> Self {
        self.reaper_enabled = enabled;
        self
    }

    /// Sets the storage budget in bytes (0 = unlimited)
    pub fn with_max_storage_bytes(mut self, bytes: usize) -> Self {
        self.max_storage_bytes = bytes;
        self
    }

    /// Sets the storage budget in megabytes (0 = unlimited)
    pub fn with_max_storage_mb(mut self, mb: usize) -> Self {
        self.max_storage_bytes = mb.saturating_mul(1024 * 1024);
        self
    }

    /// Sets the precision of sketches created by the engine.
    ///
    /// Values outside 4..=18 are rejected when the engine builds its sketch
    /// registry.
    pub fn with_hll_precision(mut self, precision: u8) -> Self {
        self.hll_precision = precision;
        self
    }
}
