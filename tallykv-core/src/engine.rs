use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::hll::Sketches;
use crate::limiter::RateLimiter;
use crate::store::Store;

/// One engine instance: the expiring store, a rate limiter over it and the
/// cardinality sketches.
///
/// Engines are independent of each other; there is no process-wide
/// instance. Cloning an engine shares its state.
///
/// # Example
///
/// ```rust,no_run
/// use tallykv_core::{Engine, StoreConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), tallykv_core::Error> {
///     let engine = Engine::with_config(StoreConfig::from_env())?;
///
///     let ttl = Some(Duration::from_secs(120));
///     engine.store().put("cache:homepage:/landing", "<html>..</html>", ttl)?;
///     engine.sketches().add("visits:homepage", "user:123");
///     let decision = engine
///         .limiter()
///         .try_acquire("user:rate_limit:123", 5, Duration::from_secs(60))?;
///
///     engine.shutdown();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    store: Store,
    limiter: RateLimiter,
    sketches: Arc<Sketches>,
}

impl Engine {
    /// Creates an engine with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates an engine whose expiry decisions use `clock`
    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let sketches = Arc::new(Sketches::new(config.hll_precision)?);
        tracing::info!(
            "engine starting (reaper: {}, interval: {:?}, max storage: {} bytes, hll p: {})",
            config.reaper_enabled,
            config.cleanup_interval,
            config.max_storage_bytes,
            config.hll_precision
        );
        let store = Store::with_clock(config, clock);
        Ok(Self {
            limiter: RateLimiter::new(store.clone()),
            store,
            sketches,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn sketches(&self) -> &Sketches {
        &self.sketches
    }

    /// Stops background work. Data stays readable until the engine is dropped.
    pub fn shutdown(&self) {
        self.store.shutdown();
        tracing::info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::limiter::Decision;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn test_invalid_precision_rejected() {
        let config = StoreConfig::default().with_reaper(false).with_hll_precision(30);
        assert!(matches!(Engine::with_config(config), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_engines_are_independent() {
        let config = StoreConfig::default().with_reaper(false);
        let a = Engine::with_config(config.clone()).unwrap();
        let b = Engine::with_config(config).unwrap();

        a.store().put("k", "a", None).unwrap();
        a.sketches().add("s", "x");
        assert_eq!(b.store().get("k"), None);
        assert_eq!(b.sketches().count("s"), 0);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let engine = Engine::new().unwrap();
        let clone = engine.clone();

        engine.store().put("k", "v", Some(Duration::from_secs(5))).unwrap();
        assert_eq!(clone.store().get("k"), Some(Bytes::from("v")));
        assert_eq!(
            engine.limiter().try_acquire("rl", 1, Duration::from_secs(5)).unwrap(),
            Decision::Accepted
        );
        assert_eq!(clone.store().get("rl"), Some(Bytes::from("1")));

        engine.shutdown();
        assert_eq!(engine.store().get("k"), Some(Bytes::from("v")));
    }
}
