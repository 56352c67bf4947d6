//! # TallyKV Core
//!
//! An in-process data-store engine with two primitives:
//!
//! - an expiring key-value store with atomic check-then-mutate scripts,
//!   used for TTL caching and fixed-window rate limiting;
//! - HyperLogLog sketches for approximate distinct counts.
//!
//! ## Features
//!
//! - Thread-safe storage using `DashMap`
//! - Expiry checked on every read (lazy), so expired keys are never returned
//! - Background reaper per store, reclaiming expired entries in bounded batches
//! - Named atomic scripts ([`Script`]) instead of an embedded scripting language
//! - Injectable [`Clock`] for deterministic tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use tallykv_core::{Engine, StoreConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tallykv_core::Error> {
//!     let config = StoreConfig::default()
//!         .with_cleanup_interval(Duration::from_secs(30));
//!     let engine = Engine::with_config(config)?;
//!
//!     // Store a value with a 60 second TTL
//!     engine.store().put("user:123", "John Doe", Some(Duration::from_secs(60)))?;
//!
//!     if let Some(value) = engine.store().get("user:123") {
//!         println!("User: {:?}", value);
//!     }
//!
//!     // 5 requests per minute
//!     let decision = engine.limiter().try_acquire("rate:user:123", 5, Duration::from_secs(60))?;
//!     println!("accepted: {}", decision.is_accepted());
//!
//!     // Unique visitors
//!     engine.sketches().add("visits:homepage", "user:123");
//!     println!("unique: {}", engine.sketches().count("visits:homepage"));
//!     Ok(())
//! }
//! ```

mod clock;
mod config;
mod engine;
mod entry;
mod error;
mod hll;
mod limiter;
mod store;
mod txn;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use hll::{HyperLogLog, Sketches, DEFAULT_PRECISION, MAX_PRECISION, MIN_PRECISION};
pub use limiter::{Decision, RateLimiter};
pub use store::Store;
pub use txn::{CompareOp, Outcome, Script};
