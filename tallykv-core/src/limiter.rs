//! Fixed-window rate limiting on top of the [`Script::RateLimit`](crate::Script::RateLimit)
//! script.
//!
//! The window starts with the first accepted call for a key and lasts
//! `window`; later calls do not move it. A client that starts right before a
//! boundary can therefore get up to `2 * limit` calls through across two
//! adjacent windows. Within one window, accepted calls never exceed `limit`.

use bytes::Bytes;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::txn::{Outcome, Plan};

/// Result of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Rejected,
}

impl Decision {
    pub fn is_accepted(self) -> bool {
        self == Decision::Accepted
    }
}

/// Rate limiter sharing the store's key space
///
/// `TransactionAborted` is returned as an error, never folded into
/// [`Decision::Rejected`]: callers should retry it.
#[derive(Clone)]
pub struct RateLimiter {
    store: Store,
}

impl RateLimiter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Counts one call against `key` if fewer than `limit` calls were
    /// accepted in the current window.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tallykv_core::{Decision, RateLimiter, Store, StoreConfig};
    /// use std::time::Duration;
    ///
    /// let store = Store::with_config(StoreConfig::default().with_reaper(false));
    /// let limiter = RateLimiter::new(store);
    /// let window = Duration::from_secs(60);
    ///
    /// let decisions: Vec<Decision> = (0..7)
    ///     .map(|_| limiter.try_acquire("user:rate_limit:123", 5, window).unwrap())
    ///     .collect();
    /// assert_eq!(decisions.iter().filter(|d| d.is_accepted()).count(), 5);
    /// ```
    pub fn try_acquire(&self, key: &str, limit: u64, window: Duration) -> Result<Decision> {
        let plan = Plan::rate_limit(limit_as_i64(limit)?, window)?;
        decide(self.store.execute(&plan, &[key])?)
    }

    /// Counts one call against every key, or against none of them if any key
    /// is already at `limit`.
    pub fn try_acquire_all(&self, keys: &[&str], limit: u64, window: Duration) -> Result<Decision> {
        let plan = Plan::acquire_all(keys.len(), limit_as_i64(limit)?, window)?;
        decide(self.store.execute(&plan, keys)?)
    }

    /// Calls still available to `key` in its current window
    pub fn remaining(&self, key: &str, limit: u64) -> Result<u64> {
        let used = match self.store.get(key) {
            None => 0,
            Some(value) => parse_counter(&value)?,
        };
        Ok(limit.saturating_sub(used))
    }
}

fn limit_as_i64(limit: u64) -> Result<i64> {
    i64::try_from(limit).map_err(|_| Error::invalid(format!("limit {} is too large", limit)))
}

fn parse_counter(value: &Bytes) -> Result<u64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::invalid("rate limit key holds a non-counter value"))
}

fn decide(outcome: Outcome) -> Result<Decision> {
    match outcome {
        Outcome::Accepted => Ok(Decision::Accepted),
        Outcome::Rejected => Ok(Decision::Rejected),
        other => Err(Error::aborted(format!("unexpected rate limit outcome {:?}", other))),
    }
}
