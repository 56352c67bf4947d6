use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::entry::Entry;
use crate::error::{Error, Result};

/// TTLs are capped at ~100 years so `Instant` arithmetic cannot overflow.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Converts a TTL into an absolute deadline. A zero TTL would create an entry
/// that is already dead, so it is rejected.
pub(crate) fn deadline(now: Instant, ttl: Duration) -> Result<Instant> {
    if ttl.is_zero() {
        return Err(Error::invalid("ttl must be greater than zero"));
    }
    Ok(now + ttl.min(MAX_TTL))
}

/// Truncates a key for logging
pub(crate) fn log_key(key: &str) -> &str {
    const MAX_LOG_LEN: usize = 16;
    match key.char_indices().nth(MAX_LOG_LEN) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}

/// Internal shared state for the store
pub(crate) struct StoreInner {
    pub(crate) data: DashMap<String, Entry>,
    /// Taken shared by every single-key operation and exclusively by
    /// multi-key scripts, so a multi-key commit is never half visible.
    gate: RwLock<()>,
    clock: Arc<dyn Clock>,
    /// Sender to signal shutdown to the reaper
    shutdown_tx: watch::Sender<bool>,
    /// Current total size of stored data in bytes (keys + values)
    current_size: AtomicUsize,
    /// Maximum storage size in bytes (0 = unlimited)
    max_storage_bytes: usize,
}

impl StoreInner {
    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(crate) fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read()
    }

    pub(crate) fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write()
    }

    /// Applies a size change after an entry of `removed` bytes was replaced by
    /// one of `added` bytes.
    pub(crate) fn account(&self, removed: usize, added: usize) {
        if added > removed {
            self.current_size.fetch_add(added - removed, Ordering::Relaxed);
        } else if removed > added {
            self.current_size.fetch_sub(removed - added, Ordering::Relaxed);
        }
    }

    /// Removes `key` only if it is still expired, re-checked under the shard
    /// write lock. Returns whether an entry was removed.
    fn remove_if_expired(&self, key: &str) -> bool {
        let now = self.now();
        match self.data.remove_if(key, |_, entry| entry.is_expired_at(now)) {
            Some((k, removed)) => {
                self.account(removed.footprint(&k), 0);
                true
            }
            None => false,
        }
    }

    /// One reaper batch: select up to `batch` expired keys, then delete each
    /// one after re-checking it. Returns `(selected, removed)`.
    fn reap_batch(&self, batch: usize) -> (usize, usize) {
        let now = self.now();
        let candidates: Vec<String> = self
            .data
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .take(batch)
            .map(|entry| entry.key().clone())
            .collect();

        let _gate = self.shared();
        let removed = candidates
            .iter()
            .filter(|key| self.remove_if_expired(key))
            .count();
        (candidates.len(), removed)
    }

    /// Bytes in use if an entry of `old_size` bytes becomes `new_size` bytes,
    /// or `None` when that fits the budget.
    fn over_budget(&self, old_size: usize, new_size: usize) -> Option<usize> {
        if self.max_storage_bytes == 0 || new_size <= old_size {
            return None;
        }
        let current = self.current_size.load(Ordering::Relaxed);
        (current.saturating_add(new_size - old_size) > self.max_storage_bytes).then_some(current)
    }

    fn sweep(&self, batch: usize) -> usize {
        let mut removed = 0;
        loop {
            let (selected, n) = self.reap_batch(batch);
            removed += n;
            if selected < batch {
                return removed;
            }
        }
    }
}

/// Thread-safe in-memory key-value store with TTL support
///
/// Uses `DashMap` for concurrent access. Reads never block other reads, and
/// writes only block access to the shard holding the key being written.
///
/// Expired entries are invisible as soon as their deadline passes: every read
/// checks the deadline itself. A background reaper (one per store) reclaims
/// the memory of expired entries nobody reads again. It is stopped by
/// [`Store::shutdown`] or when the last handle is dropped.
///
/// # Storage Limits
///
/// The store has a configurable maximum storage size (default: 100MB).
/// When full, `put` is rejected with `Error::StorageFull`.
///
/// # Example
///
/// ```rust,no_run
/// use tallykv_core::{Store, StoreConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let config = StoreConfig::default()
///         .with_cleanup_interval(Duration::from_secs(30))
///         .with_max_storage_mb(256);
///     let store = Store::with_config(config);
///
///     store.put("key", "value", Some(Duration::from_secs(300))).unwrap();
///     assert_eq!(store.get("key").as_deref(), Some(&b"value"[..]));
/// }
/// ```
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Creates a new store with default configuration
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates a new store with custom configuration
    ///
    /// The reaper is spawned on the current Tokio runtime. Outside a runtime
    /// the store still works, but expired entries are only reclaimed on
    /// access or by [`Store::cleanup`].
    pub fn with_config(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a store whose expiry decisions use `clock`
    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(StoreInner {
            data: DashMap::new(),
            gate: RwLock::new(()),
            clock,
            shutdown_tx,
            current_size: AtomicUsize::new(0),
            max_storage_bytes: config.max_storage_bytes,
        });

        if config.reaper_enabled {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(Self::reaper_task(
                        Arc::downgrade(&inner),
                        config.cleanup_interval,
                        config.reaper_batch_size,
                        shutdown_rx,
                    ));
                }
                Err(_) => {
                    tracing::warn!("no Tokio runtime available; background reaper not started");
                }
            }
        }

        Self { inner }
    }

    /// Background task that periodically removes expired entries in batches
    async fn reaper_task(
        inner: Weak<StoreInner>,
        interval: Duration,
        batch: usize,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick - we want to wait for the interval first
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    let mut removed = 0;
                    loop {
                        let (selected, n) = inner.reap_batch(batch);
                        removed += n;
                        if selected < batch {
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                    if removed > 0 {
                        tracing::debug!("reaper removed {} expired entries", removed);
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("reaper stopped");
    }

    /// Current time according to the store's clock
    pub fn now(&self) -> Instant {
        self.inner.now()
    }

    /// Stores a value, replacing any previous value and expiry
    ///
    /// `ttl = None` stores a value that never expires. TTLs are capped at
    /// ~100 years.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` for a zero TTL.
    /// - `Error::StorageFull` if the storage limit would be exceeded. The
    ///   limit is a soft limit: concurrent writers may briefly overshoot it.
    pub fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = key.into();
        let now = self.now();
        let expires_at = ttl.map(|ttl| deadline(now, ttl)).transpose()?;
        let entry = Entry::new(value.into(), expires_at);
        let new_size = entry.footprint(&key);

        // Expired entries still count until removed; reclaim them before refusing
        if self.inner.over_budget(self.stored_size(&key), new_size).is_some() {
            let reclaimed = self.inner.sweep(usize::MAX);
            tracing::debug!("storage budget reached, reclaimed {} expired entries", reclaimed);
        }

        let _gate = self.inner.shared();

        if let Some(current) = self.inner.over_budget(self.stored_size(&key), new_size) {
            tracing::warn!(
                "storage full: {} bytes used of {} bytes max",
                current,
                self.inner.max_storage_bytes
            );
            return Err(Error::StorageFull {
                current_bytes: current,
                max_bytes: self.inner.max_storage_bytes,
            });
        }

        tracing::trace!("PUT {} (ttl: {:?})", log_key(&key), ttl);
        let old = self.inner.data.insert(key.clone(), entry);
        let old_size = old.map(|e| e.footprint(&key)).unwrap_or(0);
        self.inner.account(old_size, new_size);

        Ok(())
    }

    fn stored_size(&self, key: &str) -> usize {
        self.inner.data.get(key).map(|existing| existing.footprint(key)).unwrap_or(0)
    }

    /// Retrieves a value by key
    ///
    /// Returns `None` if the key doesn't exist or has expired. An expired
    /// entry found here is removed on the spot.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let _gate = self.inner.shared();
        let entry = self.inner.data.get(key)?;

        if entry.is_expired_at(self.now()) {
            // Drop the read reference before removing
            drop(entry);
            self.inner.remove_if_expired(key);
            return None;
        }

        Some(entry.value().value().clone())
    }

    /// Deletes a key from the store
    ///
    /// Returns `true` if a live entry was removed. An expired entry is
    /// removed too, but reports `false`.
    #[must_use = "returns whether a live key existed"]
    pub fn delete(&self, key: &str) -> bool {
        let _gate = self.inner.shared();
        match self.inner.data.remove(key) {
            Some((k, entry)) => {
                self.inner.account(entry.footprint(&k), 0);
                !entry.is_expired_at(self.now())
            }
            None => false,
        }
    }

    /// Sets or refreshes the expiry of a live entry
    ///
    /// Returns `false` without changing anything if the key is absent or
    /// already expired.
    pub fn touch_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.now();
        let expires_at = deadline(now, ttl)?;
        Ok(self.update_live(key, now, |entry| entry.set_expires_at(Some(expires_at))))
    }

    /// Removes the expiry of a live entry so it never expires
    pub fn persist(&self, key: &str) -> bool {
        self.update_live(key, self.now(), |entry| entry.set_expires_at(None))
    }

    fn update_live(&self, key: &str, now: Instant, update: impl FnOnce(&mut Entry)) -> bool {
        let _gate = self.inner.shared();
        let Some(mut entry) = self.inner.data.get_mut(key) else {
            return false;
        };
        if entry.is_expired_at(now) {
            drop(entry);
            self.inner.remove_if_expired(key);
            return false;
        }
        update(&mut entry);
        true
    }

    /// Remaining lifetime of a key
    ///
    /// `None` if the key is absent or expired, `Some(None)` if it never
    /// expires.
    pub fn ttl(&self, key: &str) -> Option<Option<Duration>> {
        let _gate = self.inner.shared();
        let entry = self.inner.data.get(key)?;
        let now = self.now();
        if entry.is_expired_at(now) {
            return None;
        }
        Some(entry.expires_at().map(|at| at.saturating_duration_since(now)))
    }

    /// Checks if a key exists and is not expired.
    ///
    /// Expired entries are lazily removed when checked.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let _gate = self.inner.shared();
        match self.inner.data.get(key) {
            Some(entry) => {
                if entry.is_expired_at(self.now()) {
                    drop(entry);
                    self.inner.remove_if_expired(key);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// Deletes all entries from the store.
    ///
    /// Returns the number of entries that were removed, expired ones included.
    pub fn delete_all(&self) -> usize {
        let _gate = self.inner.exclusive();
        let count = self.inner.data.len();
        self.inner.data.clear();
        self.inner.current_size.store(0, Ordering::Relaxed);
        tracing::info!("DELETE_ALL removed {} entries", count);
        count
    }

    /// Runs a full reaper sweep on the calling thread
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        self.inner.sweep(usize::MAX)
    }

    /// Returns the number of entries in the store (including expired ones)
    #[must_use]
    pub fn len(&self) -> usize {
        let _gate = self.inner.shared();
        self.inner.data.len()
    }

    /// Returns `true` if the store holds no entries at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let _gate = self.inner.shared();
        self.inner.data.is_empty()
    }

    /// Returns the current storage size in bytes
    pub fn size_bytes(&self) -> usize {
        self.inner.current_size.load(Ordering::Relaxed)
    }

    /// Returns the maximum storage size in bytes (0 = unlimited)
    pub fn max_size_bytes(&self) -> usize {
        self.inner.max_storage_bytes
    }

    /// Returns all keys that are not expired
    pub fn keys(&self) -> Vec<String> {
        let _gate = self.inner.shared();
        let now = self.now();
        self.inner
            .data
            .iter()
            .filter(|entry| !entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Stops the background reaper
    ///
    /// This is called automatically when the last handle is dropped.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;

    fn manual_store() -> (Store, ManualClock) {
        manual_store_with_config(StoreConfig::default())
    }

    fn manual_store_with_config(config: StoreConfig) -> (Store, ManualClock) {
        let clock = ManualClock::new();
        let store = Store::with_clock(config.with_reaper(false), Arc::new(clock.clone()));
        (store, clock)
    }

    fn secs(n: u64) -> Option<Duration> {
        Some(Duration::from_secs(n))
    }

    #[test]
    fn test_put_and_get() {
        let (store, _) = manual_store();
        store.put("key1", "value1", secs(60)).unwrap();

        assert_eq!(store.get("key1"), Some(Bytes::from("value1")));
    }

    #[test]
    fn test_get_nonexistent_key() {
        let (store, _) = manual_store();
        assert_eq!(store.get("nonexistent"), None);
    }

    #[test]
    fn test_overwrite_replaces_value_and_expiry() {
        let (store, clock) = manual_store();
        store.put("key1", "value1", secs(1)).unwrap();
        store.put("key1", "value2", None).unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("key1"), Some(Bytes::from("value2")));
    }

    #[test]
    fn test_value_expires_exactly_at_ttl() {
        let (store, clock) = manual_store();
        store.put("k", "v1", secs(1)).unwrap();
        assert_eq!(store.get("k"), Some(Bytes::from("v1")));

        clock.advance(Duration::from_millis(999));
        assert_eq!(store.get("k"), Some(Bytes::from("v1")));

        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get("k"), None);
        // Lazy expiry on read physically removes the entry
        assert_eq!(store.len(), 0);
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let (store, _) = manual_store();
        let err = store.put("k", "v", Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_extreme_ttl_does_not_panic() {
        let (store, _) = manual_store();
        store.put("key1", "value1", Some(Duration::MAX)).unwrap();
        assert_eq!(store.get("key1"), Some(Bytes::from("value1")));
    }

    #[test]
    fn test_delete() {
        let (store, _) = manual_store();
        store.put("key1", "value1", secs(60)).unwrap();

        assert!(store.delete("key1"));
        assert_eq!(store.get("key1"), None);
        assert!(!store.delete("key1"));
    }

    #[test]
    fn test_delete_expired_reports_false_but_removes() {
        let (store, clock) = manual_store();
        store.put("key1", "value1", secs(1)).unwrap();
        clock.advance(Duration::from_secs(2));

        assert!(!store.delete("key1"));
        assert!(store.is_empty());
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn test_touch_expiry_extends_live_entry() {
        let (store, clock) = manual_store();
        store.put("session", "abc", secs(10)).unwrap();

        clock.advance(Duration::from_secs(8));
        assert!(store.touch_expiry("session", Duration::from_secs(10)).unwrap());

        clock.advance(Duration::from_secs(8));
        assert_eq!(store.get("session"), Some(Bytes::from("abc")));

        clock.advance(Duration::from_secs(3));
        assert_eq!(store.get("session"), None);
    }

    #[test]
    fn test_touch_expiry_on_missing_or_expired_is_noop() {
        let (store, clock) = manual_store();
        assert!(!store.touch_expiry("missing", Duration::from_secs(5)).unwrap());

        store.put("old", "v", secs(1)).unwrap();
        clock.advance(Duration::from_secs(1));
        assert!(!store.touch_expiry("old", Duration::from_secs(5)).unwrap());
        assert_eq!(store.get("old"), None);
    }

    #[test]
    fn test_touch_expiry_rejects_zero_ttl() {
        let (store, _) = manual_store();
        store.put("k", "v", None).unwrap();
        assert!(matches!(
            store.touch_expiry("k", Duration::ZERO),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_ttl_and_persist() {
        let (store, clock) = manual_store();
        store.put("k", "v", secs(30)).unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(store.ttl("k"), Some(Some(Duration::from_secs(20))));

        assert!(store.persist("k"));
        assert_eq!(store.ttl("k"), Some(None));
        clock.advance(Duration::from_secs(3600));
        assert!(store.contains_key("k"));

        assert_eq!(store.ttl("missing"), None);
        assert!(!store.persist("missing"));
    }

    #[test]
    fn test_delete_all() {
        let (store, _) = manual_store();
        store.put("key1", "value1", secs(60)).unwrap();
        store.put("key2", "value2", secs(60)).unwrap();
        store.put("key3", "value3", secs(60)).unwrap();
        assert_eq!(store.len(), 3);

        assert_eq!(store.delete_all(), 3);
        assert!(store.is_empty());
        assert_eq!(store.size_bytes(), 0);
        assert_eq!(store.get("key1"), None);
    }

    #[test]
    fn test_cleanup_removes_only_expired() {
        let (store, clock) = manual_store();
        store.put("expired1", "value1", secs(1)).unwrap();
        store.put("expired2", "value2", secs(1)).unwrap();
        store.put("valid", "value3", secs(60)).unwrap();

        clock.advance(Duration::from_secs(2));

        assert_eq!(store.len(), 3);
        assert_eq!(store.cleanup(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("valid"), Some(Bytes::from("value3")));
        assert_eq!(store.size_bytes(), "valid".len() + "value3".len());
    }

    #[test]
    fn test_reap_batch_is_bounded() {
        let (store, clock) = manual_store();
        for i in 0..10 {
            store.put(format!("k{}", i), "v", secs(1)).unwrap();
        }
        clock.advance(Duration::from_secs(1));

        let (selected, removed) = store.inner.reap_batch(4);
        assert_eq!((selected, removed), (4, 4));
        assert_eq!(store.len(), 6);

        assert_eq!(store.inner.sweep(4), 6);
        assert!(store.is_empty());
    }

    #[test]
    fn test_reaper_recheck_spares_refreshed_entry() {
        let (store, clock) = manual_store();
        store.put("k", "old", secs(1)).unwrap();
        clock.advance(Duration::from_secs(2));

        // Selected as expired, then overwritten before the delete runs
        store.put("k", "new", secs(60)).unwrap();
        assert!(!store.inner.remove_if_expired("k"));
        assert_eq!(store.get("k"), Some(Bytes::from("new")));
    }

    #[test]
    fn test_contains_key_and_keys() {
        let (store, clock) = manual_store();
        store.put("key1", "value1", secs(60)).unwrap();
        store.put("key2", "value2", secs(60)).unwrap();
        store.put("expired", "value3", secs(1)).unwrap();
        clock.advance(Duration::from_secs(1));

        assert!(store.contains_key("key1"));
        assert!(!store.contains_key("expired"));
        assert!(!store.contains_key("nonexistent"));

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["key1", "key2"]);
    }

    #[test]
    fn test_storage_size_tracking() {
        let (store, _) = manual_store_with_config(StoreConfig::default().with_max_storage_mb(0));
        assert_eq!(store.size_bytes(), 0);

        store.put("key1", "value1", secs(60)).unwrap(); // 4 + 6
        assert_eq!(store.size_bytes(), 10);

        store.put("key2", "value2", secs(60)).unwrap();
        assert_eq!(store.size_bytes(), 20);

        store.put("key1", "x", secs(60)).unwrap(); // delta: -5
        assert_eq!(store.size_bytes(), 15);

        let _ = store.delete("key1");
        assert_eq!(store.size_bytes(), 10);
        let _ = store.delete("key2");
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn test_storage_limit_enforced() {
        let config = StoreConfig::default().with_max_storage_bytes(50);
        let (store, _) = manual_store_with_config(config);

        for i in 1..=5 {
            store.put(format!("key{}", i), format!("value{}", i), secs(60)).unwrap();
        }

        let result = store.put("key6", "value6", secs(60));
        match result {
            Err(Error::StorageFull { current_bytes, max_bytes }) => {
                assert_eq!(current_bytes, 50);
                assert_eq!(max_bytes, 50);
            }
            other => panic!("expected StorageFull, got {:?}", other),
        }
        assert!(!store.contains_key("key6"));
        assert_eq!(store.len(), 5);

        // Overwrites that do not grow still succeed at the limit
        store.put("key1", "valueX", secs(60)).unwrap();
        store.put("key1", "x", secs(60)).unwrap();
        assert_eq!(store.size_bytes(), 45);
    }

    #[test]
    fn test_full_store_reclaims_expired_entries_before_rejecting() {
        let config = StoreConfig::default().with_max_storage_bytes(50);
        let (store, clock) = manual_store_with_config(config);
        for i in 1..=3 {
            store.put(format!("key{}", i), format!("value{}", i), secs(1)).unwrap();
        }
        store.put("key4", "value4", None).unwrap();
        store.put("key5", "value5", None).unwrap();
        assert!(matches!(store.put("key6", "value6", None), Err(Error::StorageFull { .. })));

        clock.advance(Duration::from_secs(1));
        store.put("key6", "value6", None).unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.size_bytes(), 30);

        // Live entries are never reclaimed to make room
        store.put("key7", "value7", None).unwrap();
        store.put("key8", "value8", None).unwrap();
        assert!(matches!(store.put("key9", "value9", None), Err(Error::StorageFull { .. })));
        assert_eq!(store.get("key4"), Some(Bytes::from("value4")));
    }

    #[test]
    fn test_log_key_truncates_on_char_boundary() {
        assert_eq!(log_key("short"), "short");
        assert_eq!(log_key("user:session:123456789"), "user:session:123");
        assert_eq!(log_key("ééééééééééééééééé"), "éééééééééééééééé");
    }

    #[test]
    fn test_store_without_runtime_still_works() {
        // No Tokio runtime here: the reaper is skipped, the store is usable
        let store = Store::with_config(StoreConfig::default());
        store.put("k", "v", secs(60)).unwrap();
        assert_eq!(store.get("k"), Some(Bytes::from("v")));
    }

    #[test]
    fn test_concurrent_writes() {
        let (store, _) = manual_store();
        let store = Arc::new(store);
        let mut handles = vec![];

        for thread_id in 0..10 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("thread{}:key{}", thread_id, i);
                    store.put(key, format!("value{}", i), secs(60)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        assert_eq!(store.len(), 1000);
    }

    #[test]
    fn test_concurrent_cleanup_with_operations() {
        let (store, clock) = manual_store();
        let store = Arc::new(store);

        for i in 0..50 {
            store.put(format!("expiring{}", i), "value", secs(1)).unwrap();
            store.put(format!("persistent{}", i), "value", secs(60)).unwrap();
        }
        clock.advance(Duration::from_secs(2));

        let mut handles = vec![];
        let cleaner = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let _ = cleaner.cleanup();
        }));
        for _ in 0..3 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    assert!(store.get(&format!("expiring{}", i)).is_none());
                    assert!(store.get(&format!("persistent{}", i)).is_some());
                }
            }));
        }
        let writer = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for i in 0..50 {
                writer.put(format!("new{}", i), "value", secs(60)).unwrap();
            }
        }));
        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        assert_eq!(store.len(), 100);
        assert_eq!(store.size_bytes(), store.keys().iter().map(|k| k.len() + 5).sum::<usize>());
    }

    #[tokio::test]
    async fn test_background_reaper_runs() {
        let config = StoreConfig::default()
            .with_cleanup_interval(Duration::from_millis(50))
            .with_reaper_batch_size(2);
        let store = Store::with_config(config);

        store.put("expire1", "value1", Some(Duration::from_millis(10))).unwrap();
        store.put("expire2", "value2", Some(Duration::from_millis(10))).unwrap();
        store.put("expire3", "value3", Some(Duration::from_millis(10))).unwrap();
        store.put("keep", "value4", secs(60)).unwrap();
        assert_eq!(store.len(), 4);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("keep"), Some(Bytes::from("value4")));
    }

    #[tokio::test]
    async fn test_shutdown_stops_reaper() {
        let config = StoreConfig::default().with_cleanup_interval(Duration::from_millis(20));
        let store = Store::with_config(config);
        store.shutdown();
        tokio::time::sleep(Duration::from_millis(30)).await;

        store.put("k", "v", Some(Duration::from_millis(5))).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Still physically present: only the reaper would have removed it
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k"), None);
    }

    #[tokio::test]
    async fn test_store_clone_shares_data() {
        let store1 = Store::new();
        let store2 = store1.clone();

        store1.put("key1", "value1", secs(60)).unwrap();
        assert_eq!(store2.get("key1"), Some(Bytes::from("value1")));

        store2.put("key2", "value2", secs(60)).unwrap();
        assert_eq!(store1.get("key2"), Some(Bytes::from("value2")));
    }

    #[tokio::test]
    async fn test_dropping_store_stops_reaper() {
        let config = StoreConfig::default().with_cleanup_interval(Duration::from_millis(10));
        let store = Store::with_config(config);
        let weak = Arc::downgrade(&store.inner);
        drop(store);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(weak.upgrade().is_none());
    }
}
