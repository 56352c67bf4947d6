use bytes::Bytes;
use std::time::Instant;

/// Represents a stored value with its optional expiration time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    /// Creates a new entry with the given value and expiration time
    pub fn new(value: Bytes, expires_at: Option<Instant>) -> Self {
        Self { value, expires_at }
    }

    /// Returns the stored bytes
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Returns the expiration time, `None` for entries that never expire
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub(crate) fn set_expires_at(&mut self, expires_at: Option<Instant>) {
        self.expires_at = expires_at;
    }

    /// Checks if this entry is a tombstone at `now`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }

    /// Bytes this entry accounts for in the storage budget
    pub(crate) fn footprint(&self, key: &str) -> usize {
        key.len() + self.value.len()
    }
}
