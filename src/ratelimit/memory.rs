//! In-process counter store.
//!
//! Only coordinates requests within a single process. Useful for local
//! development, single-instance deployments and tests; multi-process
//! deployments need the Redis store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::store::{CounterStore, StoreError};

const DEFAULT_SWEEP_SECS: i64 = 60;

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl CounterEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// A `CounterStore` held in process memory.
///
/// Increments take the shard lock for the key, so concurrent tasks never
/// lose an update. Every window gets a fresh key and old ones are never
/// touched again, so the first increment after each sweep interval also
/// runs [`MemoryCounterStore::purge_expired`]. Memory stays bounded to the
/// organizations active in recent windows.
pub struct MemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    sweep_interval: ChronoDuration,
    next_sweep: Mutex<DateTime<Utc>>,
}

impl MemoryCounterStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store whose expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            entries: DashMap::new(),
            clock,
            sweep_interval: ChronoDuration::seconds(DEFAULT_SWEEP_SECS),
            next_sweep: Mutex::new(now),
        }
    }

    /// Set how often increments sweep expired keys.
    ///
    /// Intervals chrono cannot represent keep the default.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        if let Ok(interval) = ChronoDuration::from_std(interval) {
            self.sweep_interval = interval;
        }
        self
    }

    fn sweep_if_due(&self, now: DateTime<Utc>) {
        {
            let mut next = self.next_sweep.lock();
            if now < *next {
                return;
            }
            *next = now
                .checked_add_signed(self.sweep_interval)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
        self.purge_expired();
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            trace!(purged, "Purged expired counters");
        }
        purged
    }

    /// Number of keys currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        // Must run before taking the entry lock below
        self.sweep_if_due(now);

        let mut entry = self.entries.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: None,
        });

        if entry.is_expired(now) {
            entry.count = 0;
            entry.expires_at = None;
        }

        entry.count += 1;
        Ok(entry.count)
    }

    async fn set_expiry_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let ttl = ChronoDuration::from_std(ttl)
            .map_err(|e| StoreError::Malformed(format!("ttl out of range: {}", e)))?;

        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) && entry.expires_at.is_none() => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now();
        let remaining = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .filter(|at| *at > now)
            .and_then(|at| (at - now).to_std().ok());
        Ok(remaining)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
