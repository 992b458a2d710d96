//! Fixed-window admission engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::key::WindowKey;
use super::policy::{Policy, Quota};
use super::store::{CounterStore, StoreError};

/// Default prefix for counter keys in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "tollgate:ratelimit";
/// Default bound on one admission check's store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// The outcome of one admission check.
///
/// Recomputed on every call and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Admissions per window for this organization
    pub limit: u64,
    /// Admissions left in the current window
    pub remaining: u64,
    /// When the current window's budget resets
    pub reset_at: DateTime<Utc>,
}

impl Verdict {
    /// Whole seconds until the reset, never less than one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

/// Decides admission for organizations against a shared counter store.
///
/// The engine keeps no counter state of its own: every check increments the
/// store and reads back the result, so any gateway process can serve any
/// organization. Rejected requests are still counted, which keeps a storm
/// of retries from being free.
pub struct AdmissionEngine {
    /// The shared counter store
    store: Arc<dyn CounterStore>,
    /// Quotas by tier
    policy: Policy,
    /// Source of "now" for window computation
    clock: Arc<dyn Clock>,
    /// Prefix for counter keys
    key_prefix: String,
    /// Bound on the store round trip of one check
    timeout: Duration,
}

impl AdmissionEngine {
    /// Create an engine with the system clock and default settings.
    pub fn new(store: Arc<dyn CounterStore>, policy: Policy) -> Self {
        Self {
            store,
            policy,
            clock: Arc::new(SystemClock::new()),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Use a different clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a different key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Use a different store timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The policy this engine enforces.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The engine's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Check that the backing store is reachable within the timeout.
    pub async fn ping(&self) -> Result<(), StoreError> {
        match tokio::time::timeout(self.timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    /// Account for one request from `org_id` and report the verdict.
    ///
    /// Fails only when the store is unreachable, slow, or answers with
    /// something unexpected. A denial is a successful check with
    /// `allowed == false`, never an error.
    pub async fn check_limit(
        &self,
        org_id: &str,
        tier: Option<&str>,
    ) -> Result<Verdict, StoreError> {
        let now = self.clock.now();
        let quota = self.policy.quota_for(tier);
        let key = WindowKey::new(org_id, &quota, now);

        match tokio::time::timeout(self.timeout, self.account(&key, &quota, now)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn account(
        &self,
        key: &WindowKey,
        quota: &Quota,
        now: DateTime<Utc>,
    ) -> Result<Verdict, StoreError> {
        let store_key = key.store_key(&self.key_prefix);

        trace!(key = %store_key, "Checking admission");

        let count = self.store.incr(&store_key).await?;
        if count == 0 {
            return Err(StoreError::Malformed(format!(
                "increment of {} returned zero",
                store_key
            )));
        }

        // First write to a fresh window arms its expiry.
        if count == 1 {
            self.store
                .set_expiry_if_absent(&store_key, quota.window())
                .await?;
        }

        let ttl = self.store.ttl(&store_key).await?;
        if ttl.is_none() {
            // Either the read raced the expiry command or the process that
            // created the key died before arming it. Both are repaired here.
            let repaired = self
                .store
                .set_expiry_if_absent(&store_key, quota.window())
                .await?;
            if repaired && count > 1 {
                warn!(key = %store_key, count, "Re-armed expiry on orphaned counter");
            }
        }

        let window_end = key.window_end();
        let reset_at = ttl
            .and_then(|ttl| ChronoDuration::from_std(ttl).ok())
            .map(|ttl| (now + ttl).min(window_end))
            .unwrap_or(window_end);

        let limit = quota.limit();
        let allowed = count <= limit;

        if !allowed {
            debug!(
                org_id = %key.org_id,
                count,
                limit,
                "Admission limit exceeded"
            );
        }

        Ok(Verdict {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::memory::MemoryCounterStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn start_of_minute() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn engine_with(limit: u64) -> (AdmissionEngine, Arc<MemoryCounterStore>, ManualClock) {
        let clock = ManualClock::new(start_of_minute());
        let store = Arc::new(MemoryCounterStore::with_clock(Arc::new(clock.clone())));
        let policy = Policy::new(Quota::new(limit, Duration::from_secs(60)).unwrap());
        let engine = AdmissionEngine::new(store.clone(), policy).with_clock(Arc::new(clock.clone()));
        (engine, store, clock)
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn incr(&self, _key: &str) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn set_expiry_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    struct SlowStore;

    #[async_trait]
    impl CounterStore for SlowStore {
        async fn incr(&self, _key: &str) -> Result<u64, StoreError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(1)
        }
        async fn set_expiry_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
            Ok(true)
        }
        async fn ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
            Ok(None)
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_limit_sequence_within_window() {
        let (engine, _store, clock) = engine_with(3);

        let mut verdicts = Vec::new();
        for _ in 0..4 {
            verdicts.push(engine.check_limit("A", None).await.unwrap());
            clock.advance(Duration::from_secs(2));
        }

        let allowed: Vec<bool> = verdicts.iter().map(|v| v.allowed).collect();
        let remaining: Vec<u64> = verdicts.iter().map(|v| v.remaining).collect();
        assert_eq!(allowed, vec![true, true, true, false]);
        assert_eq!(remaining, vec![2, 1, 0, 0]);
        assert!(verdicts.iter().all(|v| v.limit == 3));

        // Another organization is unaffected
        let other = engine.check_limit("B", None).await.unwrap();
        assert!(other.allowed);
        assert_eq!(other.remaining, 2);

        // Next window starts over
        clock.advance(Duration::from_secs(60));
        let fresh = engine.check_limit("A", None).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 2);
    }

    #[tokio::test]
    async fn test_rejected_requests_are_counted() {
        let (engine, store, clock) = engine_with(1);

        for _ in 0..5 {
            engine.check_limit("A", None).await.unwrap();
        }

        let quota = engine.policy().quota_for(None);
        let key = WindowKey::new("A", &quota, clock.now()).store_key(DEFAULT_KEY_PREFIX);
        assert_eq!(store.incr(&key).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_reset_at_is_window_end() {
        let (engine, _store, clock) = engine_with(10);
        let window_end = start_of_minute() + ChronoDuration::seconds(60);

        clock.advance(Duration::from_secs(15));
        let first = engine.check_limit("A", None).await.unwrap();
        clock.advance(Duration::from_secs(20));
        let second = engine.check_limit("A", None).await.unwrap();

        assert_eq!(first.reset_at, window_end);
        assert_eq!(second.reset_at, window_end);
    }

    #[tokio::test]
    async fn test_orphaned_counter_gets_expiry() {
        let (engine, store, clock) = engine_with(10);
        let quota = engine.policy().quota_for(None);
        let key = WindowKey::new("A", &quota, clock.now()).store_key(DEFAULT_KEY_PREFIX);

        // A crashed process left a counter without expiry
        store.incr(&key).await.unwrap();
        assert_eq!(store.ttl(&key).await.unwrap(), None);

        let verdict = engine.check_limit("A", None).await.unwrap();
        assert_eq!(verdict.remaining, 8);
        assert_eq!(store.ttl(&key).await.unwrap(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_old_windows_do_not_accumulate() {
        let (engine, store, clock) = engine_with(10);

        for _ in 0..100 {
            engine.check_limit("A", None).await.unwrap();
            clock.advance(Duration::from_secs(180));
        }

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_tier_quota_applies() {
        let clock = ManualClock::new(start_of_minute());
        let store = Arc::new(MemoryCounterStore::with_clock(Arc::new(clock.clone())));
        let policy = Policy::new(Quota::new(1, Duration::from_secs(60)).unwrap())
            .with_tier("premium", Quota::new(100, Duration::from_secs(60)).unwrap());
        let engine = AdmissionEngine::new(store, policy).with_clock(Arc::new(clock));

        let verdict = engine.check_limit("A", Some("premium")).await.unwrap();
        assert_eq!(verdict.limit, 100);
        assert_eq!(verdict.remaining, 99);

        engine.check_limit("B", None).await.unwrap();
        let denied = engine.check_limit("B", None).await.unwrap();
        assert!(!denied.allowed);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error_not_a_denial() {
        let policy = Policy::new(Quota::new(10, Duration::from_secs(60)).unwrap());
        let engine = AdmissionEngine::new(Arc::new(BrokenStore), policy);

        let result = engine.check_limit("A", None).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(engine.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let policy = Policy::new(Quota::new(10, Duration::from_secs(60)).unwrap());
        let engine = AdmissionEngine::new(Arc::new(SlowStore), policy)
            .with_timeout(Duration::from_millis(10));

        let result = engine.check_limit("A", None).await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let (engine, _store, _clock) = engine_with(10);
        let engine = Arc::new(engine);

        let checks = (0..50).map(|_| {
            let engine = engine.clone();
            async move { engine.check_limit("A", None).await.unwrap() }
        });
        let verdicts = futures::future::join_all(checks).await;

        assert_eq!(verdicts.iter().filter(|v| v.allowed).count(), 10);
        assert!(verdicts.iter().filter(|v| !v.allowed).all(|v| v.remaining == 0));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = start_of_minute();
        let verdict = Verdict {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_at: now + ChronoDuration::milliseconds(1500),
        };
        assert_eq!(verdict.retry_after_secs(now), 2);
        assert_eq!(verdict.retry_after_secs(now + ChronoDuration::seconds(5)), 1);
    }
}
