//! Window index math and store key derivation.

use chrono::{DateTime, TimeZone, Utc};

use super::policy::Quota;

/// Identifies the counter for one organization in one fixed window.
///
/// The window index is `floor(now / window)` on the gateway's clock, so
/// every process derives the same key for the same instant without
/// coordinating.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The organization the counter belongs to
    pub org_id: String,
    /// Window length in milliseconds
    pub window_ms: i64,
    /// Index of the window since the Unix epoch
    pub index: i64,
}

impl WindowKey {
    /// Compute the key for `org_id` at `now` under `quota`.
    pub fn new(org_id: &str, quota: &Quota, now: DateTime<Utc>) -> Self {
        let window_ms = i64::try_from(quota.window().as_millis()).unwrap_or(i64::MAX);
        let index = now.timestamp_millis().div_euclid(window_ms);

        Self {
            org_id: org_id.to_string(),
            window_ms,
            index,
        }
    }

    /// When this window opened.
    pub fn window_start(&self) -> DateTime<Utc> {
        millis_to_datetime(self.index.saturating_mul(self.window_ms))
    }

    /// When this window closes (exclusive).
    pub fn window_end(&self) -> DateTime<Utc> {
        millis_to_datetime(
            self.index
                .saturating_add(1)
                .saturating_mul(self.window_ms),
        )
    }

    /// The key under which the counter is stored.
    /// Format: "{prefix}:{org}:{window_ms}:{index}"
    pub fn store_key(&self, prefix: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            prefix, self.org_id, self.window_ms, self.index
        )
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
