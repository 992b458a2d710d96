//! Redis-backed counter store.
//!
//! All gateway processes point at the same Redis, which makes it the single
//! source of truth for admission counters.
//!
//! ## Commands
//!
//! - `INCR` for the atomic increment
//! - `PTTL` to read the remaining lifetime at millisecond granularity
//! - a small script that applies `PEXPIRE` only when the key exists without
//!   an expiry, equivalent to `PEXPIRE ... NX` on servers older than 7.0
//!
//! The connection is a `redis::aio::ConnectionManager`, which multiplexes
//! commands over one connection and reconnects on its own after failures.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::store::{CounterStore, StoreError};

const EXPIRE_IF_ABSENT: &str = r#"
if redis.call('PTTL', KEYS[1]) == -1 then
    return redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return 0
"#;

/// Counter store backed by a Redis server.
pub struct RedisCounterStore {
    connection: ConnectionManager,
    expire_if_absent: Script,
}

impl RedisCounterStore {
    /// Connect to the Redis server at `url`.
    ///
    /// Supports both `redis://` and `rediss://` URLs.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(url = %redact_url(url), "Connected to Redis counter store");
        Ok(Self::from_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            expire_if_absent: Script::new(EXPIRE_IF_ABSENT),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.incr(key, 1_i64).await?;
        u64::try_from(value)
            .map_err(|_| StoreError::Malformed(format!("INCR {} returned {}", key, value)))
    }

    async fn set_expiry_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let armed: i64 = self
            .expire_if_absent
            .key(key)
            .arg(millis)
            .invoke_async(&mut conn)
            .await?;

        if armed == 1 {
            debug!(key = %key, ttl_ms = millis, "Armed counter expiry");
        }
        Ok(armed == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.connection.clone();
        let millis: i64 = conn.pttl(key).await?;
        ttl_from_pttl(key, millis)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(StoreError::Malformed(format!("PING returned {}", reply)));
        }
        Ok(())
    }
}

/// Interpret a `PTTL` reply: -2 means no key, -1 means no expiry.
fn ttl_from_pttl(key: &str, millis: i64) -> Result<Option<Duration>, StoreError> {
    match millis {
        -2 | -1 => Ok(None),
        ms if ms >= 0 => Ok(Some(Duration::from_millis(ms as u64))),
        other => Err(StoreError::Malformed(format!(
            "PTTL {} returned {}",
            key, other
        ))),
    }
}

/// Hide credentials in a connection URL before logging it.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
