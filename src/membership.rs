//! Keyed existence store used for duplicate detection.
//!
//! [`MembershipCache`] is the seam to the external key-value store. The crate
//! ships an in-memory implementation backed by `DashMap` and, behind the
//! `membership-redis` feature, a Redis-backed one.

use crate::error::PipelineError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::trace;

#[async_trait]
pub trait MembershipCache: Send + Sync + 'static {
    async fn exists(&self, key: &str) -> Result<bool, PipelineError>;

    /// Stores `key`. `ttl = None` keeps it until cleared externally.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), PipelineError>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-local membership cache. Expired keys are evicted lazily on lookup.
#[derive(Default)]
pub struct InMemoryMembershipCache {
    entries: DashMap<String, Entry>,
}

impl InMemoryMembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value stored under `key`, if it has not expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }
}

#[async_trait]
impl MembershipCache for InMemoryMembershipCache {
    async fn exists(&self, key: &str) -> Result<bool, PipelineError> {
        let now = Instant::now();
        let live = match self.entries.get(key) {
            Some(entry) => entry.is_live(now),
            None => return Ok(false),
        };
        if !live {
            trace!("Evicting expired membership key {}", key);
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(live)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), PipelineError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }
}

#[cfg(feature = "membership-redis")]
pub use redis_cache::RedisMembershipCache;

#[cfg(feature = "membership-redis")]
mod redis_cache {
    use super::MembershipCache;
    use crate::error::PipelineError;
    use async_trait::async_trait;
    use redis::Commands;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tracing::info;

    /// Membership cache stored in Redis. Blocking Redis calls run on the blocking pool.
    pub struct RedisMembershipCache {
        conn: Arc<Mutex<redis::Connection>>,
    }

    impl RedisMembershipCache {
        /// Connects to e.g. `redis://localhost:6379/0`.
        pub fn connect(url: &str) -> Result<Self, PipelineError> {
            info!("Connecting RedisMembershipCache to {}", url);
            let client = redis::Client::open(url)?;
            let conn = client.get_connection()?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }
    }

    #[async_trait]
    impl MembershipCache for RedisMembershipCache {
        async fn exists(&self, key: &str) -> Result<bool, PipelineError> {
            let conn = Arc::clone(&self.conn);
            let key = key.to_string();
            tokio::task::spawn_blocking(move || {
                let mut conn = conn.blocking_lock();
                conn.exists::<_, bool>(key).map_err(PipelineError::from)
            })
            .await?
        }

        async fn set(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<(), PipelineError> {
            let conn = Arc::clone(&self.conn);
            let key = key.to_string();
            let value = value.to_string();
            tokio::task::spawn_blocking(move || {
                let mut conn = conn.blocking_lock();
                match ttl {
                    Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)),
                    None => conn.set::<_, _, ()>(key, value),
                }
                .map_err(PipelineError::from)
            })
            .await?
        }
    }
}
