//! Token-keyed correlation cache bridging the DNS and HTTP halves of a probe.
//!
//! Entries are bounded two ways: the LRU drops the oldest insert once
//! `capacity` is reached, and every entry carries its own expiry that reads
//! check before returning it. Reads use `peek`, so they never reorder the
//! LRU and never extend an entry's life.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::MapperError;
use crate::metrics;

/// What the DNS half of a probe saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Address of the resolver that asked.
    pub resolver_ip: String,
    /// EDNS0 client subnet in CIDR notation, if the resolver sent one.
    pub client_subnet: Option<String>,
    expires: Instant,
}

impl Observation {
    /// When this observation stops being readable.
    pub fn expires(&self) -> Instant {
        self.expires
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires
    }
}

/// Thread-safe, clonable handle to the shared cache.
#[derive(Debug, Clone)]
pub struct CorrelationCache {
    inner: Arc<Mutex<LruCache<String, Observation>>>,
    ttl: Duration,
}

impl CorrelationCache {
    /// Create a cache holding at most `capacity` tokens for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self, MapperError> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            MapperError::Config("cache capacity must be greater than zero".to_string())
        })?;
        Ok(Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
            ttl,
        })
    }

    /// Lifetime given to each new observation.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record an observation for `token`.
    ///
    /// Fails with [`MapperError::TokenInUse`] if the token already has a live
    /// entry; the existing observation is left untouched. An expired entry
    /// still sitting in the LRU is replaced.
    pub fn insert(
        &self,
        token: &str,
        resolver_ip: &str,
        client_subnet: Option<&str>,
    ) -> Result<(), MapperError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.peek(token).is_some_and(|entry| entry.is_live(now)) {
            drop(inner);
            debug!(token, "token already observed, keeping first observation");
            metrics::record_cache_insert(false);
            return Err(MapperError::TokenInUse(token.to_string()));
        }

        inner.put(
            token.to_string(),
            Observation {
                resolver_ip: resolver_ip.to_string(),
                client_subnet: client_subnet.map(str::to_string),
                expires: now + self.ttl,
            },
        );
        let entries = inner.len();
        drop(inner);

        trace!(token, resolver_ip, ?client_subnet, "stored observation");
        metrics::record_cache_insert(true);
        metrics::record_cache_entries(entries);
        Ok(())
    }

    /// Look up the live observation for `token`, if any.
    pub fn lookup(&self, token: &str) -> Option<Observation> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .peek(token)
            .filter(|entry| entry.is_live(now))
            .cloned()
    }

    /// Number of entries physically held, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
