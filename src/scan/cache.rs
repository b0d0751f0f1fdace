//! Verdict cache keyed by content fingerprint.
//!
//! The gateway consults this before dispatching to the external scanner.
//! The trait is the pluggable seam; the bundled implementation is a bounded
//! in-process LRU. Cache failures must degrade to live scanning, so both
//! operations return `RelayResult` and callers treat errors as misses.

use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use super::unit::{Fingerprint, ScanVerdict};
use crate::error::RelayResult;

/// A cached verdict with its insertion time.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub verdict: ScanVerdict,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(verdict: ScanVerdict, ttl: Duration) -> Self {
        Self {
            verdict,
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// Pluggable fingerprint -> verdict store.
#[async_trait]
pub trait VerdictCache: Send + Sync {
    /// Live entry for the fingerprint, or None. Expired entries are misses.
    async fn get(&self, fingerprint: &Fingerprint) -> RelayResult<Option<ScanVerdict>>;

    /// Store a verdict, overwriting any existing entry (last-write-wins).
    async fn put(&self, fingerprint: Fingerprint, verdict: ScanVerdict) -> RelayResult<()>;
}

/// Bounded in-process cache with LRU eviction and a uniform TTL.
pub struct MemoryVerdictCache {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    ttl: Duration,
}

impl MemoryVerdictCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl VerdictCache for MemoryVerdictCache {
    async fn get(&self, fingerprint: &Fingerprint) -> RelayResult<Option<ScanVerdict>> {
        let mut entries = self.entries.lock();

        let expired = match entries.get(fingerprint) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Ok(Some(entry.verdict.clone())),
            None => return Ok(None),
        };
        if expired {
            entries.pop(fingerprint);
        }
        Ok(None)
    }

    async fn put(&self, fingerprint: Fingerprint, verdict: ScanVerdict) -> RelayResult<()> {
        let entry = CacheEntry::new(verdict, self.ttl);
        self.entries.lock().push(fingerprint, entry);
        Ok(())
    }
}
