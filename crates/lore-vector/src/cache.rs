//! Content-addressed embedding cache with request coalescing.
//!
//! Keys are [`fingerprint`]s of (model, normalized text). Concurrent misses on
//! the same key share one computation through an in-flight table of
//! `OnceCell`s; every caller receives the same vector or the same error.
//!
//! Entries live in an [`LruCache`], so hits, inserts and evictions are O(1)
//! and never scan the map while holding its lock. Expired entries are
//! dropped when looked up or when they reach the cold end.
//!
//! Lock order: a miss takes `inflight` and, while holding it, re-checks
//! `entries`. A completed computation writes `entries` first and only then
//! clears its `inflight` slot, so a caller never misses both.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::debug;

use lore_core::config::EmbeddingConfig;
use lore_core::error::{LoreError, Result};
use lore_core::text::fingerprint;

type Shared = Arc<OnceCell<std::result::Result<Arc<Vec<f32>>, LoreError>>>;

/// A cached vector.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub vector: Arc<Vec<f32>>,
    pub dimension: usize,
    pub model: String,
    pub created_at: Instant,
}

/// Counters reported by [`EmbeddingCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Misses that joined a computation already in flight.
    pub coalesced: u64,
    pub evictions: u64,
}

pub struct EmbeddingCache {
    capacity: usize,
    ttl: Option<Duration>,
    entries: Mutex<LruCache<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, Shared>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl EmbeddingCache {
    /// `capacity` of 0 disables the size bound; `ttl` of `None` disables expiry.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity,
            ttl,
            entries: Mutex::new(match NonZeroUsize::new(capacity) {
                Some(cap) => LruCache::new(cap),
                None => LruCache::unbounded(),
            }),
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(config.cache_capacity, config.cache_ttl())
    }

    /// Return the cached vector for `text`, or run `compute` once for all
    /// concurrent callers asking for the same fingerprint.
    ///
    /// Errors are shared with the callers that were waiting but are not
    /// cached; the next call computes again.
    pub async fn get_or_compute<F, Fut>(&self, model: &str, text: &str, compute: F) -> Result<Arc<Vec<f32>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>>>,
    {
        let key = fingerprint(model, text);
        if let Some(vector) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(vector);
        }

        let (cell, joined) = {
            let mut inflight = lock(&self.inflight);
            if let Some(vector) = self.lookup(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(vector);
            }
            match inflight.get(&key) {
                Some(cell) => (Arc::clone(cell), true),
                None => {
                    let cell: Shared = Arc::new(OnceCell::new());
                    inflight.insert(key.clone(), Arc::clone(&cell));
                    (cell, false)
                }
            }
        };

        if joined {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %&key[..12], "Joining in-flight embedding");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        // If the caller running the computation is cancelled, the next waiter
        // in line runs its own `compute` instead.
        let mut ran = false;
        let result = cell
            .get_or_init(|| {
                ran = true;
                let fut = compute();
                async move { fut.await.map(Arc::new) }
            })
            .await
            .clone();

        if ran {
            if let Ok(vector) = &result {
                self.insert(key.clone(), Arc::clone(vector), model);
            }
            let mut inflight = lock(&self.inflight);
            if inflight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                inflight.remove(&key);
            }
        }
        result
    }

    /// Cached vector for `text`, if resident and fresh.
    pub fn get(&self, model: &str, text: &str) -> Option<Arc<Vec<f32>>> {
        self.lookup(&fingerprint(model, text))
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. In-flight computations are unaffected.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        let mut entries = lock(&self.entries);
        let now = Instant::now();
        match entries.get(key) {
            None => return None,
            Some(entry) if !self.is_expired(entry, now) => return Some(Arc::clone(&entry.vector)),
            Some(_) => {}
        }
        entries.pop(key);
        None
    }

    fn insert(&self, key: String, vector: Arc<Vec<f32>>, model: &str) {
        let now = Instant::now();
        let entry = CacheEntry {
            dimension: vector.len(),
            vector,
            model: model.to_string(),
            created_at: now,
        };
        let displaced = lock(&self.entries).push(key.clone(), entry);
        if let Some((old_key, old)) = displaced {
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    expired = self.is_expired(&old, now),
                    "Embedding cache evicted least recently used entry"
                );
            }
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(entry.created_at) >= ttl)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}
