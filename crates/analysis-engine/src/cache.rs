//! Time-to-live caching in front of slow or rate-limited data sources
//!
//! Each [`CacheCategory`] is an independent namespace with its own ttl.
//! Expired entries are treated as absent and evicted lazily on access; a
//! background sweeper removes entries that stay untouched past their expiry.
//!
//! [`TtlCache::get_or_load`] is single-flight per key: concurrent callers for
//! the same missing key share one loader invocation and its outcome. Failed
//! loads are never stored. A load lives only as long as someone awaits it:
//! once every caller is gone the load is dropped and the next caller starts
//! a fresh one.

use crate::config::CacheConfig;
use crate::error::{EngineError, Result};
use crate::pool::panic_message;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Independent cache namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    Price,
    Fundamental,
    News,
    Industry,
    Analysis,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 5] = [
        CacheCategory::Price,
        CacheCategory::Fundamental,
        CacheCategory::News,
        CacheCategory::Industry,
        CacheCategory::Analysis,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Fundamental => "fundamental",
            Self::News => "news",
            Self::Industry => "industry",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

type LoadFuture<V> = Shared<BoxFuture<'static, Result<V>>>;

/// In-flight load, held weakly so abandoned loads are dropped
struct PendingLoad<V> {
    id: u64,
    load: WeakShared<BoxFuture<'static, Result<V>>>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    /// Fraction of reads served from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

struct Inner<V> {
    label: String,
    default_ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
    inflight: Mutex<HashMap<String, PendingLoad<V>>>,
    next_load: AtomicU64,
    counters: Counters,
}

impl<V: Clone> Inner<V> {
    fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let state = entries
            .get(key)
            .map(|entry| entry.is_fresh(now).then(|| entry.value.clone()));
        let fresh = match state {
            Some(Some(value)) => Some(value),
            Some(None) => {
                entries.remove(key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };
        drop(entries);

        let counter = if fresh.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        fresh
    }

    fn store(&self, key: String, value: V, ttl: Duration) {
        self.entries.lock().insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }
}

/// Thread-safe ttl cache for one namespace
pub struct TtlCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a new cache with the ttl used by [`insert`](Self::insert)
    pub fn new(label: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                default_ttl,
                entries: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                next_load: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Get a fresh value; expired entries are evicted and reported as a miss
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.inner.lookup(key);
        debug!(cache = %self.inner.label, key, hit = value.is_some(), "Cache lookup");
        value
    }

    /// Store a value with an explicit ttl
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.inner.store(key.into(), value, ttl);
    }

    /// Store a value with the default ttl
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.put(key, value, self.inner.default_ttl);
    }

    /// Remove an entry, returning whether one was present
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.entries.lock().remove(key).is_some()
    }

    /// Return the cached value or run `loader` once for all concurrent callers
    ///
    /// Only a successful load is stored. Every caller that joined a failing
    /// load receives the same error; the next call starts a fresh load.
    pub async fn get_or_load<F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(value) = self.inner.lookup(key) {
            debug!(cache = %self.inner.label, key, "Cache hit");
            return Ok(value);
        }

        let load = {
            let mut inflight = self.inner.inflight.lock();
            let joined = inflight.get(key).and_then(|pending| pending.load.upgrade());
            if let Some(pending) = joined {
                debug!(cache = %self.inner.label, key, "Joining in-flight load");
                pending
            } else {
                // A load may have completed between the lookup above and taking the lock.
                if let Some(value) = self.peek(key) {
                    return Ok(value);
                }

                debug!(cache = %self.inner.label, key, "Cache miss, loading");
                self.inner.counters.loads.fetch_add(1, Ordering::Relaxed);
                let id = self.inner.next_load.fetch_add(1, Ordering::Relaxed);
                let load = Self::leader(Arc::downgrade(&self.inner), key.to_string(), id, ttl, loader());
                if let Some(weak) = load.downgrade() {
                    inflight.insert(key.to_string(), PendingLoad { id, load: weak });
                }
                load
            }
        };

        load.await
    }

    fn leader<Fut>(inner: Weak<Inner<V>>, key: String, id: u64, ttl: Duration, fut: Fut) -> LoadFuture<V>
    where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        async move {
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(EngineError::Panicked(panic_message(panic.as_ref()))),
            };
            if let Some(inner) = inner.upgrade() {
                match &outcome {
                    Ok(value) => inner.store(key.clone(), value.clone(), ttl),
                    Err(err) => {
                        inner.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(cache = %inner.label, key = %key, error = %err, "Cache load failed");
                    }
                }
                let mut inflight = inner.inflight.lock();
                if inflight.get(&key).is_some_and(|pending| pending.id == id) {
                    inflight.remove(&key);
                }
            }
            outcome
        }
        .boxed()
        .shared()
    }

    fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.inner
            .entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value.clone())
    }

    /// Remove entries older than `stored_at + ttl + grace`
    pub fn sweep(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.stored_at) < entry.ttl.saturating_add(grace));
        let removed = before - entries.len();
        drop(entries);
        self.inner
            .inflight
            .lock()
            .retain(|_, pending| pending.load.upgrade().is_some());

        if removed > 0 {
            self.inner
                .counters
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(cache = %self.inner.label, removed, "Swept expired entries");
        }
        removed
    }

    /// Clear all cached entries
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            loads: counters.loads.load(Ordering::Relaxed),
            load_failures: counters.load_failures.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            size: self.len(),
        }
    }
}

/// One JSON cache per category
#[derive(Clone)]
pub struct CacheManager {
    caches: Arc<HashMap<CacheCategory, TtlCache<Value>>>,
}

impl CacheManager {
    /// Create caches with the configured ttl per category
    pub fn new(config: &CacheConfig) -> Self {
        let caches = CacheCategory::ALL
            .into_iter()
            .map(|category| (category, TtlCache::new(category.as_str(), config.ttl(category))))
            .collect();
        Self {
            caches: Arc::new(caches),
        }
    }

    /// Create a default cache manager
    pub fn default_config() -> Self {
        Self::new(&CacheConfig::default())
    }

    /// The cache backing one category
    pub fn category(&self, category: CacheCategory) -> &TtlCache<Value> {
        // Every category is inserted by the constructor.
        &self.caches[&category]
    }

    pub fn get(&self, category: CacheCategory, key: &str) -> Option<Value> {
        self.category(category).get(key)
    }

    /// Store a value; `None` uses the category ttl
    pub fn put(&self, category: CacheCategory, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        let cache = self.category(category);
        cache.put(key, value, ttl.unwrap_or_else(|| cache.default_ttl()));
    }

    /// Fresh values for the given keys; missing or expired keys are left out
    pub fn get_many<I, K>(&self, category: CacheCategory, keys: I) -> HashMap<String, Value>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let cache = self.category(category);
        keys.into_iter()
            .filter_map(|key| {
                let key = key.as_ref();
                cache.get(key).map(|value| (key.to_string(), value))
            })
            .collect()
    }

    /// Store several values with one ttl; `None` uses the category ttl
    pub fn put_many<I, K>(&self, category: CacheCategory, items: I, ttl: Option<Duration>)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let cache = self.category(category);
        let ttl = ttl.unwrap_or_else(|| cache.default_ttl());
        for (key, value) in items {
            cache.put(key, value, ttl);
        }
    }

    pub fn invalidate(&self, category: CacheCategory, key: &str) -> bool {
        self.category(category).invalidate(key)
    }

    /// Single-flight load; `None` uses the category ttl
    pub async fn get_or_load<F, Fut>(
        &self,
        category: CacheCategory,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let cache = self.category(category);
        let ttl = ttl.unwrap_or_else(|| cache.default_ttl());
        cache.get_or_load(key, ttl, loader).await
    }

    /// Sweep every category, returning the number of removed entries
    pub fn sweep_all(&self, grace: Duration) -> usize {
        self.caches.values().map(|cache| cache.sweep(grace)).sum()
    }

    /// Clear all caches
    pub fn clear_all(&self) {
        for cache in self.caches.values() {
            cache.clear();
        }
    }

    pub fn stats(&self) -> HashMap<CacheCategory, CacheStats> {
        self.caches
            .iter()
            .map(|(category, cache)| (*category, cache.stats()))
            .collect()
    }

    /// Periodically sweep all categories until the handle is aborted
    pub fn spawn_sweeper(&self, interval: Duration, grace: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = manager.sweep_all(grace);
                if removed > 0 {
                    debug!(removed, "Cache sweep finished");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = CacheManager::default_config();
        cache.put(CacheCategory::Price, "X", json!(100), Some(Duration::from_secs(1)));

        assert_eq!(cache.get(CacheCategory::Price, "X"), Some(json!(100)));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(cache.get(CacheCategory::Price, "X"), None);
        assert_eq!(cache.category(CacheCategory::Price).stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_categories_are_independent() {
        let cache = CacheManager::default_config();
        cache.put(CacheCategory::Price, "AAPL", json!({"price": 150.0}), None);
        cache.put(CacheCategory::News, "AAPL", json!(["headline"]), None);

        assert_eq!(cache.get(CacheCategory::Price, "AAPL"), Some(json!({"price": 150.0})));
        assert!(cache.invalidate(CacheCategory::Price, "AAPL"));
        assert_eq!(cache.get(CacheCategory::Price, "AAPL"), None);
        assert_eq!(cache.get(CacheCategory::News, "AAPL"), Some(json!(["headline"])));
        assert_eq!(cache.get(CacheCategory::Fundamental, "AAPL"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_load_single_flight() {
        let cache: TtlCache<Value> = TtlCache::new("price", Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..16).map(|_| {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_load("AAPL", Duration::from_secs(60), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"price": 150.0}))
                    })
                    .await
            })
        });
        let results = futures::future::join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().unwrap(), json!({"price": 150.0}));
        }
        assert_eq!(cache.stats().loads, 1);
        assert_eq!(cache.get("AAPL"), Some(json!({"price": 150.0})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_is_shared_but_not_cached() {
        let cache: TtlCache<Value> = TtlCache::new("news", Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..4).map(|_| {
            let calls = Arc::clone(&calls);
            cache.get_or_load("TSLA", Duration::from_secs(60), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<Value, _>(EngineError::upstream("news", "HTTP 503"))
            })
        });
        let results = futures::future::join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| matches!(r, Err(EngineError::UpstreamFailure { .. }))));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().load_failures, 1);

        let value = cache
            .get_or_load("TSLA", Duration::from_secs(60), || async { Ok(json!("recovered")) })
            .await
            .unwrap();
        assert_eq!(value, json!("recovered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_load_does_not_block_other_keys() {
        let cache: TtlCache<Value> = TtlCache::new("fundamental", Duration::from_secs(60));

        let stuck = cache.clone();
        let _pending = tokio::spawn(async move {
            stuck
                .get_or_load("SLOW", Duration::from_secs(60), || futures::future::pending())
                .await
        });
        tokio::task::yield_now().await;

        let value = tokio::time::timeout(
            Duration::from_secs(1),
            cache.get_or_load("FAST", Duration::from_secs(60), || async { Ok(json!(1)) }),
        )
        .await
        .expect("unrelated key must not wait")
        .unwrap();
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn test_panicking_loader_does_not_poison_key() {
        let cache: TtlCache<Value> = TtlCache::new("price", Duration::from_secs(60));

        let err = cache
            .get_or_load("X", Duration::from_secs(60), || async {
                let missing: Option<Value> = None;
                Ok(missing.expect("loader bug"))
            })
            .await
            .unwrap_err();
        assert!(matches!(&err, EngineError::Panicked(message) if message.contains("loader bug")));
        assert_eq!(cache.stats().load_failures, 1);

        let value = cache
            .get_or_load("X", Duration::from_secs(60), || async { Ok(json!(1)) })
            .await
            .unwrap();
        assert_eq!(value, json!(1));
        assert_eq!(cache.get("X"), Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_load_is_replaced() {
        let cache: TtlCache<Value> = TtlCache::new("price", Duration::from_secs(60));

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            cache.get_or_load("Y", Duration::from_secs(60), || futures::future::pending()),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::advance(Duration::from_secs(600)).await;
        let value = tokio::time::timeout(
            Duration::from_secs(5),
            cache.get_or_load("Y", Duration::from_secs(60), || async { Ok(json!(2)) }),
        )
        .await
        .expect("a later caller runs its own loader")
        .unwrap();
        assert_eq!(value, json!(2));
        assert_eq!(cache.stats().loads, 2);

        assert_eq!(cache.sweep(Duration::ZERO), 0);
        assert!(cache.inner.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_many_keys_at_once() {
        let cache = CacheManager::default_config();
        cache.put_many(
            CacheCategory::Price,
            [("key1", json!("value1")), ("key2", json!("value2")), ("key3", json!("value3"))],
            None,
        );

        let found = cache.get_many(CacheCategory::Price, ["key1", "key2", "key3", "key4"]);
        assert_eq!(found.len(), 3);
        assert_eq!(found["key1"], json!("value1"));
        assert_eq!(found["key3"], json!("value3"));
        assert!(!found.contains_key("key4"));
        assert!(cache.get_many(CacheCategory::News, ["key1"]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_many_applies_ttl() {
        let cache = CacheManager::default_config();
        cache.put_many(
            CacheCategory::News,
            vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))],
            Some(Duration::from_secs(5)),
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get_many(CacheCategory::News, ["a", "b"]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_respects_grace() {
        let cache: TtlCache<Value> = TtlCache::new("price", Duration::from_secs(10));
        cache.insert("A", json!(1));
        cache.put("B", json!(2), Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(cache.sweep(Duration::from_secs(10)), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.sweep(Duration::from_secs(10)), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("B"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let manager = CacheManager::default_config();
        let news = manager.category(CacheCategory::News);

        news.insert("MSFT", json!([]));
        assert!(news.get("MSFT").is_some());
        assert!(news.get("NVDA").is_none());

        let stats = news.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);

        manager.clear_all();
        assert!(news.is_empty());
        assert_eq!(manager.stats().len(), CacheCategory::ALL.len());
    }
}
