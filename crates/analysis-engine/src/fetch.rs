//! Cache-backed upstream data access
//!
//! [`CachedFetcher`] wraps a raw [`DataFetcher`] so that concurrent tasks
//! asking for the same key share one upstream call, slow calls are bounded
//! by a timeout and transient failures are retried with exponential backoff.

use crate::cache::{CacheCategory, CacheManager, TtlCache};
use crate::collab::DataFetcher;
use crate::config::FetchConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct CachedFetcher {
    name: String,
    upstream: Arc<dyn DataFetcher>,
    cache: TtlCache<Value>,
    ttl: Duration,
    policy: FetchConfig,
}

impl CachedFetcher {
    /// Cache results in `category` using the category's ttl
    pub fn new(
        name: impl Into<String>,
        upstream: Arc<dyn DataFetcher>,
        cache: &CacheManager,
        category: CacheCategory,
        policy: FetchConfig,
    ) -> Self {
        let cache = cache.category(category).clone();
        Self {
            name: name.into(),
            upstream,
            ttl: cache.default_ttl(),
            cache,
            policy,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl DataFetcher for CachedFetcher {
    async fn fetch(&self, key: &str) -> Result<Value> {
        let upstream = Arc::clone(&self.upstream);
        let policy = self.policy.clone();
        let name = self.name.clone();
        let owned_key = key.to_string();
        self.cache
            .get_or_load(key, self.ttl, move || fetch_with_retry(name, upstream, owned_key, policy))
            .await
    }
}

async fn fetch_with_retry(
    name: String,
    upstream: Arc<dyn DataFetcher>,
    key: String,
    policy: FetchConfig,
) -> Result<Value> {
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(policy.upstream_timeout, upstream.fetch(&key)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::Timeout(policy.upstream_timeout)),
        };

        match outcome {
            Ok(value) => {
                debug!(fetcher = %name, key = %key, attempt, "Upstream fetch succeeded");
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let backoff = policy.retry_backoff(attempt);
                warn!(
                    fetcher = %name,
                    key = %key,
                    attempt,
                    error = %err,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    "Upstream fetch failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MockDataFetcher;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> FetchConfig {
        FetchConfig {
            upstream_timeout: Duration::from_secs(5),
            max_retries,
            retry_backoff_base: Duration::from_millis(100),
            ..FetchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_second_fetch_served_from_cache() {
        let mut upstream = MockDataFetcher::new();
        upstream
            .expect_fetch()
            .withf(|key: &str| key == "AAPL")
            .times(1)
            .returning(|_| Ok(json!({"close": 187.3})));

        let caches = CacheManager::default_config();
        let fetcher = CachedFetcher::new("prices", Arc::new(upstream), &caches, CacheCategory::Price, policy(0));

        assert_eq!(fetcher.fetch("AAPL").await.unwrap()["close"], json!(187.3));
        assert_eq!(fetcher.fetch("AAPL").await.unwrap()["close"], json!(187.3));
        assert_eq!(caches.category(CacheCategory::Price).len(), 1);
        assert!(caches.get(CacheCategory::News, "AAPL").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut upstream = MockDataFetcher::new();
        upstream.expect_fetch().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EngineError::upstream("vendor", "502 bad gateway"))
            } else {
                Ok(json!({"pe": 28.1}))
            }
        });

        let caches = CacheManager::default_config();
        let fetcher = CachedFetcher::new(
            "fundamentals",
            Arc::new(upstream),
            &caches,
            CacheCategory::Fundamental,
            policy(3),
        );

        let value = fetcher.fetch("MSFT").await.unwrap();
        assert_eq!(value["pe"], json!(28.1));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_fast() {
        let mut upstream = MockDataFetcher::new();
        upstream
            .expect_fetch()
            .times(1)
            .returning(|key| Err(EngineError::InvalidRequest(format!("unknown symbol {key}"))));

        let caches = CacheManager::default_config();
        let fetcher = CachedFetcher::new("news", Arc::new(upstream), &caches, CacheCategory::News, policy(3));

        let err = fetcher.fetch("ZZZZ").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        assert!(caches.category(CacheCategory::News).is_empty());
    }

    struct StalledFetcher;

    #[async_trait]
    impl DataFetcher for StalledFetcher {
        async fn fetch(&self, _key: &str) -> Result<Value> {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_upstream_times_out() {
        let caches = CacheManager::default_config();
        let fetcher = CachedFetcher::new(
            "industry",
            Arc::new(StalledFetcher),
            &caches,
            CacheCategory::Industry,
            FetchConfig {
                upstream_timeout: Duration::from_secs(2),
                max_retries: 1,
                retry_backoff_base: Duration::from_secs(1),
                ..FetchConfig::default()
            },
        );

        let err = fetcher.fetch("semis").await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(limit) if limit == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_call() {
        let mut upstream = MockDataFetcher::new();
        upstream.expect_fetch().times(1).returning(|_| Ok(json!([1, 2, 3])));

        let caches = CacheManager::default_config();
        let fetcher = Arc::new(
            CachedFetcher::new("prices", Arc::new(upstream), &caches, CacheCategory::Price, policy(0))
                .with_ttl(Duration::from_secs(10)),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fetcher = Arc::clone(&fetcher);
                tokio::spawn(async move { fetcher.fetch("TSLA").await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!([1, 2, 3]));
        }
    }
}
