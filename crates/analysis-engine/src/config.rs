//! Configuration for the analysis engine

use crate::cache::CacheCategory;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// What the worker pool does with a submission when every slot is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Hold the task in a bounded FIFO queue until a slot frees
    #[default]
    Queue,
    /// Refuse the task with `Saturated`
    Reject,
}

/// What happens to a subscriber whose delivery buffer overflows
///
/// Has no `Default`; every deployment chooses one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagPolicy {
    /// Discard the oldest buffered events and keep the subscription alive
    DropOldest,
    /// End the subscription with a `Lagging` error
    Disconnect,
}

impl FromStr for LagPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_oldest" | "drop-oldest" => Ok(Self::DropOldest),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(EngineError::Config(format!("unknown lag policy '{other}'"))),
        }
    }
}

/// Event broker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Number of most recent events kept per task for late subscribers (0 disables replay)
    #[serde(default)]
    pub replay_buffer: usize,

    /// Events buffered per subscriber before the lag policy applies
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Overflow behavior for slow subscribers
    pub lag_policy: LagPolicy,

    /// How long a finished stream keeps its replay tail
    #[serde(default = "default_closed_linger")]
    pub closed_linger: Duration,
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_closed_linger() -> Duration {
    Duration::from_secs(30)
}

impl BrokerConfig {
    /// Broker settings with the given lag policy and default buffers
    pub fn new(lag_policy: LagPolicy) -> Self {
        Self {
            replay_buffer: 0,
            subscriber_buffer: default_subscriber_buffer(),
            lag_policy,
            closed_linger: default_closed_linger(),
        }
    }

    /// Keep the last `events` events per task for replay
    pub fn with_replay(mut self, events: usize) -> Self {
        self.replay_buffer = events;
        self
    }

    /// Set the per-subscriber delivery buffer
    pub fn with_subscriber_buffer(mut self, events: usize) -> Self {
        self.subscriber_buffer = events;
        self
    }

    /// Set how long closed streams linger
    pub fn with_closed_linger(mut self, linger: Duration) -> Self {
        self.closed_linger = linger;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.subscriber_buffer == 0 {
            return Err(EngineError::Config(
                "subscriber_buffer must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-category cache ttl and sweeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Quotes and prices
    pub ttl_price: Duration,
    /// Financial statements and ratios
    pub ttl_fundamental: Duration,
    /// News and sentiment inputs
    pub ttl_news: Duration,
    /// Sector and industry data
    pub ttl_industry: Duration,
    /// Finished analysis fragments
    pub ttl_analysis: Duration,
    /// Period of the background sweep
    pub sweep_interval: Duration,
    /// Extra age past expiry before the sweep removes an entry
    pub sweep_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_price: Duration::from_secs(3600),        // 1 hour
            ttl_fundamental: Duration::from_secs(21600), // 6 hours
            ttl_news: Duration::from_secs(7200),         // 2 hours
            ttl_industry: Duration::from_secs(43200),    // 12 hours
            ttl_analysis: Duration::from_secs(1800),     // 30 minutes
            sweep_interval: Duration::from_secs(60),
            sweep_grace: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    /// Configured ttl for a category
    pub fn ttl(&self, category: CacheCategory) -> Duration {
        match category {
            CacheCategory::Price => self.ttl_price,
            CacheCategory::Fundamental => self.ttl_fundamental,
            CacheCategory::News => self.ttl_news,
            CacheCategory::Industry => self.ttl_industry,
            CacheCategory::Analysis => self.ttl_analysis,
        }
    }

    /// Override the ttl of one category
    pub fn with_ttl(mut self, category: CacheCategory, ttl: Duration) -> Self {
        match category {
            CacheCategory::Price => self.ttl_price = ttl,
            CacheCategory::Fundamental => self.ttl_fundamental = ttl,
            CacheCategory::News => self.ttl_news = ttl,
            CacheCategory::Industry => self.ttl_industry = ttl,
            CacheCategory::Analysis => self.ttl_analysis = ttl,
        }
        self
    }
}

/// Upstream fetch behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Deadline for a single upstream call
    pub upstream_timeout: Duration,
    /// Maximum retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff duration for retries
    pub retry_backoff_base: Duration,
    /// Upper bound for any single backoff
    pub retry_backoff_max: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(60),
        }
    }
}

impl FetchConfig {
    /// Backoff before retry number `attempt` (0-based), capped at `retry_backoff_max`
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff_base
            .checked_mul(2_u32.saturating_pow(attempt))
            .unwrap_or(Duration::MAX)
            .min(self.retry_backoff_max)
    }
}

/// Configuration for the analysis engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of task bodies allowed to run at once
    #[serde(default = "default_worker_capacity")]
    pub worker_capacity: usize,

    /// Behavior when all worker slots are busy
    #[serde(default)]
    pub admission: AdmissionPolicy,

    /// Maximum number of tasks waiting for a slot under `AdmissionPolicy::Queue`
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Wall-clock deadline applied to every task body
    #[serde(default = "default_task_timeout")]
    pub task_timeout: Option<Duration>,

    /// How long terminal tasks stay queryable
    #[serde(default = "default_task_retention")]
    pub task_retention: Duration,

    /// Event broker settings
    pub broker: BrokerConfig,

    /// Cache ttl settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Upstream fetch settings
    #[serde(default)]
    pub fetch: FetchConfig,
}

fn default_worker_capacity() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    100
}

#[allow(clippy::unnecessary_wraps)]
fn default_task_timeout() -> Option<Duration> {
    Some(Duration::from_secs(300))
}

fn default_task_retention() -> Duration {
    Duration::from_secs(3600)
}

impl EngineConfig {
    /// Configuration with defaults everywhere except the lag policy
    pub fn new(lag_policy: LagPolicy) -> Self {
        Self {
            worker_capacity: default_worker_capacity(),
            admission: AdmissionPolicy::default(),
            queue_capacity: default_queue_capacity(),
            task_timeout: default_task_timeout(),
            task_retention: default_task_retention(),
            broker: BrokerConfig::new(lag_policy),
            cache: CacheConfig::default(),
            fetch: FetchConfig::default(),
        }
    }

    /// Create a new configuration builder
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    /// Apply `ENGINE_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(value) = env_parse::<usize>("ENGINE_WORKER_CAPACITY")? {
            self.worker_capacity = value;
        }
        if let Some(value) = env_parse::<usize>("ENGINE_QUEUE_CAPACITY")? {
            self.queue_capacity = value;
        }
        if let Some(value) = env_parse::<usize>("ENGINE_REPLAY_BUFFER")? {
            self.broker.replay_buffer = value;
        }
        if let Ok(value) = std::env::var("ENGINE_LAG_POLICY") {
            self.broker.lag_policy = value.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_capacity == 0 {
            return Err(EngineError::Config(
                "worker_capacity must be greater than 0".to_string(),
            ));
        }

        if self.task_timeout == Some(Duration::ZERO) {
            return Err(EngineError::Config(
                "task_timeout must be non-zero when set".to_string(),
            ));
        }

        self.broker.validate()
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| EngineError::Config(format!("{name} has invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Builder for EngineConfig
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    worker_capacity: Option<usize>,
    admission: Option<AdmissionPolicy>,
    queue_capacity: Option<usize>,
    task_timeout: Option<Option<Duration>>,
    task_retention: Option<Duration>,
    lag_policy: Option<LagPolicy>,
    replay_buffer: Option<usize>,
    subscriber_buffer: Option<usize>,
    closed_linger: Option<Duration>,
    cache: Option<CacheConfig>,
    fetch: Option<FetchConfig>,
}

impl EngineConfigBuilder {
    /// Set the number of worker slots
    pub fn worker_capacity(mut self, capacity: usize) -> Self {
        self.worker_capacity = Some(capacity);
        self
    }

    /// Set the admission policy
    pub fn admission(mut self, policy: AdmissionPolicy) -> Self {
        self.admission = Some(policy);
        self
    }

    /// Set the admission queue bound
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Set or clear the per-task deadline
    pub fn task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Set how long terminal tasks are retained
    pub fn task_retention(mut self, retention: Duration) -> Self {
        self.task_retention = Some(retention);
        self
    }

    /// Set the lagging-subscriber policy (required)
    pub fn lag_policy(mut self, policy: LagPolicy) -> Self {
        self.lag_policy = Some(policy);
        self
    }

    /// Set the replay buffer size
    pub fn replay_buffer(mut self, events: usize) -> Self {
        self.replay_buffer = Some(events);
        self
    }

    /// Set the per-subscriber delivery buffer
    pub fn subscriber_buffer(mut self, events: usize) -> Self {
        self.subscriber_buffer = Some(events);
        self
    }

    /// Set how long closed streams linger
    pub fn closed_linger(mut self, linger: Duration) -> Self {
        self.closed_linger = Some(linger);
        self
    }

    /// Set cache settings
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set fetch settings
    pub fn fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = Some(fetch);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<EngineConfig> {
        let lag_policy = self.lag_policy.ok_or_else(|| {
            EngineError::Config("lag_policy must be chosen explicitly".to_string())
        })?;
        let defaults = EngineConfig::new(lag_policy);

        let config = EngineConfig {
            worker_capacity: self.worker_capacity.unwrap_or(defaults.worker_capacity),
            admission: self.admission.unwrap_or(defaults.admission),
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity),
            task_timeout: self.task_timeout.unwrap_or(defaults.task_timeout),
            task_retention: self.task_retention.unwrap_or(defaults.task_retention),
            broker: BrokerConfig {
                replay_buffer: self.replay_buffer.unwrap_or(defaults.broker.replay_buffer),
                subscriber_buffer: self
                    .subscriber_buffer
                    .unwrap_or(defaults.broker.subscriber_buffer),
                lag_policy,
                closed_linger: self.closed_linger.unwrap_or(defaults.broker.closed_linger),
            },
            cache: self.cache.unwrap_or(defaults.cache),
            fetch: self.fetch.unwrap_or(defaults.fetch),
        };

        config.validate()?;
        Ok(config)
    }
}
