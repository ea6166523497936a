//! Task orchestration and event streaming for instrument analysis
//!
//! This crate runs long-lived analysis tasks on a bounded worker pool,
//! streams their progress to any number of subscribers through the event
//! broker, and shares upstream data between tasks through ttl caches with
//! single-flight loading. Analyzers, text generators and data fetchers are
//! supplied by the caller through the traits in [`collab`].

pub mod broker;
pub mod cache;
pub mod collab;
pub mod config;
pub mod error;
pub mod event;
pub mod fetch;
pub mod manager;
pub mod pool;
pub mod summary;
pub mod task;

// Re-export key types
pub use broker::{EventBroker, Subscription};
pub use cache::{CacheCategory, CacheManager, CacheStats, TtlCache};
pub use collab::{Analyzer, DataFetcher, TaskContext, TextGenerator};
pub use config::{
    AdmissionPolicy, BrokerConfig, CacheConfig, EngineConfig, EngineConfigBuilder, FetchConfig,
    LagPolicy,
};
pub use error::{EngineError, ErrorKind, Result, TaskFailure};
pub use event::{Event, EventKind, WireMessage};
pub use fetch::CachedFetcher;
pub use manager::{TaskManager, TaskManagerBuilder};
pub use pool::{Admission, WorkerPool};
pub use summary::build_summary_prompt;
pub use task::{AnalysisRequest, TaskSnapshot, TaskStatus};
