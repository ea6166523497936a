//! Collaborator interfaces consumed by task bodies
//!
//! The engine does not compute indicators, call model providers or talk to
//! market data vendors itself. Those are plugged in through the traits
//! below and receive a [`TaskContext`] that carries the task's cancellation
//! token, its progress channel and the shared caches.

use crate::broker::EventBroker;
use crate::cache::CacheManager;
use crate::error::{EngineError, Result};
use crate::event::EventKind;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One analysis stage (technical, fundamental, sentiment, ...)
///
/// Implementations must be re-entrant: the same instance runs concurrently
/// for different tasks.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Stage name, unique within a manager
    fn name(&self) -> &str;

    /// Analyze one instrument, reporting fragments through `ctx.report`
    async fn run(&self, instrument: &str, ctx: &TaskContext) -> Result<Value>;
}

/// Streaming text generation
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str {
        "text-generator"
    }

    /// Generate text for `prompt`, passing each chunk to `on_chunk` in arrival order
    async fn generate(&self, prompt: &str, on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync)) -> Result<()>;
}

/// Raw data retrieval from an upstream provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Value>;
}

/// Per-task handle passed into every collaborator call
#[derive(Clone)]
pub struct TaskContext {
    task_id: String,
    stage: Option<String>,
    token: CancellationToken,
    broker: EventBroker,
    cache: CacheManager,
}

impl TaskContext {
    pub fn new(
        task_id: impl Into<String>,
        token: CancellationToken,
        broker: EventBroker,
        cache: CacheManager,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            stage: None,
            token,
            broker,
            cache,
        }
    }

    pub(crate) fn for_stage(&self, stage: &str) -> Self {
        Self {
            stage: Some(stage.to_string()),
            ..self.clone()
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Stage currently running, if any
    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cooperative cancellation point
    pub fn checkpoint(&self) -> Result<()> {
        if self.token.is_cancelled() {
            debug!(task_id = %self.task_id, stage = ?self.stage, "Cancellation observed at checkpoint");
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    /// Publish a progress fragment for the current stage
    pub fn report(&self, fragment: Value) {
        let payload = json!({ "stage": self.stage, "data": fragment });
        self.emit(EventKind::Progress, payload);
    }

    /// Publish a chunk of generated text
    pub fn emit_chunk(&self, text: &str) {
        self.emit(EventKind::Chunk, json!({ "text": text }));
    }

    fn emit(&self, kind: EventKind, payload: Value) {
        // Only fails once the task is terminal; late fragments are dropped.
        if let Err(err) = self.broker.publish(&self.task_id, kind, payload) {
            debug!(task_id = %self.task_id, error = %err, "Dropped event from finished task");
        }
    }
}
