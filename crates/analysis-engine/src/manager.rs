//! Task lifecycle orchestration
//!
//! The TaskManager owns the task registry and ties together the worker pool,
//! the event broker and the caches. Each submitted request becomes a task
//! record plus an event stream; its body runs on a pool slot and publishes
//! `Started`, stage `Progress`, summary `Chunk` and exactly one terminal event.
//!
//! Every status change is written to the registry before the matching event
//! is published, so a subscriber that sees a terminal event always finds the
//! terminal status when it queries the task.

use crate::broker::{EventBroker, Subscription};
use crate::cache::CacheManager;
use crate::collab::{Analyzer, TaskContext, TextGenerator};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, TaskFailure};
use crate::event::EventKind;
use crate::pool::{WorkerPool, panic_message};
use crate::summary::build_summary_prompt;
use crate::task::{AnalysisRequest, TaskSnapshot, TaskStatus};
use chrono::{TimeDelta, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct TaskRecord {
    snapshot: TaskSnapshot,
    token: CancellationToken,
}

/// Resolved work for one task
struct TaskPlan {
    instrument: String,
    stages: Vec<Arc<dyn Analyzer>>,
    summarize: bool,
    deadline: Option<Duration>,
}

impl TaskPlan {
    fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|analyzer| analyzer.name()).collect()
    }
}

enum Outcome {
    Completed(Value),
    Failed(EngineError),
    Cancelled,
}

struct ManagerInner {
    config: EngineConfig,
    tasks: RwLock<HashMap<String, TaskRecord>>,
    pool: WorkerPool,
    broker: EventBroker,
    cache: CacheManager,
    analyzers: Vec<Arc<dyn Analyzer>>,
    generator: Option<Arc<dyn TextGenerator>>,
}

impl ManagerInner {
    fn analyzer(&self, name: &str) -> Option<Arc<dyn Analyzer>> {
        self.analyzers
            .iter()
            .find(|analyzer| analyzer.name() == name)
            .cloned()
    }

    fn plan(&self, request: &AnalysisRequest) -> Result<TaskPlan> {
        let instrument = request.instrument.trim();
        if instrument.is_empty() {
            return Err(EngineError::InvalidRequest(
                "instrument must not be empty".to_string(),
            ));
        }

        let stages = if request.stages.is_empty() {
            self.analyzers.clone()
        } else {
            request
                .stages
                .iter()
                .map(|name| {
                    self.analyzer(name)
                        .ok_or_else(|| EngineError::InvalidRequest(format!("unknown stage '{name}'")))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let summarize = request.summarize && self.generator.is_some();
        if stages.is_empty() && !summarize {
            return Err(EngineError::InvalidRequest(
                "request selects no analysis stages and no summary".to_string(),
            ));
        }
        if request.deadline == Some(Duration::ZERO) {
            return Err(EngineError::InvalidRequest(
                "deadline must be non-zero".to_string(),
            ));
        }

        Ok(TaskPlan {
            instrument: instrument.to_string(),
            stages,
            summarize,
            deadline: request.deadline,
        })
    }

    fn publish(&self, task_id: &str, kind: EventKind, payload: Value) {
        if let Err(err) = self.broker.publish(task_id, kind, payload) {
            warn!(task_id, kind = kind.as_str(), error = %err, "Failed to publish task event");
        }
    }

    fn mark_running(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.write();
        let Some(record) = tasks.get_mut(task_id) else {
            warn!(task_id, "Task record vanished before it started");
            return false;
        };
        record.snapshot.transition(TaskStatus::Running)
    }

    /// Record the terminal outcome, then publish the terminal event
    fn finish(&self, task_id: &str, outcome: Outcome) {
        let (status, kind, payload) = match &outcome {
            Outcome::Completed(result) => (TaskStatus::Completed, EventKind::Completed, result.clone()),
            Outcome::Failed(err) => (
                TaskStatus::Failed,
                EventKind::Failed,
                json!({ "kind": err.kind(), "message": err.to_string() }),
            ),
            Outcome::Cancelled => (
                TaskStatus::Cancelled,
                EventKind::Cancelled,
                json!({ "reason": "cancel requested" }),
            ),
        };

        {
            let mut tasks = self.tasks.write();
            let Some(record) = tasks.get_mut(task_id) else {
                warn!(task_id, "Task record vanished before it finished");
                return;
            };
            let previous = record.snapshot.status;
            if !record.snapshot.transition(status) {
                warn!(task_id, from = %previous, to = %status, "Ignoring illegal status transition");
                return;
            }
            match outcome {
                Outcome::Completed(result) => record.snapshot.result = Some(result),
                Outcome::Failed(err) => record.snapshot.error = Some(TaskFailure::from(&err)),
                Outcome::Cancelled => {}
            }
        }

        match status {
            TaskStatus::Completed => info!(task_id, "Task completed"),
            TaskStatus::Cancelled => info!(task_id, "Task cancelled"),
            _ => warn!(task_id, error = %payload["message"], "Task failed"),
        }
        self.publish(task_id, kind, payload);
    }
}

/// Task orchestration facade
///
/// Cheap to clone; all clones share the same registry, pool, broker and caches.
///
/// # Example
///
/// ```no_run
/// use analysis_engine::{AnalysisRequest, EngineConfig, LagPolicy, TaskManager};
/// use std::sync::Arc;
///
/// # async fn example(technical: Arc<dyn analysis_engine::Analyzer>) -> analysis_engine::Result<()> {
/// let manager = TaskManager::builder()
///     .config(EngineConfig::new(LagPolicy::DropOldest))
///     .analyzer(technical)
///     .build()?;
///
/// let task_id = manager.create_task(AnalysisRequest::new("AAPL"))?;
/// let mut events = manager.open_event_stream(&task_id)?;
/// while let Some(event) = events.next().await {
///     println!("{}", event?.to_wire().to_sse_frame());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    /// Create a new manager builder
    pub fn builder() -> TaskManagerBuilder {
        TaskManagerBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn broker(&self) -> &EventBroker {
        &self.inner.broker
    }

    pub fn cache(&self) -> &CacheManager {
        &self.inner.cache
    }

    /// Registered analyzer names in registration order
    pub fn analyzer_names(&self) -> Vec<String> {
        self.inner
            .analyzers
            .iter()
            .map(|analyzer| analyzer.name().to_string())
            .collect()
    }

    /// Register a task and hand its body to the worker pool
    ///
    /// Returns the task id. When the pool refuses admission the task is
    /// recorded as failed, its `Failed` event is published and `Saturated`
    /// is returned. Must be called from within a tokio runtime.
    pub fn create_task(&self, request: AnalysisRequest) -> Result<String> {
        let plan = self.inner.plan(&request)?;
        let task_id = request
            .task_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if task_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "task id must not be empty".to_string(),
            ));
        }

        let token = CancellationToken::new();
        {
            let mut tasks = self.inner.tasks.write();
            if tasks.contains_key(&task_id) {
                return Err(EngineError::DuplicateTask(task_id));
            }
            self.inner.broker.open(&task_id)?;
            tasks.insert(
                task_id.clone(),
                TaskRecord {
                    snapshot: TaskSnapshot::queued(task_id.clone(), plan.instrument.clone()),
                    token: token.clone(),
                },
            );
        }

        info!(
            task_id = %task_id,
            instrument = %plan.instrument,
            stages = plan.stages.len(),
            summarize = plan.summarize,
            "Task created"
        );

        let body = drive(Arc::clone(&self.inner), task_id.clone(), plan, token);
        match self.inner.pool.submit(&task_id, body) {
            Ok(admission) => {
                debug!(task_id = %task_id, ?admission, "Task admitted");
                Ok(task_id)
            }
            Err(err) => {
                self.inner.finish(&task_id, Outcome::Failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Request cooperative cancellation
    ///
    /// A no-op for terminal tasks. The body observes the request at its next
    /// checkpoint; a queued task is cancelled when it reaches a slot.
    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.inner.tasks.write();
        let record = tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;

        if record.snapshot.is_terminal() {
            debug!(task_id, status = %record.snapshot.status, "Cancel ignored for finished task");
            return Ok(());
        }

        record.snapshot.cancel_requested = true;
        record.token.cancel();
        info!(task_id, status = %record.snapshot.status, "Cancellation requested");
        Ok(())
    }

    /// Consistent snapshot of one task
    pub fn task_status(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.inner
            .tasks
            .read()
            .get(task_id)
            .map(|record| record.snapshot.clone())
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))
    }

    /// Snapshots of all known tasks, oldest first
    pub fn list_tasks(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .tasks
            .read()
            .values()
            .map(|record| record.snapshot.clone())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Subscribe to a task's events
    ///
    /// Fails with `NotFound` for an unknown task and `StreamClosed` when the
    /// stream has already been reclaimed.
    pub fn open_event_stream(&self, task_id: &str) -> Result<Subscription> {
        if !self.inner.tasks.read().contains_key(task_id) {
            return Err(EngineError::NotFound(format!("task {task_id}")));
        }
        self.inner
            .broker
            .subscribe(task_id)
            .map_err(|err| match err {
                EngineError::NotFound(_) => EngineError::StreamClosed(task_id.to_string()),
                other => other,
            })
    }

    /// Forget a finished task and its event stream
    pub fn remove_task(&self, task_id: &str) -> Result<()> {
        {
            let mut tasks = self.inner.tasks.write();
            let record = tasks
                .get(task_id)
                .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
            if !record.snapshot.is_terminal() {
                return Err(EngineError::InvalidRequest(format!(
                    "task {task_id} is still {}",
                    record.snapshot.status
                )));
            }
            tasks.remove(task_id);
        }
        self.inner.broker.remove(task_id);
        debug!(task_id, "Task removed");
        Ok(())
    }

    /// Drop terminal tasks older than the configured retention
    pub fn cleanup(&self) -> usize {
        self.cleanup_older_than(self.inner.config.task_retention)
    }

    /// Drop terminal tasks that finished at least `age` ago
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let expired: Vec<String> = {
            let mut tasks = self.inner.tasks.write();
            let expired: Vec<String> = tasks
                .values()
                .filter(|record| {
                    record
                        .snapshot
                        .finished_at
                        .is_some_and(|finished| finished <= cutoff)
                })
                .map(|record| record.snapshot.id.clone())
                .collect();
            for task_id in &expired {
                tasks.remove(task_id);
            }
            expired
        };

        for task_id in &expired {
            self.inner.broker.remove(task_id);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "Cleaned up finished tasks");
        }
        expired.len()
    }

    /// Periodic task cleanup, stream reclamation and cache sweeping
    ///
    /// Runs every `cache.sweep_interval` until the handle is aborted.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let interval = self.inner.config.cache.sweep_interval;
        let grace = self.inner.config.cache.sweep_grace;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let tasks = manager.cleanup();
                let streams = manager.inner.broker.reclaim_expired();
                let entries = manager.inner.cache.sweep_all(grace);
                if tasks + streams + entries > 0 {
                    debug!(tasks, streams, entries, "Maintenance pass finished");
                }
            }
        })
    }
}

/// Body executed on a pool slot
async fn drive(inner: Arc<ManagerInner>, task_id: String, plan: TaskPlan, token: CancellationToken) {
    if token.is_cancelled() {
        debug!(task_id = %task_id, "Cancelled while queued");
        inner.finish(&task_id, Outcome::Cancelled);
        return;
    }
    if !inner.mark_running(&task_id) {
        return;
    }
    inner.publish(
        &task_id,
        EventKind::Started,
        json!({
            "instrument": plan.instrument,
            "stages": plan.stage_names(),
            "summarize": plan.summarize,
        }),
    );

    let ctx = TaskContext::new(task_id.clone(), token, inner.broker.clone(), inner.cache.clone());
    let deadline = plan.deadline.or(inner.config.task_timeout);
    let body = AssertUnwindSafe(execute(&inner, &plan, &ctx)).catch_unwind();
    let outcome = match deadline {
        Some(limit) => tokio::time::timeout(limit, body)
            .await
            .unwrap_or_else(|_elapsed| Ok(Err(EngineError::Timeout(limit)))),
        None => body.await,
    };

    let outcome = match outcome {
        Ok(Ok(result)) => Outcome::Completed(result),
        Ok(Err(EngineError::Cancelled)) if ctx.is_cancelled() => Outcome::Cancelled,
        Ok(Err(err)) => Outcome::Failed(err),
        Err(panic) => Outcome::Failed(EngineError::Panicked(panic_message(panic.as_ref()))),
    };
    inner.finish(&task_id, outcome);
}

/// Analysis stages in order, then the optional summary
async fn execute(inner: &ManagerInner, plan: &TaskPlan, ctx: &TaskContext) -> Result<Value> {
    let mut analyses = Map::new();
    for analyzer in &plan.stages {
        ctx.checkpoint()?;
        let stage = analyzer.name();
        debug!(task_id = %ctx.task_id(), stage, "Running analysis stage");
        let output = analyzer.run(&plan.instrument, &ctx.for_stage(stage)).await?;
        analyses.insert(stage.to_string(), output);
    }

    let summary = match &inner.generator {
        Some(generator) if plan.summarize => {
            ctx.checkpoint()?;
            let prompt = build_summary_prompt(&plan.instrument, &analyses);
            Value::String(summarize(generator.as_ref(), &prompt, ctx).await?)
        }
        _ => Value::Null,
    };

    Ok(json!({
        "instrument": plan.instrument,
        "analyses": analyses,
        "summary": summary,
    }))
}

/// Forward generated chunks as events while collecting the full text
async fn summarize(generator: &dyn TextGenerator, prompt: &str, ctx: &TaskContext) -> Result<String> {
    debug!(task_id = %ctx.task_id(), generator = generator.name(), "Generating summary");
    let text = Mutex::new(String::new());
    let on_chunk = |chunk: &str| {
        text.lock().push_str(chunk);
        ctx.emit_chunk(chunk);
    };
    generator.generate(prompt, &on_chunk).await?;
    Ok(text.into_inner())
}

/// Builder for TaskManager
pub struct TaskManagerBuilder {
    config: Option<EngineConfig>,
    cache: Option<CacheManager>,
    analyzers: Vec<Arc<dyn Analyzer>>,
    generator: Option<Arc<dyn TextGenerator>>,
}

impl TaskManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cache: None,
            analyzers: Vec::new(),
            generator: None,
        }
    }

    /// Set the engine configuration (required)
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Share an existing cache manager, e.g. one already wrapped by fetchers
    pub fn cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Register an analysis stage; stages run in registration order by default
    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.push(analyzer);
        self
    }

    /// Set the summary text generator
    pub fn text_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn build(self) -> Result<TaskManager> {
        let config = self
            .config
            .ok_or_else(|| EngineError::Config("engine configuration is required".to_string()))?;
        config.validate()?;

        for (index, analyzer) in self.analyzers.iter().enumerate() {
            if self.analyzers[..index]
                .iter()
                .any(|earlier| earlier.name() == analyzer.name())
            {
                return Err(EngineError::Config(format!(
                    "analyzer '{}' registered twice",
                    analyzer.name()
                )));
            }
        }

        let cache = self.cache.unwrap_or_else(|| CacheManager::new(&config.cache));
        info!(
            workers = config.worker_capacity,
            analyzers = self.analyzers.len(),
            summary = self.generator.is_some(),
            "Task manager ready"
        );

        Ok(TaskManager {
            inner: Arc::new(ManagerInner {
                pool: WorkerPool::from_config(&config),
                broker: EventBroker::new(config.broker.clone()),
                tasks: RwLock::new(HashMap::new()),
                cache,
                analyzers: self.analyzers,
                generator: self.generator,
                config,
            }),
        })
    }
}

impl Default for TaskManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
