//! Bounded pool of execution slots for task bodies
//!
//! At most `capacity` bodies run at once. When every slot is busy a
//! submission is either parked in a bounded FIFO queue or refused with
//! `Saturated`, depending on the [`AdmissionPolicy`]. Submitting never waits.
//!
//! The running count and the queue live under one lock, so a finishing
//! worker either hands its slot straight to the oldest queued body or gives
//! the slot back. A panicking body only ends itself; its worker moves on.

use crate::config::{AdmissionPolicy, EngineConfig};
use crate::error::{EngineError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// How a submission was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free and the body is running
    Started,
    /// The body waits in the queue for a slot
    Queued,
}

struct Job {
    task_id: String,
    body: BoxFuture<'static, ()>,
}

#[derive(Default)]
struct PoolState {
    running: usize,
    queue: VecDeque<Job>,
}

struct PoolInner {
    capacity: usize,
    policy: AdmissionPolicy,
    queue_capacity: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Next queued job for a finishing worker, or release its slot
    fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        let next = state.queue.pop_front();
        if next.is_none() {
            state.running -= 1;
        }
        next
    }
}

/// Bounded concurrent executor
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(capacity: usize, policy: AdmissionPolicy, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                policy,
                queue_capacity,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.worker_capacity, config.admission, config.queue_capacity)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bodies currently executing
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Bodies waiting for a slot
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Submit a body for execution
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, task_id: &str, body: F) -> Result<Admission>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job = Job {
            task_id: task_id.to_string(),
            body: body.boxed(),
        };

        let mut state = self.inner.state.lock();
        if state.running < self.inner.capacity {
            state.running += 1;
            drop(state);
            debug!(task_id, "Worker slot acquired");
            tokio::spawn(work(Arc::clone(&self.inner), job));
            return Ok(Admission::Started);
        }

        let saturated = EngineError::Saturated {
            capacity: self.inner.capacity,
        };
        match self.inner.policy {
            AdmissionPolicy::Reject => {
                warn!(task_id, "Worker pool saturated, rejecting");
                Err(saturated)
            }
            AdmissionPolicy::Queue if state.queue.len() >= self.inner.queue_capacity => {
                warn!(task_id, queue_capacity = self.inner.queue_capacity, "Admission queue full, rejecting");
                Err(saturated)
            }
            AdmissionPolicy::Queue => {
                state.queue.push_back(job);
                debug!(task_id, position = state.queue.len(), "All worker slots busy, queued");
                Ok(Admission::Queued)
            }
        }
    }
}

/// Runs jobs on one slot until the queue is empty
async fn work(pool: Arc<PoolInner>, first: Job) {
    let mut job = first;
    loop {
        trace!(task_id = %job.task_id, "Running task body");
        if let Err(panic) = AssertUnwindSafe(job.body).catch_unwind().await {
            error!(task_id = %job.task_id, panic = %panic_message(panic.as_ref()), "Task body panicked");
        }
        match pool.next_job() {
            Some(next) => job = next,
            None => break,
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
