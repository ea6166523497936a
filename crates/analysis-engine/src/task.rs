//! Task records, lifecycle states and analysis requests

use crate::error::TaskFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Task lifecycle state
///
/// ```text
/// Queued -> Running -> Completed | Failed | Cancelled
/// Queued -> Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal move
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of a task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub instrument: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set only when `status` is `Completed`
    pub result: Option<Value>,
    /// Set only when `status` is `Failed`
    pub error: Option<TaskFailure>,
    pub cancel_requested: bool,
}

impl TaskSnapshot {
    pub(crate) fn queued(id: String, instrument: String) -> Self {
        Self {
            id,
            instrument,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            cancel_requested: false,
        }
    }

    /// Move to `next`, stamping timestamps; returns false for an illegal move
    pub(crate) fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        let now = Utc::now();
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        } else if next.is_terminal() {
            self.finished_at = Some(now);
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Request to analyze one instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Caller-chosen task id; a v4 uuid is generated when absent
    #[serde(default)]
    pub task_id: Option<String>,
    pub instrument: String,
    /// Analyzer names to run in order; empty runs every registered analyzer
    #[serde(default)]
    pub stages: Vec<String>,
    /// Generate a narrative summary after the analyses
    #[serde(default = "default_summarize")]
    pub summarize: bool,
    /// Overrides the engine-wide task timeout
    #[serde(default)]
    pub deadline: Option<Duration>,
}

fn default_summarize() -> bool {
    true
}

impl AnalysisRequest {
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            task_id: None,
            instrument: instrument.into(),
            stages: Vec::new(),
            summarize: default_summarize(),
            deadline: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_summary(mut self, summarize: bool) -> Self {
        self.summarize = summarize;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legal_transitions() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Completed));
        assert!(Running.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Queued));
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Queued, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_stamps_times() {
        let mut snapshot = TaskSnapshot::queued("t".into(), "AAPL".into());
        assert!(snapshot.transition(TaskStatus::Running));
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.finished_at.is_none());

        assert!(snapshot.transition(TaskStatus::Completed));
        assert!(snapshot.finished_at.is_some());
        assert!(!snapshot.transition(TaskStatus::Failed));
        assert_eq!(snapshot.status, TaskStatus::Completed);
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: AnalysisRequest = serde_json::from_value(json!({"instrument": "600519"})).unwrap();
        assert_eq!(request, AnalysisRequest::new("600519"));
        assert!(request.summarize);
        assert!(request.stages.is_empty());
    }

    #[test]
    fn test_snapshot_serializes_status() {
        let snapshot = TaskSnapshot::queued("t".into(), "AAPL".into());
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["status"], json!("queued"));
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
    }
}
