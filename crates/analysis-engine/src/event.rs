//! Task progress events and their wire representation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a task event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Progress,
    Chunk,
    Completed,
    Failed,
    Cancelled,
}

impl EventKind {
    /// Terminal kinds close the task's stream
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Chunk => "chunk",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Immutable progress message for one task
///
/// `sequence` starts at 0 and increases by one per published event of the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub task_id: String,
    pub sequence: u64,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// One wire message per event
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            sequence: self.sequence,
            kind: self.kind,
            payload: self.payload.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Event as surfaced to streaming clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub sequence: u64,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl WireMessage {
    /// Server-sent-event frame; the sequence doubles as the event id so
    /// clients can report the last one they saw when reconnecting
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("id: {}\nevent: {}\ndata: {}\n\n", self.sequence, self.kind.as_str(), data)
    }
}
