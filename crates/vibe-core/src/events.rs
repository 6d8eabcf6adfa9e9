//! Event taxonomy for the per-run audit log (spec Section 3, Section 6).
//!
//! Each line of `events.jsonl` is one compact JSON object with keys
//! `type`, `ts`, `data`, matching the wire format fixed by the spec.

use crate::ids::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed taxonomy of event kinds (spec Section 3, "Event").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCreated,
    StateChanged,
    ProcessStarted,
    ProcessLine,
    ProcessExited,
    AgentOutputReceived,
    AgentOutputValidated,
    AgentOutputInvalid,
    AgentRepairRequested,
    WorktreeCreated,
    CommitCreated,
    PushCompleted,
    PrCreated,
    PrUpdated,
    CommentCreated,
    CommentUpdated,
    Error,
    Timeout,
    RunApproved,
    RunFailed,
    RunCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::StateChanged => "state_changed",
            Self::ProcessStarted => "process_started",
            Self::ProcessLine => "process_line",
            Self::ProcessExited => "process_exited",
            Self::AgentOutputReceived => "agent_output_received",
            Self::AgentOutputValidated => "agent_output_validated",
            Self::AgentOutputInvalid => "agent_output_invalid",
            Self::AgentRepairRequested => "agent_repair_requested",
            Self::WorktreeCreated => "worktree_created",
            Self::CommitCreated => "commit_created",
            Self::PushCompleted => "push_completed",
            Self::PrCreated => "pr_created",
            Self::PrUpdated => "pr_updated",
            Self::CommentCreated => "comment_created",
            Self::CommentUpdated => "comment_updated",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::RunApproved => "run_approved",
            Self::RunFailed => "run_failed",
            Self::RunCancelled => "run_cancelled",
        }
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub ts: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Event {
    /// Build an event from a typed payload, serialising it into `data`.
    pub fn new(kind: EventKind, ts: DateTime<Utc>, payload: impl Serialize) -> Self {
        Self {
            kind,
            ts,
            data: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Serialise as one compact JSON line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one line of `events.jsonl`. Callers should skip a trailing
    /// partial line rather than treat it as an error.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreatedData {
    pub run_id: RunId,
    pub task: String,
    pub slug: String,
    pub branch: String,
    pub worktree_path: String,
    pub implementer_kind: crate::types::AgentKind,
    pub reviewer_kind: crate::types::AgentKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedData {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStartedData {
    pub label: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLineData {
    pub label: String,
    pub stream: String,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExitedData {
    pub label: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutputData {
    pub role: String,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutputInvalidData {
    pub role: String,
    pub raw: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeCreatedData {
    pub path: String,
    pub branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitCreatedData {
    pub hash: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushCompletedData {
    pub branch: String,
    pub remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrData {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentData {
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutData {
    pub label: String,
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTerminalData {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
