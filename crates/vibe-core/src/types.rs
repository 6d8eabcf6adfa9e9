//! Core data model for runs, matching spec Section 3.

use crate::ids::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which CLI contract an agent driver speaks.
///
/// `JsonFlag` accepts the schema inline via a flag and returns a JSON
/// envelope on stdout. `SchemaFile` accepts a schema-file path and a
/// last-message output-file path, reading the task from stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    JsonFlag,
    SchemaFile,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JsonFlag => "json_flag",
            Self::SchemaFile => "schema_file",
        }
    }
}

/// Run lifecycle state (spec Section 4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Created,
    PrepareWorkspace,
    ImplementerRunning,
    CommitPushPr,
    ReviewerRunning,
    ChangesRequested,
    Approved,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::PrepareWorkspace => "PREPARE_WORKSPACE",
            Self::ImplementerRunning => "IMPLEMENTER_RUNNING",
            Self::CommitPushPr => "COMMIT_PUSH_PR",
            Self::ReviewerRunning => "REVIEWER_RUNNING",
            Self::ChangesRequested => "CHANGES_REQUESTED",
            Self::Approved => "APPROVED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states never transition again (invariant I4).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Failed | Self::Cancelled)
    }
}

/// Reviewer verdict (spec Section 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    ChangesRequested,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
        }
    }
}

/// Outcome of a single test command reported by the implementer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Pass,
    Fail,
    NotRun,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::NotRun => "not_run",
        }
    }
}

/// A single test result reported by the implementer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub command: String,
    pub result: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A single requested change reported by the reviewer.
///
/// Ordered; the order is the order emitted by the reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestedChange {
    /// Short identifier, e.g. "C1".
    pub id: String,
    /// Target path, `*` means repository-wide.
    pub path: String,
    pub description: String,
    pub acceptance: String,
}

/// Durable, derived artifacts for a run (spec Section 3, `artifacts.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifacts {
    pub branch: String,
    pub worktree_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_comment_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit_hash: Option<String>,
}

impl Artifacts {
    pub fn new(branch: impl Into<String>, worktree_path: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            worktree_path: worktree_path.into(),
            pr_number: None,
            pr_url: None,
            coordination_comment_id: None,
            last_commit_hash: None,
        }
    }
}

/// The full derived snapshot of a run (spec Section 3, `run.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task: String,
    pub slug: String,
    pub branch: String,
    pub state: RunState,
    /// Increments whenever the reviewer requests changes. Starts at 0.
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub implementer_kind: AgentKind,
    pub reviewer_kind: AgentKind,
    pub worktree_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_comment_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementer_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_commit_message: Option<String>,
    #[serde(default)]
    pub tests: Vec<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_verdict: Option<Verdict>,
    #[serde(default)]
    pub requested_changes: Vec<RequestedChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Validated implementer agent output (spec Section 4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementerOutput {
    pub summary: String,
    pub commit_message: String,
    #[serde(default)]
    pub tests: Vec<TestResult>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Validated reviewer agent output (spec Section 4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerOutput {
    pub verdict: Verdict,
    #[serde(default)]
    pub requested_changes: Vec<RequestedChange>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Run {
    /// A run in state CREATED for the given id, task, and branch metadata.
    pub fn new(
        id: RunId,
        task: impl Into<String>,
        slug: impl Into<String>,
        branch: impl Into<String>,
        worktree_path: impl Into<String>,
        implementer_kind: AgentKind,
        reviewer_kind: AgentKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task: task.into(),
            slug: slug.into(),
            branch: branch.into(),
            state: RunState::Created,
            iteration: 0,
            created_at: now,
            updated_at: now,
            implementer_kind,
            reviewer_kind,
            worktree_path: worktree_path.into(),
            pr_number: None,
            pr_url: None,
            coordination_comment_id: None,
            implementer_summary: None,
            pending_commit_message: None,
            tests: Vec::new(),
            reviewer_verdict: None,
            requested_changes: Vec::new(),
            failure_reason: None,
        }
    }

    /// Invariant I6: if the verdict is approved, requested changes are empty.
    pub fn verdict_is_consistent(&self) -> bool {
        match self.reviewer_verdict {
            Some(Verdict::Approved) => self.requested_changes.is_empty(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_terminal_states() {
        assert!(RunState::Approved.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::ReviewerRunning.is_terminal());
        assert!(!RunState::Created.is_terminal());
    }

    #[test]
    fn run_state_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunState::ImplementerRunning).unwrap(),
            "\"IMPLEMENTER_RUNNING\""
        );
    }

    #[test]
    fn verdict_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Verdict::ChangesRequested).unwrap(),
            "\"changes_requested\""
        );
    }

    #[test]
    fn verdict_consistency_invariant() {
        let mut run = Run::new(
            RunId::from_string("run-1"),
            "task",
            "slug",
            "agent/run-1-slug",
            "/tmp/wt",
            AgentKind::JsonFlag,
            AgentKind::SchemaFile,
            Utc::now(),
        );
        run.reviewer_verdict = Some(Verdict::Approved);
        assert!(run.verdict_is_consistent());

        run.requested_changes.push(RequestedChange {
            id: "C1".into(),
            path: "*".into(),
            description: "d".into(),
            acceptance: "a".into(),
        });
        assert!(!run.verdict_is_consistent());
    }
}
