//! Engine configuration.
//!
//! A plain, host-supplied configuration struct. Loading it from a file or
//! environment is out of scope here (non-goal); a host assembles one
//! however it likes and hands it to the engine.

use crate::types::AgentKind;
use std::path::PathBuf;

/// Caps for the budgeted reviewer diff (spec Section 4.3).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct DiffBudget {
    pub max_files: usize,
    pub max_bytes: usize,
    pub max_hunks_per_file: usize,
}

impl Default for DiffBudget {
    fn default() -> Self {
        Self {
            max_files: 50,
            max_bytes: 60_000,
            max_hunks_per_file: 20,
        }
    }
}

/// Engine-wide configuration (spec Section 4.7, Section 5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Absolute path to the repository root.
    pub repo_root: PathBuf,
    /// Base branch new run branches are created from.
    pub base_branch: String,
    /// Git remote to push to.
    pub remote: String,
    pub implementer_kind: AgentKind,
    pub reviewer_kind: AgentKind,
    /// Implementer step timeout in seconds (spec Section 5: 30 min default).
    pub implementer_timeout_sec: u64,
    /// Reviewer step timeout in seconds (spec Section 5: 15 min default).
    pub reviewer_timeout_sec: u64,
    /// Timeout for git/GitHub subprocess calls (spec Section 5: 2 min default).
    pub git_timeout_sec: u64,
    pub diff_budget: DiffBudget,
    /// Directory worktrees are created under.
    pub worktrees_root: PathBuf,
    /// Directory run state is persisted under (`<repo>/.vibe-orchestrator`).
    pub storage_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let repo_root = PathBuf::from(".");
        Self {
            storage_root: repo_root.join(".vibe-orchestrator"),
            worktrees_root: repo_root.join(".vibe-orchestrator").join("worktrees"),
            repo_root,
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            implementer_kind: AgentKind::JsonFlag,
            reviewer_kind: AgentKind::JsonFlag,
            implementer_timeout_sec: 30 * 60,
            reviewer_timeout_sec: 15 * 60,
            git_timeout_sec: 120,
            diff_budget: DiffBudget::default(),
        }
    }
}

impl EngineConfig {
    /// Per-run directory: `<storage_root>/runs/<run_id>/`.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.storage_root.join("runs").join(run_id)
    }

    /// Per-run worktree path: `<worktrees_root>/<run_id>/`.
    pub fn worktree_dir(&self, run_id: &str) -> PathBuf {
        self.worktrees_root.join(run_id)
    }
}
