//! Git service (spec Section 4.3).
//!
//! Every operation shells out to the `git` binary, bounded by a uniform
//! timeout. The budgeted-diff algorithm is the one piece of real logic:
//! everything else is a thin, typed wrapper over a subprocess call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use vibe_core::DiffBudget;

use crate::process::{run_process, CancelHandle, ProcessSpec};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {args:?} exited {exit_code}: {stderr}")]
    CommandFailed {
        args: Vec<String>,
        exit_code: i32,
        stderr: String,
    },
    #[error("git {args:?} timed out")]
    TimedOut { args: Vec<String> },
    #[error("process error: {0}")]
    Process(#[from] crate::process::ProcessError),
}

pub type Result<T> = std::result::Result<T, GitError>;

const OMITTED_FILES_MARKER: &str = "OMITTED_FILES_COUNT=";
const TRUNCATED_HUNKS_MARKER: &str = "[TRUNCATED_HUNKS]";
const TRUNCATED_BUDGET_MARKER: &str = "[TRUNCATED_DIFF_BUDGET]";

/// Shells out to `git`, rooted at the repository (for worktree creation)
/// or a worktree directory (for everything else).
#[derive(Debug, Clone)]
pub struct GitService {
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitService {
    pub fn new(repo_root: PathBuf, timeout: Duration) -> Self {
        Self { repo_root, timeout }
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let argv: Vec<String> = std::iter::once("git".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        let spec = ProcessSpec::new(argv.clone()).with_current_dir(cwd.to_path_buf());
        let (_handle, listener) = CancelHandle::new();
        let outcome = run_process(spec, self.timeout, listener, |_, _| {}).await?;
        if outcome.timed_out {
            return Err(GitError::TimedOut { args: argv });
        }
        if outcome.exit_code != 0 {
            return Err(GitError::CommandFailed {
                args: argv,
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }
        Ok(outcome.stdout)
    }

    /// Idempotent per invariant I7: skips creation if the path already exists.
    pub async fn create_worktree(&self, path: &Path, branch: &str, base_branch: &str) -> Result<bool> {
        if tokio::fs::metadata(path).await.is_ok() {
            return Ok(false);
        }
        let path_str = path.to_string_lossy().to_string();
        self.run(
            &self.repo_root,
            &["worktree", "add", "-b", branch, &path_str, base_branch],
        )
        .await?;
        Ok(true)
    }

    pub async fn has_changes(&self, worktree: &Path) -> Result<bool> {
        let out = self.run(worktree, &["status", "--porcelain"]).await?;
        Ok(!out.trim().is_empty())
    }

    pub async fn commit_all(&self, worktree: &Path, message: &str) -> Result<String> {
        self.run(worktree, &["add", "-A"]).await?;
        self.run(worktree, &["commit", "-m", message]).await?;
        let hash = self.run(worktree, &["rev-parse", "HEAD"]).await?;
        Ok(hash.trim().to_string())
    }

    pub async fn push(&self, worktree: &Path, remote: &str, branch: &str) -> Result<()> {
        self.run(worktree, &["push", "-u", remote, branch]).await?;
        Ok(())
    }

    pub async fn diff_stat(&self, worktree: &Path, base: &str) -> Result<String> {
        let range = format!("{base}...HEAD");
        self.run(worktree, &["diff", "--stat", &range]).await
    }

    /// Lexicographically sorted per invariant on the budgeted-diff input.
    pub async fn changed_files(&self, worktree: &Path, base: &str) -> Result<Vec<String>> {
        let range = format!("{base}...HEAD");
        let out = self.run(worktree, &["diff", "--name-only", &range]).await?;
        let mut files: Vec<String> = out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect();
        files.sort();
        Ok(files)
    }

    pub async fn file_diff(&self, worktree: &Path, base: &str, file: &str) -> Result<String> {
        let range = format!("{base}...HEAD");
        self.run(worktree, &["diff", "-U3", &range, "--", file]).await
    }

    /// The budgeted-diff algorithm (spec Section 4.3, invariant #6).
    pub async fn budgeted_diff(&self, worktree: &Path, base: &str, budget: &DiffBudget) -> Result<String> {
        let mut files = self.changed_files(worktree, base).await?;
        let mut out = String::new();

        if files.len() > budget.max_files {
            let omitted = files.len() - budget.max_files;
            files.truncate(budget.max_files);
            out.push_str(&format!("{OMITTED_FILES_MARKER}{omitted}\n"));
        }

        let mut total_bytes = out.len();
        for file in &files {
            let raw = self.file_diff(worktree, base, file).await?;
            let truncated = truncate_hunks(&raw, budget.max_hunks_per_file);
            if total_bytes + truncated.len() > budget.max_bytes {
                out.push_str(TRUNCATED_BUDGET_MARKER);
                out.push('\n');
                break;
            }
            total_bytes += truncated.len();
            out.push_str(&truncated);
        }
        Ok(out)
    }
}

/// Keeps diff lines verbatim until the `(max_hunks+1)`-th `@@` hunk header,
/// then replaces it with a literal marker and stops.
fn truncate_hunks(diff: &str, max_hunks: usize) -> String {
    let mut out = String::with_capacity(diff.len());
    let mut hunk_count = 0usize;
    for line in diff.lines() {
        if line.starts_with("@@") {
            hunk_count += 1;
            if hunk_count > max_hunks {
                out.push_str(TRUNCATED_HUNKS_MARKER);
                out.push('\n');
                break;
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}
