//! GitHub service (spec Section 4.4).
//!
//! Shells out to the `gh` CLI. [`FakeGitHubService`] holds pull requests
//! and comments in memory with monotonic identifiers so the engine's
//! end-to-end tests run without a network or a real repository.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::process::{run_process, CancelHandle, ProcessSpec};

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("gh {args:?} exited {exit_code}: {stderr}")]
    CommandFailed {
        args: Vec<String>,
        exit_code: i32,
        stderr: String,
    },
    #[error("gh {args:?} timed out")]
    TimedOut { args: Vec<String> },
    #[error("could not parse gh output for {args:?}: {message}")]
    BadOutput { args: Vec<String>, message: String },
    #[error("process error: {0}")]
    Process(#[from] crate::process::ProcessError),
}

pub type Result<T> = std::result::Result<T, GitHubError>;

#[async_trait]
pub trait GitHubService: Send + Sync {
    async fn find_pr(&self, branch: &str) -> Result<Option<(u64, String)>>;
    async fn create_pr(&self, head: &str, base: &str, title: &str, body: &str) -> Result<(u64, String)>;
    async fn create_comment(&self, pr_number: u64, body: &str) -> Result<u64>;
    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()>;
}

/// Real `gh` CLI-backed implementation.
pub struct GhCliGitHubService {
    repo_root: PathBuf,
    timeout: Duration,
    owner_repo: OnceCell<String>,
}

impl GhCliGitHubService {
    pub fn new(repo_root: PathBuf, timeout: Duration) -> Self {
        Self {
            repo_root,
            timeout,
            owner_repo: OnceCell::new(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let argv: Vec<String> = std::iter::once("gh".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        let spec = ProcessSpec::new(argv.clone()).with_current_dir(self.repo_root.clone());
        let (_handle, listener) = CancelHandle::new();
        let outcome = run_process(spec, self.timeout, listener, |_, _| {}).await?;
        if outcome.timed_out {
            return Err(GitHubError::TimedOut { args: argv });
        }
        if outcome.exit_code != 0 {
            return Err(GitHubError::CommandFailed {
                args: argv,
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }
        Ok(outcome.stdout)
    }

    async fn owner_repo(&self) -> Result<&str> {
        self.owner_repo
            .get_or_try_init(|| async {
                let out = self.run(&["repo", "view", "--json", "nameWithOwner"]).await?;
                let value: serde_json::Value = serde_json::from_str(&out).map_err(|e| GitHubError::BadOutput {
                    args: vec!["repo".into(), "view".into()],
                    message: e.to_string(),
                })?;
                value
                    .get("nameWithOwner")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| GitHubError::BadOutput {
                        args: vec!["repo".into(), "view".into()],
                        message: "missing nameWithOwner".into(),
                    })
            })
            .await
            .map(String::as_str)
    }
}

#[async_trait]
impl GitHubService for GhCliGitHubService {
    async fn find_pr(&self, branch: &str) -> Result<Option<(u64, String)>> {
        let out = self
            .run(&["pr", "list", "--head", branch, "--state", "open", "--json", "number,url"])
            .await?;
        let value: Vec<serde_json::Value> = serde_json::from_str(&out).map_err(|e| GitHubError::BadOutput {
            args: vec!["pr".into(), "list".into()],
            message: e.to_string(),
        })?;
        Ok(value.first().and_then(|pr| {
            let number = pr.get("number")?.as_u64()?;
            let url = pr.get("url")?.as_str()?.to_string();
            Some((number, url))
        }))
    }

    async fn create_pr(&self, head: &str, base: &str, title: &str, body: &str) -> Result<(u64, String)> {
        let out = self
            .run(&[
                "pr", "create", "--head", head, "--base", base, "--title", title, "--body", body, "--json",
                "number,url",
            ])
            .await?;
        let value: serde_json::Value = serde_json::from_str(&out).map_err(|e| GitHubError::BadOutput {
            args: vec!["pr".into(), "create".into()],
            message: e.to_string(),
        })?;
        let number = value
            .get("number")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| GitHubError::BadOutput {
                args: vec!["pr".into(), "create".into()],
                message: "missing number".into(),
            })?;
        let url = value
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GitHubError::BadOutput {
                args: vec!["pr".into(), "create".into()],
                message: "missing url".into(),
            })?
            .to_string();
        Ok((number, url))
    }

    async fn create_comment(&self, pr_number: u64, body: &str) -> Result<u64> {
        let owner_repo = self.owner_repo().await?.to_string();
        let path = format!("repos/{owner_repo}/issues/{pr_number}/comments");
        let body_arg = format!("body={body}");
        let out = self.run(&["api", "-X", "POST", &path, "-f", &body_arg]).await?;
        let value: serde_json::Value = serde_json::from_str(&out).map_err(|e| GitHubError::BadOutput {
            args: vec!["api".into(), path.clone()],
            message: e.to_string(),
        })?;
        value
            .get("id")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| GitHubError::BadOutput {
                args: vec!["api".into(), path],
                message: "missing id".into(),
            })
    }

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()> {
        let owner_repo = self.owner_repo().await?.to_string();
        let path = format!("repos/{owner_repo}/issues/comments/{comment_id}");
        let body_arg = format!("body={body}");
        self.run(&["api", "-X", "PATCH", &path, "-f", &body_arg]).await?;
        Ok(())
    }
}

/// In-memory fake for deterministic tests (spec Section 4.4).
#[derive(Debug, Default)]
pub struct FakeGitHubService {
    next_pr: AtomicU64,
    next_comment: AtomicU64,
    prs_by_branch: Mutex<HashMap<String, (u64, String)>>,
    comments: Mutex<HashMap<u64, String>>,
}

impl FakeGitHubService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comment_body(&self, id: u64) -> Option<String> {
        self.comments.lock().unwrap().get(&id).cloned()
    }

    pub fn pr_count(&self) -> usize {
        self.prs_by_branch.lock().unwrap().len()
    }
}

#[async_trait]
impl GitHubService for FakeGitHubService {
    async fn find_pr(&self, branch: &str) -> Result<Option<(u64, String)>> {
        Ok(self.prs_by_branch.lock().unwrap().get(branch).cloned())
    }

    async fn create_pr(&self, head: &str, _base: &str, _title: &str, _body: &str) -> Result<(u64, String)> {
        let number = self.next_pr.fetch_add(1, Ordering::SeqCst) + 1;
        let url = format!("https://example.com/pulls/{number}");
        self.prs_by_branch
            .lock()
            .unwrap()
            .insert(head.to_string(), (number, url.clone()));
        Ok((number, url))
    }

    async fn create_comment(&self, _pr_number: u64, body: &str) -> Result<u64> {
        let id = self.next_comment.fetch_add(1, Ordering::SeqCst) + 1;
        self.comments.lock().unwrap().insert(id, body.to_string());
        Ok(id)
    }

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()> {
        self.comments.lock().unwrap().insert(comment_id, body.to_string());
        Ok(())
    }
}
