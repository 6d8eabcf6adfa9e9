//! Orchestration engine (spec Section 4.7).
//!
//! The state machine described in the spec: CREATED → PREPARE_WORKSPACE →
//! IMPLEMENTER_RUNNING → COMMIT_PUSH_PR → REVIEWER_RUNNING → either
//! APPROVED or CHANGES_REQUESTED (looping back to IMPLEMENTER_RUNNING with
//! an incremented iteration), with FAILED and CANCELLED reachable from any
//! non-terminal state.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use vibe_core::events::{
    CommentData, PrData, RunCreatedData, RunTerminalData, StateChangedData, WorktreeCreatedData,
};
use vibe_core::{
    branch_name, derive_slug, prompt, AgentKind, Artifacts, Clock, Event, EventKind, ImplementerOutput,
    RandomSource, ReviewerOutput, Run, RunId, RunState, Verdict,
};

use crate::agent::{AgentError, AgentRunOutcome};
use crate::git::{GitError, GitService};
use crate::github::{GitHubError, GitHubService};
use crate::persistence::{self, RunPaths, StorageError};
use crate::process::{CancelHandle, CancelListener};
use crate::schema;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("github error: {0}")]
    GitHub(#[from] GitHubError),
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("{0}")]
    Semantic(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Implementer agent capability, swappable between a real subprocess-backed
/// driver and an in-memory fake for tests (spec Section 4.6).
#[async_trait]
pub trait ImplementerAgent: Send + Sync {
    async fn run(&self, prompt: &str, cancel: CancelListener) -> std::result::Result<AgentRunOutcome<ImplementerOutput>, AgentError>;
}

/// Reviewer agent capability; see [`ImplementerAgent`].
#[async_trait]
pub trait ReviewerAgent: Send + Sync {
    async fn run(&self, prompt: &str, cancel: CancelListener) -> std::result::Result<AgentRunOutcome<ReviewerOutput>, AgentError>;
}

/// Drives an agent binary through [`crate::agent::run_agent`], validating
/// against the fixed schemas in [`crate::schema`].
pub struct RealImplementerAgent {
    pub driver: crate::agent::AgentDriver,
    pub schema_path: PathBuf,
    pub output_path: PathBuf,
}

#[async_trait]
impl ImplementerAgent for RealImplementerAgent {
    async fn run(&self, prompt: &str, cancel: CancelListener) -> std::result::Result<AgentRunOutcome<ImplementerOutput>, AgentError> {
        crate::agent::run_agent(
            &self.driver,
            prompt,
            &schema::implementer_schema(),
            &self.schema_path,
            &self.output_path,
            cancel,
            |_, _| {},
            schema::validate_implementer_output,
        )
        .await
    }
}

pub struct RealReviewerAgent {
    pub driver: crate::agent::AgentDriver,
    pub schema_path: PathBuf,
    pub output_path: PathBuf,
}

#[async_trait]
impl ReviewerAgent for RealReviewerAgent {
    async fn run(&self, prompt: &str, cancel: CancelListener) -> std::result::Result<AgentRunOutcome<ReviewerOutput>, AgentError> {
        crate::agent::run_agent(
            &self.driver,
            prompt,
            &schema::reviewer_schema(),
            &self.schema_path,
            &self.output_path,
            cancel,
            |_, _| {},
            schema::validate_reviewer_output,
        )
        .await
    }
}

/// The orchestration engine (spec Section 4.7).
pub struct Engine {
    config: vibe_core::EngineConfig,
    git: GitService,
    github: Arc<dyn GitHubService>,
    implementer: Arc<dyn ImplementerAgent>,
    reviewer: Arc<dyn ReviewerAgent>,
    clock: Arc<dyn Clock>,
    cancel_handle: CancelHandle,
    cancel_listener: CancelListener,
    event_sink: Option<Arc<dyn Fn(&Event) + Send + Sync>>,
}

impl Engine {
    pub fn new(
        config: vibe_core::EngineConfig,
        git: GitService,
        github: Arc<dyn GitHubService>,
        implementer: Arc<dyn ImplementerAgent>,
        reviewer: Arc<dyn ReviewerAgent>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (cancel_handle, cancel_listener) = CancelHandle::new();
        Self {
            config,
            git,
            github,
            implementer,
            reviewer,
            clock,
            cancel_handle,
            cancel_listener,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn Fn(&Event) + Send + Sync>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Sets the cancellation flag; honoured at the next between-step check.
    pub fn cancel(&self) {
        self.cancel_handle.cancel();
    }

    /// Creates a new run in state CREATED (Run Registry responsibility,
    /// spec Section 4.8), generating its identifier, slug, and branch.
    pub async fn create_run(
        &self,
        task: &str,
        implementer_kind: AgentKind,
        reviewer_kind: AgentKind,
        random: &dyn RandomSource,
    ) -> EngineResult<Run> {
        let now = self.clock.now();
        let run_id = RunId::generate(self.clock.as_ref(), random);
        let slug = derive_slug(task);
        let branch = branch_name(&run_id, &slug);
        let worktree_path = self.config.worktree_dir(run_id.as_str());

        let run = Run::new(
            run_id.clone(),
            task,
            slug.clone(),
            branch.clone(),
            worktree_path.to_string_lossy().to_string(),
            implementer_kind,
            reviewer_kind,
            now,
        );

        let paths = RunPaths::new(&self.config, &run_id);
        persistence::ensure_dirs(&paths).await?;
        self.record(
            &paths,
            EventKind::RunCreated,
            now,
            RunCreatedData {
                run_id: run_id.clone(),
                task: task.to_string(),
                slug,
                branch,
                worktree_path: run.worktree_path.clone(),
                implementer_kind,
                reviewer_kind,
            },
        )
        .await?;
        persistence::save_snapshot(&paths, &run).await?;
        persistence::save_artifacts(&paths, &Artifacts::new(run.branch.clone(), run.worktree_path.clone())).await?;
        Ok(run)
    }

    pub async fn load_run(&self, run_id: &RunId) -> EngineResult<Run> {
        let paths = RunPaths::new(&self.config, run_id);
        Ok(persistence::load_snapshot(&paths).await?)
    }

    /// Drives the state machine to a terminal state.
    pub async fn run(&self, run_id: &RunId) -> EngineResult<Run> {
        let paths = RunPaths::new(&self.config, run_id);
        let mut run = persistence::load_snapshot(&paths).await?;

        while !run.state.is_terminal() {
            if self.cancel_listener.is_cancelled() {
                self.transition(&paths, &mut run, RunState::Cancelled).await?;
                self.record(
                    &paths,
                    EventKind::RunCancelled,
                    self.clock.now(),
                    RunTerminalData {
                        run_id: run.id.clone(),
                        reason: None,
                    },
                )
                .await?;
                break;
            }

            if let Err(e) = self.step(&paths, &mut run).await {
                let reason = e.to_string();
                run.failure_reason = Some(reason.clone());
                self.transition(&paths, &mut run, RunState::Failed).await?;
                self.record(
                    &paths,
                    EventKind::RunFailed,
                    self.clock.now(),
                    RunTerminalData {
                        run_id: run.id.clone(),
                        reason: Some(reason),
                    },
                )
                .await?;
                break;
            }
        }
        Ok(run)
    }

    async fn step(&self, paths: &RunPaths, run: &mut Run) -> EngineResult<()> {
        match run.state {
            RunState::Created => self.transition(paths, run, RunState::PrepareWorkspace).await,
            RunState::PrepareWorkspace => self.prepare_workspace(paths, run).await,
            RunState::ImplementerRunning => self.run_implementer(paths, run).await,
            RunState::CommitPushPr => self.commit_push_pr(paths, run).await,
            RunState::ReviewerRunning => self.run_reviewer(paths, run).await,
            RunState::ChangesRequested => {
                run.iteration += 1;
                self.transition(paths, run, RunState::ImplementerRunning).await
            }
            RunState::Approved | RunState::Failed | RunState::Cancelled => Ok(()),
        }
    }

    async fn prepare_workspace(&self, paths: &RunPaths, run: &mut Run) -> EngineResult<()> {
        let worktree_path = PathBuf::from(&run.worktree_path);
        let created = self
            .git
            .create_worktree(&worktree_path, &run.branch, &self.config.base_branch)
            .await?;
        if created {
            self.record(
                paths,
                EventKind::WorktreeCreated,
                self.clock.now(),
                WorktreeCreatedData {
                    path: run.worktree_path.clone(),
                    branch: run.branch.clone(),
                    base_branch: self.config.base_branch.clone(),
                },
            )
            .await?;
        }
        self.transition(paths, run, RunState::ImplementerRunning).await
    }

    async fn run_implementer(&self, paths: &RunPaths, run: &mut Run) -> EngineResult<()> {
        let implementer_prompt = prompt::implementer_prompt(&run.task, run.iteration, &run.requested_changes);
        persistence::save_text(&paths.implementer_prompt(), &implementer_prompt).await?;
        persistence::save_text(
            &paths.implementer_schema(),
            &serde_json::to_string_pretty(&schema::implementer_schema()).unwrap_or_default(),
        )
        .await?;

        let outcome = self.implementer.run(&implementer_prompt, self.cancel_listener.clone()).await?;
        self.record_agent_outcome(paths, "implementer", &outcome).await?;

        run.implementer_summary = Some(outcome.parsed.summary);
        run.pending_commit_message = Some(outcome.parsed.commit_message);
        run.tests = outcome.parsed.tests;
        self.transition(paths, run, RunState::CommitPushPr).await
    }

    async fn commit_push_pr(&self, paths: &RunPaths, run: &mut Run) -> EngineResult<()> {
        let worktree_path = PathBuf::from(&run.worktree_path);
        if !self.git.has_changes(&worktree_path).await? {
            return Err(EngineError::Semantic("Implementer made no changes".to_string()));
        }

        let message = run
            .pending_commit_message
            .clone()
            .unwrap_or_else(|| "Automated change".to_string());
        let hash = self.git.commit_all(&worktree_path, &message).await?;
        self.record(
            paths,
            EventKind::CommitCreated,
            self.clock.now(),
            vibe_core::events::CommitCreatedData {
                hash: hash.clone(),
                message,
            },
        )
        .await?;

        self.git.push(&worktree_path, &self.config.remote, &run.branch).await?;
        self.record(
            paths,
            EventKind::PushCompleted,
            self.clock.now(),
            vibe_core::events::PushCompletedData {
                branch: run.branch.clone(),
                remote: self.config.remote.clone(),
            },
        )
        .await?;

        let mut artifacts = persistence::load_artifacts(paths)
            .await?
            .unwrap_or_else(|| Artifacts::new(run.branch.clone(), run.worktree_path.clone()));
        artifacts.last_commit_hash = Some(hash);

        match self.github.find_pr(&run.branch).await? {
            Some((number, url)) => {
                run.pr_number = Some(number);
                run.pr_url = Some(url);
            }
            None => {
                let title = run.task.lines().next().unwrap_or(&run.task).to_string();
                let (number, url) = self
                    .github
                    .create_pr(&run.branch, &self.config.base_branch, &title, &run.task)
                    .await?;
                self.record(paths, EventKind::PrCreated, self.clock.now(), PrData { number, url: url.clone() })
                    .await?;
                run.pr_number = Some(number);
                run.pr_url = Some(url);
            }
        }
        artifacts.pr_number = run.pr_number;
        artifacts.pr_url = run.pr_url.clone();

        let body = coordination_comment_body(run);
        match run.coordination_comment_id {
            Some(id) => {
                self.github.update_comment(id, &body).await?;
                self.record(paths, EventKind::CommentUpdated, self.clock.now(), CommentData { id }).await?;
            }
            None => {
                let pr_number = run.pr_number.ok_or_else(|| EngineError::Semantic("no PR to comment on".to_string()))?;
                let id = self.github.create_comment(pr_number, &body).await?;
                self.record(paths, EventKind::CommentCreated, self.clock.now(), CommentData { id }).await?;
                run.coordination_comment_id = Some(id);
                artifacts.coordination_comment_id = Some(id);
            }
        }
        persistence::save_artifacts(paths, &artifacts).await?;

        self.transition(paths, run, RunState::ReviewerRunning).await
    }

    async fn run_reviewer(&self, paths: &RunPaths, run: &mut Run) -> EngineResult<()> {
        let worktree_path = PathBuf::from(&run.worktree_path);
        let diff_stat = self.git.diff_stat(&worktree_path, &self.config.base_branch).await?;
        let budgeted_diff = self
            .git
            .budgeted_diff(&worktree_path, &self.config.base_branch, &self.config.diff_budget)
            .await?;

        let reviewer_prompt = prompt::reviewer_prompt(
            run.pr_url.as_deref(),
            run.implementer_summary.as_deref().unwrap_or(""),
            &run.tests,
            &diff_stat,
            &budgeted_diff,
        );
        persistence::save_text(&paths.reviewer_prompt(), &reviewer_prompt).await?;
        persistence::save_text(
            &paths.reviewer_schema(),
            &serde_json::to_string_pretty(&schema::reviewer_schema()).unwrap_or_default(),
        )
        .await?;

        let outcome = self.reviewer.run(&reviewer_prompt, self.cancel_listener.clone()).await?;
        self.record_agent_outcome(paths, "reviewer", &outcome).await?;

        run.reviewer_verdict = Some(outcome.parsed.verdict);
        run.requested_changes = outcome.parsed.requested_changes;

        let body = coordination_comment_body(run);
        if let Some(id) = run.coordination_comment_id {
            self.github.update_comment(id, &body).await?;
            self.record(paths, EventKind::CommentUpdated, self.clock.now(), CommentData { id }).await?;
        }

        match run.reviewer_verdict {
            Some(Verdict::Approved) => {
                self.transition(paths, run, RunState::Approved).await?;
                self.record(
                    paths,
                    EventKind::RunApproved,
                    self.clock.now(),
                    RunTerminalData {
                        run_id: run.id.clone(),
                        reason: None,
                    },
                )
                .await
            }
            _ => self.transition(paths, run, RunState::ChangesRequested).await,
        }
    }

    async fn record_agent_outcome<T>(&self, paths: &RunPaths, role: &str, outcome: &AgentRunOutcome<T>) -> EngineResult<()>
    where
        T: serde::Serialize,
    {
        if let Some(failure) = &outcome.first_failure {
            self.record(
                paths,
                EventKind::AgentOutputReceived,
                self.clock.now(),
                vibe_core::events::AgentOutputData {
                    role: role.to_string(),
                    raw: failure.raw.clone(),
                },
            )
            .await?;
            self.record(
                paths,
                EventKind::AgentOutputInvalid,
                self.clock.now(),
                vibe_core::events::AgentOutputInvalidData {
                    role: role.to_string(),
                    raw: failure.raw.clone(),
                    message: failure.message.clone(),
                },
            )
            .await?;
            self.record(
                paths,
                EventKind::AgentRepairRequested,
                self.clock.now(),
                vibe_core::events::AgentOutputData {
                    role: role.to_string(),
                    raw: String::new(),
                },
            )
            .await?;
        } else {
            self.record(
                paths,
                EventKind::AgentOutputReceived,
                self.clock.now(),
                vibe_core::events::AgentOutputData {
                    role: role.to_string(),
                    raw: outcome.raw.clone(),
                },
            )
            .await?;
        }
        self.record(
            paths,
            EventKind::AgentOutputValidated,
            self.clock.now(),
            vibe_core::events::AgentOutputData {
                role: role.to_string(),
                raw: outcome.raw.clone(),
            },
        )
        .await
    }

    async fn transition(&self, paths: &RunPaths, run: &mut Run, to: RunState) -> EngineResult<()> {
        let from = run.state;
        run.state = to;
        run.updated_at = self.clock.now();
        self.record(
            paths,
            EventKind::StateChanged,
            run.updated_at,
            StateChangedData {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            },
        )
        .await?;
        persistence::save_snapshot(paths, run).await?;
        Ok(())
    }

    async fn record(&self, paths: &RunPaths, kind: EventKind, ts: chrono::DateTime<Utc>, payload: impl serde::Serialize) -> EngineResult<()> {
        let event = Event::new(kind, ts, payload);
        persistence::append_event(paths, &event).await?;
        if let Some(sink) = &self.event_sink {
            sink(&event);
        }
        Ok(())
    }
}

/// The coordination comment body (spec Section 6): a fixed marker line
/// followed by a fenced JSON block.
fn coordination_comment_body(run: &Run) -> String {
    let payload = serde_json::json!({
        "run_id": run.id.as_str(),
        "iteration": run.iteration,
        "state": run.state.as_str(),
        "implementer_summary": run.implementer_summary,
        "reviewer_verdict": run.reviewer_verdict.map(|v| v.as_str()),
        "requested_changes": run.requested_changes,
    });
    format!(
        "[vibe-orch v1][run:{}]\n\n```json\n{}\n```",
        run.id,
        serde_json::to_string_pretty(&payload).unwrap_or_default()
    )
}

#[cfg(test)]
pub mod fakes {
    use super::{AgentError, AgentRunOutcome, ImplementerAgent, ReviewerAgent};
    use crate::process::CancelListener;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use vibe_core::{ImplementerOutput, RequestedChange, ReviewerOutput, TestOutcome, TestResult, Verdict};

    /// Returns one scripted response per call, in order; panics if exhausted.
    ///
    /// Each call also writes a uniquely-named file into `worktree`, standing
    /// in for the real file edits a subprocess-backed implementer would have
    /// made, so that `GitService::has_changes` sees something to commit.
    pub struct ScriptedImplementer {
        responses: Mutex<Vec<std::result::Result<ImplementerOutput, AgentError>>>,
        calls: AtomicUsize,
        worktree: std::path::PathBuf,
    }

    impl ScriptedImplementer {
        pub fn new(worktree: impl Into<std::path::PathBuf>, responses: Vec<std::result::Result<ImplementerOutput, AgentError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
                worktree: worktree.into(),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn always_passing(worktree: impl Into<std::path::PathBuf>, summary: &str) -> Self {
            Self::new(
                worktree,
                vec![Ok(ImplementerOutput {
                    summary: summary.to_string(),
                    commit_message: summary.to_string(),
                    tests: vec![TestResult {
                        command: "cargo test".into(),
                        result: TestOutcome::Pass,
                        notes: None,
                    }],
                    notes: vec![],
                })],
            )
        }
    }

    #[async_trait]
    impl ImplementerAgent for ScriptedImplementer {
        async fn run(&self, _prompt: &str, _cancel: CancelListener) -> std::result::Result<AgentRunOutcome<ImplementerOutput>, AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let response = {
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    panic!("ScriptedImplementer exhausted");
                }
                responses.remove(0)
            };
            tokio::fs::write(self.worktree.join(format!("change-{call}.txt")), "content\n")
                .await
                .expect("scripted implementer can write into worktree");
            response.map(|parsed| AgentRunOutcome {
                raw: serde_json::to_string(&parsed).unwrap_or_default(),
                parsed,
                repaired: false,
                first_failure: None,
            })
        }
    }

    pub struct ScriptedReviewer {
        responses: Mutex<Vec<ReviewerOutput>>,
        calls: AtomicUsize,
    }

    impl ScriptedReviewer {
        pub fn new(responses: Vec<ReviewerOutput>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn approves() -> Self {
            Self::new(vec![ReviewerOutput {
                verdict: Verdict::Approved,
                requested_changes: vec![],
                notes: vec![],
            }])
        }

        pub fn requests_then_approves(change: RequestedChange) -> Self {
            Self::new(vec![
                ReviewerOutput {
                    verdict: Verdict::ChangesRequested,
                    requested_changes: vec![change],
                    notes: vec![],
                },
                ReviewerOutput {
                    verdict: Verdict::Approved,
                    requested_changes: vec![],
                    notes: vec![],
                },
            ])
        }
    }

    #[async_trait]
    impl ReviewerAgent for ScriptedReviewer {
        async fn run(&self, _prompt: &str, _cancel: CancelListener) -> std::result::Result<AgentRunOutcome<ReviewerOutput>, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                panic!("ScriptedReviewer exhausted");
            }
            let parsed = responses.remove(0);
            Ok(AgentRunOutcome {
                raw: serde_json::to_string(&parsed).unwrap_or_default(),
                parsed,
                repaired: false,
                first_failure: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::{ScriptedImplementer, ScriptedReviewer};
    use super::*;
    use crate::github::FakeGitHubService;
    use crate::process::{run_process, ProcessSpec};
    use std::time::Duration;
    use vibe_core::{OsRandomSource, RequestedChange, SystemClock};

    async fn git(dir: &std::path::Path, args: &[&str]) {
        let spec = ProcessSpec::new(std::iter::once("git".to_string()).chain(args.iter().map(|s| s.to_string())).collect())
            .with_current_dir(dir.to_path_buf());
        let (_h, l) = CancelHandle::new();
        let outcome = run_process(spec, Duration::from_secs(10), l, |_, _| {}).await.unwrap();
        assert_eq!(outcome.exit_code, 0, "git {args:?} failed: {}", outcome.stderr);
    }

    /// A bare repository the engine's `push` step can target, plus the
    /// working repository with `origin` pointed at it.
    async fn init_repo(dir: &std::path::Path, origin: &std::path::Path) {
        git(origin, &["init", "-q", "--bare", "-b", "main"]).await;

        git(dir, &["init", "-q", "-b", "main"]).await;
        git(dir, &["config", "user.email", "t@example.com"]).await;
        git(dir, &["config", "user.name", "t"]).await;
        git(dir, &["remote", "add", "origin", &origin.to_string_lossy()]).await;
        tokio::fs::write(dir.join("README.md"), "hello\n").await.unwrap();
        git(dir, &["add", "-A"]).await;
        git(dir, &["commit", "-q", "-m", "initial"]).await;
        git(dir, &["push", "-u", "origin", "main"]).await;
    }

    struct Harness {
        _repo_dir: tempfile::TempDir,
        _origin_dir: tempfile::TempDir,
        config: vibe_core::EngineConfig,
    }

    async fn harness() -> Harness {
        let repo_dir = tempfile::tempdir().unwrap();
        let origin_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path(), origin_dir.path()).await;
        let mut config = vibe_core::EngineConfig::default();
        config.repo_root = repo_dir.path().to_path_buf();
        config.storage_root = repo_dir.path().join(".vibe-orchestrator");
        config.worktrees_root = repo_dir.path().join(".vibe-orchestrator").join("worktrees");
        Harness {
            _repo_dir: repo_dir,
            _origin_dir: origin_dir,
            config,
        }
    }

    fn engine(
        h: &Harness,
        github: Arc<dyn GitHubService>,
        implementer: Arc<dyn ImplementerAgent>,
        reviewer: Arc<dyn ReviewerAgent>,
    ) -> Engine {
        let git = GitService::new(h.config.repo_root.clone(), Duration::from_secs(10));
        Engine::new(h.config.clone(), git, github, implementer, reviewer, Arc::new(SystemClock))
    }

    /// Creates a run via a throwaway engine (create_run never touches the
    /// agents), so the real engine below can be built knowing the worktree
    /// path up front and hand it to the scripted implementer.
    async fn create_run_and_worktree(h: &Harness, task: &str) -> Run {
        let registrar = engine(
            h,
            Arc::new(FakeGitHubService::new()),
            Arc::new(ScriptedImplementer::always_passing("/dev/null", "unused")),
            Arc::new(ScriptedReviewer::approves()),
        );
        let run = registrar
            .create_run(task, AgentKind::JsonFlag, AgentKind::JsonFlag, &OsRandomSource)
            .await
            .unwrap();
        let worktree = PathBuf::from(&run.worktree_path);
        registrar.git.create_worktree(&worktree, &run.branch, &h.config.base_branch).await.unwrap();
        run
    }

    #[tokio::test]
    async fn happy_path_reaches_approved_with_one_pr_and_one_comment() {
        let h = harness().await;
        let run = create_run_and_worktree(&h, "Add user authentication").await;

        let github = Arc::new(FakeGitHubService::new());
        let implementer = Arc::new(ScriptedImplementer::always_passing(&run.worktree_path, "added auth"));
        let reviewer = Arc::new(ScriptedReviewer::approves());
        let eng = engine(&h, github.clone(), implementer, reviewer);

        let paths = RunPaths::new(&h.config, &run.id);
        let final_run = eng.run(&run.id).await.unwrap();
        assert_eq!(final_run.state, RunState::Approved);
        assert_eq!(final_run.iteration, 0);
        assert_eq!(github.pr_count(), 1);

        let events = persistence::read_events(&paths).await.unwrap();
        assert!(matches!(events[0].kind, EventKind::RunCreated));
        assert!(events.iter().any(|e| e.kind == EventKind::RunApproved));
        let state_changes = events.iter().filter(|e| e.kind == EventKind::StateChanged).count();
        assert!(state_changes >= 5);
    }

    #[tokio::test]
    async fn one_iteration_then_approval_increments_iteration_and_updates_comment() {
        let h = harness().await;
        let run = create_run_and_worktree(&h, "Add feature").await;

        let github = Arc::new(FakeGitHubService::new());
        let implementer = Arc::new(ScriptedImplementer::new(
            &run.worktree_path,
            vec![
                Ok(ImplementerOutput {
                    summary: "first pass".into(),
                    commit_message: "first pass".into(),
                    tests: vec![],
                    notes: vec![],
                }),
                Ok(ImplementerOutput {
                    summary: "handled nil".into(),
                    commit_message: "handle nil".into(),
                    tests: vec![],
                    notes: vec![],
                }),
            ],
        ));
        let reviewer = Arc::new(ScriptedReviewer::requests_then_approves(RequestedChange {
            id: "C1".into(),
            path: "src/x.py".into(),
            description: "handle nil".into(),
            acceptance: "add guard".into(),
        }));
        let eng = engine(&h, github.clone(), implementer.clone(), reviewer.clone());

        let paths = RunPaths::new(&h.config, &run.id);
        let final_run = eng.run(&run.id).await.unwrap();

        assert_eq!(final_run.state, RunState::Approved);
        assert_eq!(final_run.iteration, 1);
        assert_eq!(implementer.call_count(), 2);
        assert_eq!(reviewer.call_count(), 2);
        assert_eq!(github.pr_count(), 1);

        let events = persistence::read_events(&paths).await.unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::CommentCreated));
        assert!(events.iter().any(|e| e.kind == EventKind::CommentUpdated));
        assert!(events.iter().any(|e| e.kind == EventKind::PrCreated));
        assert_eq!(events.iter().filter(|e| e.kind == EventKind::PrCreated).count(), 1);
    }

    #[tokio::test]
    async fn no_changes_fails_the_run_without_creating_a_pr() {
        let h = harness().await;
        let run = create_run_and_worktree(&h, "Add no-op").await;

        let github = Arc::new(FakeGitHubService::new());
        // Points at a scratch directory instead of the run's worktree, so
        // the implementer reports work but the worktree itself stays clean.
        let scratch = tempfile::tempdir().unwrap();
        let implementer = Arc::new(ScriptedImplementer::always_passing(scratch.path(), "did nothing"));
        let reviewer = Arc::new(ScriptedReviewer::approves());
        let eng = engine(&h, github.clone(), implementer, reviewer);

        let final_run = eng.run(&run.id).await.unwrap();
        assert_eq!(final_run.state, RunState::Failed);
        assert_eq!(final_run.failure_reason.as_deref(), Some("Implementer made no changes"));
        assert_eq!(github.pr_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_before_run_starts_yields_cancelled() {
        let h = harness().await;
        let github = Arc::new(FakeGitHubService::new());
        let implementer = Arc::new(ScriptedImplementer::always_passing("/dev/null", "x"));
        let reviewer = Arc::new(ScriptedReviewer::approves());
        let eng = engine(&h, github, implementer, reviewer);

        let run = eng
            .create_run("Add feature", AgentKind::JsonFlag, AgentKind::JsonFlag, &OsRandomSource)
            .await
            .unwrap();
        eng.cancel();
        let final_run = eng.run(&run.id).await.unwrap();
        assert_eq!(final_run.state, RunState::Cancelled);

        let paths = RunPaths::new(&h.config, &run.id);
        let events = persistence::read_events(&paths).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::RunCancelled);
    }
}
