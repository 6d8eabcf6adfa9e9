//! Event log and snapshot store (spec Section 3, Section 4.2).
//!
//! `events.jsonl` is the source of truth (invariant I1); `run.json` and
//! `artifacts.json` are small derived caches written whole after every
//! state transition. [`replay`] reconstructs a snapshot from nothing but
//! the event log, so a missing or corrupt cache is recoverable.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use vibe_core::events::{
    CommentData, PrData, RunCreatedData, RunTerminalData, StateChangedData,
};
use vibe_core::{Artifacts, EngineConfig, Event, EventKind, ImplementerOutput, ReviewerOutput, Run, RunId, RunState};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("run {0} has no snapshot on disk")]
    SnapshotMissing(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Filesystem layout for a single run directory, rooted at
/// `<storage_root>/runs/<run_id>/` (spec Section 3).
#[derive(Debug, Clone)]
pub struct RunPaths {
    root: PathBuf,
}

impl RunPaths {
    pub fn new(config: &EngineConfig, run_id: &RunId) -> Self {
        Self {
            root: config.run_dir(run_id.as_str()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_json(&self) -> PathBuf {
        self.root.join("run.json")
    }

    pub fn artifacts_json(&self) -> PathBuf {
        self.root.join("artifacts.json")
    }

    pub fn events_jsonl(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.root.join("prompts")
    }

    pub fn schemas_dir(&self) -> PathBuf {
        self.root.join("schemas")
    }

    pub fn implementer_prompt(&self) -> PathBuf {
        self.prompts_dir().join("implementer.txt")
    }

    pub fn reviewer_prompt(&self) -> PathBuf {
        self.prompts_dir().join("reviewer.txt")
    }

    pub fn implementer_schema(&self) -> PathBuf {
        self.schemas_dir().join("implementer.json")
    }

    pub fn reviewer_schema(&self) -> PathBuf {
        self.schemas_dir().join("reviewer.json")
    }

    pub fn implementer_output(&self) -> PathBuf {
        self.root.join("implementer_output.json")
    }

    pub fn reviewer_output(&self) -> PathBuf {
        self.root.join("reviewer_output.json")
    }
}

/// Create the run directory tree (`prompts/`, `schemas/`) if it does not exist.
pub async fn ensure_dirs(paths: &RunPaths) -> Result<()> {
    tokio::fs::create_dir_all(paths.prompts_dir())
        .await
        .map_err(|e| io_err(&paths.prompts_dir(), e))?;
    tokio::fs::create_dir_all(paths.schemas_dir())
        .await
        .map_err(|e| io_err(&paths.schemas_dir(), e))?;
    Ok(())
}

/// Append one event line to `events.jsonl`. Opens in append mode so a kill
/// between two appends leaves every prior line intact.
pub async fn append_event(paths: &RunPaths, event: &Event) -> Result<()> {
    let line = event.to_line()?;
    let path = paths.events_jsonl();
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|e| io_err(&path, e))?;
    file.write_all(line.as_bytes()).await.map_err(|e| io_err(&path, e))?;
    file.write_all(b"\n").await.map_err(|e| io_err(&path, e))?;
    file.flush().await.map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// Read every complete event. A trailing partial line (e.g. from a kill
/// mid-write) is skipped rather than treated as an error.
pub async fn read_events(paths: &RunPaths) -> Result<Vec<Event>> {
    let path = paths.events_jsonl();
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(&path, e)),
    };

    let mut events = Vec::new();
    let mut lines = contents.lines().peekable();
    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        match Event::from_line(line) {
            Ok(event) => events.push(event),
            Err(_) if lines.peek().is_none() => {
                tracing::warn!(path = %path.display(), "skipping partial trailing event line");
            }
            Err(e) => return Err(StorageError::Serde(e)),
        }
    }
    Ok(events)
}

async fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, body).await.map_err(|e| io_err(path, e))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

pub async fn save_snapshot(paths: &RunPaths, run: &Run) -> Result<()> {
    write_json(&paths.run_json(), run).await
}

/// Load the cached snapshot, falling back to replaying `events.jsonl` if
/// the cache is missing (spec Section 4.2: "a reader that finds them
/// missing reconstructs from events").
pub async fn load_snapshot(paths: &RunPaths) -> Result<Run> {
    if let Some(run) = read_json::<Run>(&paths.run_json()).await? {
        return Ok(run);
    }
    let events = read_events(paths).await?;
    replay(&events).ok_or_else(|| StorageError::SnapshotMissing(paths.root.display().to_string()))
}

pub async fn save_artifacts(paths: &RunPaths, artifacts: &Artifacts) -> Result<()> {
    write_json(&paths.artifacts_json(), artifacts).await
}

pub async fn load_artifacts(paths: &RunPaths) -> Result<Option<Artifacts>> {
    read_json(&paths.artifacts_json()).await
}

pub async fn save_text(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content).await.map_err(|e| io_err(path, e))
}

pub async fn load_text(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Reconstruct a [`Run`] snapshot purely from an ordered event slice
/// (testable property #1: replaying `events.jsonl` from empty state
/// yields the same terminal snapshot as `run.json`).
///
/// Returns `None` if the events do not even contain a `run_created`.
pub fn replay(events: &[Event]) -> Option<Run> {
    let created = events.iter().find_map(|e| {
        (e.kind == EventKind::RunCreated)
            .then(|| serde_json::from_value::<RunCreatedData>(e.data.clone()).ok())
            .flatten()
    })?;
    let created_ts = events.iter().find(|e| e.kind == EventKind::RunCreated)?.ts;
    let updated_ts = events.last().map(|e| e.ts).unwrap_or(created_ts);

    let mut run = Run::new(
        created.run_id,
        created.task,
        created.slug,
        created.branch,
        created.worktree_path,
        created.implementer_kind,
        created.reviewer_kind,
        created_ts,
    );
    run.updated_at = updated_ts;

    let mut iteration = 0u32;
    for event in events {
        match event.kind {
            EventKind::StateChanged => {
                if let Ok(data) = serde_json::from_value::<StateChangedData>(event.data.clone()) {
                    if data.from == "CHANGES_REQUESTED" && data.to == "IMPLEMENTER_RUNNING" {
                        iteration += 1;
                    }
                    if let Some(state) = parse_state(&data.to) {
                        run.state = state;
                    }
                }
            }
            EventKind::AgentOutputValidated => {
                apply_agent_output(&mut run, event);
            }
            EventKind::PrCreated | EventKind::PrUpdated => {
                if let Ok(data) = serde_json::from_value::<PrData>(event.data.clone()) {
                    run.pr_number = Some(data.number);
                    run.pr_url = Some(data.url);
                }
            }
            EventKind::CommentCreated => {
                if let Ok(data) = serde_json::from_value::<CommentData>(event.data.clone()) {
                    run.coordination_comment_id = Some(data.id);
                }
            }
            EventKind::RunFailed => {
                if let Ok(data) = serde_json::from_value::<RunTerminalData>(event.data.clone()) {
                    run.failure_reason = data.reason;
                }
                run.state = RunState::Failed;
            }
            EventKind::RunApproved => run.state = RunState::Approved,
            EventKind::RunCancelled => run.state = RunState::Cancelled,
            _ => {}
        }
    }
    run.iteration = iteration;
    Some(run)
}

fn apply_agent_output(run: &mut Run, event: &Event) {
    let Ok(data) = serde_json::from_value::<vibe_core::events::AgentOutputData>(event.data.clone()) else {
        return;
    };
    match data.role.as_str() {
        "implementer" => {
            if let Ok(output) = serde_json::from_str::<ImplementerOutput>(&data.raw) {
                run.implementer_summary = Some(output.summary);
                run.pending_commit_message = Some(output.commit_message);
                run.tests = output.tests;
            }
        }
        "reviewer" => {
            if let Ok(output) = serde_json::from_str::<ReviewerOutput>(&data.raw) {
                run.reviewer_verdict = Some(output.verdict);
                run.requested_changes = output.requested_changes;
            }
        }
        _ => {}
    }
}

fn parse_state(s: &str) -> Option<RunState> {
    match s {
        "CREATED" => Some(RunState::Created),
        "PREPARE_WORKSPACE" => Some(RunState::PrepareWorkspace),
        "IMPLEMENTER_RUNNING" => Some(RunState::ImplementerRunning),
        "COMMIT_PUSH_PR" => Some(RunState::CommitPushPr),
        "REVIEWER_RUNNING" => Some(RunState::ReviewerRunning),
        "CHANGES_REQUESTED" => Some(RunState::ChangesRequested),
        "APPROVED" => Some(RunState::Approved),
        "FAILED" => Some(RunState::Failed),
        "CANCELLED" => Some(RunState::Cancelled),
        _ => None,
    }
}
