//! Run registry (spec Section 4.8): enumerate and create runs.
//!
//! Listing never touches the event log; it trusts `run.json`, falling back
//! to a replay only when that cache is missing, same as [`crate::persistence::load_snapshot`].

use std::path::Path;

use thiserror::Error;
use vibe_core::{EngineConfig, Run};

use crate::persistence::{self, RunPaths, StorageError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error listing runs under {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Every run under `<storage_root>/runs/`, newest first.
///
/// A run directory that fails to load (corrupt snapshot, no events at all)
/// is skipped rather than failing the whole listing, so one bad run does
/// not hide the rest.
pub async fn list_runs(config: &EngineConfig) -> Result<Vec<Run>> {
    let runs_dir = config.storage_root.join("runs");
    let mut entries = match tokio::fs::read_dir(&runs_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(RegistryError::Io {
                path: runs_dir,
                source: e,
            })
        }
    };

    let mut runs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| RegistryError::Io {
        path: runs_dir.clone(),
        source: e,
    })? {
        if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let run_id = vibe_core::RunId::from_string(entry.file_name().to_string_lossy().to_string());
        let paths = RunPaths::new(config, &run_id);
        match persistence::load_snapshot(&paths).await {
            Ok(run) => runs.push(run),
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "skipping unreadable run directory");
            }
        }
    }

    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(runs)
}

/// True if a directory under `runs/` exists for the given id.
pub async fn run_exists(config: &EngineConfig, run_id: &vibe_core::RunId) -> bool {
    tokio::fs::metadata(RunPaths::new(config, run_id).root()).await.is_ok()
}

pub fn runs_dir(config: &EngineConfig) -> std::path::PathBuf {
    config.storage_root.join("runs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use vibe_core::events::RunCreatedData;
    use vibe_core::{AgentKind, Event, EventKind};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn config(root: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.storage_root = root.join(".vibe-orchestrator");
        config.worktrees_root = root.join(".vibe-orchestrator").join("worktrees");
        config
    }

    async fn seed_run(config: &EngineConfig, id: &str, created_at: &str) {
        let run_id = vibe_core::RunId::from_string(id);
        let paths = RunPaths::new(config, &run_id);
        persistence::ensure_dirs(&paths).await.unwrap();
        let event = Event::new(
            EventKind::RunCreated,
            ts(created_at),
            RunCreatedData {
                run_id: run_id.clone(),
                task: format!("task for {id}"),
                slug: id.to_string(),
                branch: format!("agent/{id}-{id}"),
                worktree_path: format!("/tmp/{id}"),
                implementer_kind: AgentKind::JsonFlag,
                reviewer_kind: AgentKind::JsonFlag,
            },
        );
        persistence::append_event(&paths, &event).await.unwrap();
        let run = persistence::replay(&[event]).unwrap();
        persistence::save_snapshot(&paths, &run).await.unwrap();
    }

    #[tokio::test]
    async fn list_runs_is_empty_when_storage_root_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert!(list_runs(&config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_runs_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        seed_run(&config, "r1", "2024-03-05T10:00:00Z").await;
        seed_run(&config, "r2", "2024-03-05T12:00:00Z").await;
        seed_run(&config, "r3", "2024-03-05T11:00:00Z").await;

        let runs = list_runs(&config).await.unwrap();
        let ids: Vec<String> = runs.iter().map(|r| r.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["r2", "r3", "r1"]);
    }

    #[tokio::test]
    async fn list_runs_skips_a_directory_with_no_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        seed_run(&config, "good", "2024-03-05T10:00:00Z").await;
        let empty_run_id = vibe_core::RunId::from_string("empty");
        persistence::ensure_dirs(&RunPaths::new(&config, &empty_run_id)).await.unwrap();

        let runs = list_runs(&config).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id.as_str(), "good");
    }

    #[tokio::test]
    async fn run_exists_reflects_directory_presence() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let run_id = vibe_core::RunId::from_string("r1");
        assert!(!run_exists(&config, &run_id).await);
        seed_run(&config, "r1", "2024-03-05T10:00:00Z").await;
        assert!(run_exists(&config, &run_id).await);
    }
}
