//! Services and orchestration engine: everything with IO.
//!
//! [`vibe_core`] holds the pure data model; this crate wires it to git,
//! GitHub, subprocesses, and disk.

pub mod agent;
pub mod engine;
pub mod git;
pub mod github;
pub mod persistence;
pub mod process;
pub mod registry;
pub mod schema;

pub use agent::{AgentDriver, AgentError, AgentRunOutcome};
pub use engine::{Engine, EngineError, ImplementerAgent, RealImplementerAgent, RealReviewerAgent, ReviewerAgent};
pub use git::{GitError, GitService};
pub use github::{GhCliGitHubService, GitHubError, GitHubService};
pub use persistence::{RunPaths, StorageError};
pub use process::{CancelHandle, CancelListener, ProcessError, ProcessOutcome, ProcessSpec, StreamKind};
pub use registry::RegistryError;
pub use schema::ValidationFailure;
