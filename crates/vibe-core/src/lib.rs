pub mod config;
pub mod events;
pub mod ids;
pub mod prompt;
pub mod types;

pub use config::{DiffBudget, EngineConfig};
pub use events::{Event, EventKind};
pub use ids::{branch_name, derive_slug, Clock, OsRandomSource, RandomSource, RunId, SystemClock};
pub use types::{
    AgentKind, Artifacts, ImplementerOutput, RequestedChange, ReviewerOutput, Run, RunState,
    TestOutcome, TestResult, Verdict,
};
