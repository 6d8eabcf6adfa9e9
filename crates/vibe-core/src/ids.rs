//! Identifier generation for runs.
//!
//! Implements the run id format and slug derivation from spec Section 4.8.
//! Time and randomness are injected (see Design Notes: "Global mutable clock
//! and random source") so identifier generation stays deterministic in tests.

use chrono::{DateTime, Utc};

/// Source of the current time, injected so tests can pin it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of randomness, injected so tests can pin it.
pub trait RandomSource: Send + Sync {
    /// Returns 32 fresh random bits.
    fn next_u32(&self) -> u32;
}

/// `rand`-backed implementation of [`RandomSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandomSource;

impl RandomSource for OsRandomSource {
    fn next_u32(&self) -> u32 {
        rand::random()
    }
}

/// A run identifier in the form `YYYYMMDD-HHMMSS-<8 lowercase hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a new run id from the given clock and random source.
    pub fn generate(clock: &dyn Clock, random: &dyn RandomSource) -> Self {
        let now = clock.now();
        let bits = random.next_u32();
        Self(format!("{}-{:08x}", now.format("%Y%m%d-%H%M%S"), bits))
    }

    /// Wrap an existing string as a run id without validation (used by
    /// loaders restoring a run from disk).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Maximum length of a derived slug.
const SLUG_MAX_LEN: usize = 24;

/// Derive a branch-safe slug from a human task description.
///
/// Takes the first line, lowercases it, collapses every maximal run of
/// non `[a-z0-9]` characters to a single `-`, trims leading/trailing `-`,
/// truncates to [`SLUG_MAX_LEN`] characters, and trims a trailing `-`
/// that truncation may have introduced. Falls back to `"task"` if the
/// result is empty.
pub fn derive_slug(task: &str) -> String {
    let first_line = task.lines().next().unwrap_or("");
    let lowered = first_line.to_lowercase();

    let mut slug = String::with_capacity(lowered.len());
    let mut last_was_sep = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('-');
            last_was_sep = true;
        }
    }

    let trimmed = slug.trim_matches('-');
    let truncated = if trimmed.len() > SLUG_MAX_LEN {
        trimmed[..SLUG_MAX_LEN].trim_end_matches('-')
    } else {
        trimmed
    };

    if truncated.is_empty() {
        "task".to_string()
    } else {
        truncated.to_string()
    }
}

/// Branch name for a run, per invariant I3: `agent/<run_id>-<slug>`.
pub fn branch_name(run_id: &RunId, slug: &str) -> String {
    format!("agent/{run_id}-{slug}")
}
