//! Agent driver (spec Section 4.6, Section 6 "Agent invocations").
//!
//! Polymorphic over the two CLI contracts an agent binary may speak:
//! `JsonFlag` takes the schema inline via a flag and returns a JSON
//! envelope on stdout; `SchemaFile` takes a schema-file path and an
//! output-file path, reading the prompt from stdin.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use vibe_core::AgentKind;

use crate::process::{run_process, CancelListener, ProcessSpec, StreamKind};
use crate::schema::{repair_prompt, ValidationFailure};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent exited {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },
    #[error("agent output invalid after repair: {message}")]
    InvalidAfterRepair { raw: String, message: String },
    #[error("process error: {0}")]
    Process(#[from] crate::process::ProcessError),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// What to run and how to build/extract for one [`AgentKind`].
#[derive(Debug, Clone)]
pub struct AgentDriver {
    pub kind: AgentKind,
    pub executable: String,
    pub timeout: Duration,
}

impl AgentDriver {
    pub fn new(kind: AgentKind, executable: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kind,
            executable: executable.into(),
            timeout,
        }
    }

    pub fn default_executable(kind: AgentKind) -> &'static str {
        match kind {
            AgentKind::JsonFlag => "agent-json",
            AgentKind::SchemaFile => "agent-schema",
        }
    }

    fn build_command(&self, prompt: &str, schema: &serde_json::Value, schema_path: &Path, output_path: &Path) -> ProcessSpec {
        match self.kind {
            AgentKind::JsonFlag => {
                let schema_str = serde_json::to_string(schema).unwrap_or_default();
                ProcessSpec::new(vec![
                    self.executable.clone(),
                    "-p".to_string(),
                    prompt.to_string(),
                    "--output-format".to_string(),
                    "json".to_string(),
                    "--json-schema".to_string(),
                    schema_str,
                ])
            }
            AgentKind::SchemaFile => ProcessSpec::new(vec![
                self.executable.clone(),
                "exec".to_string(),
                "--full-auto".to_string(),
                "--output-schema".to_string(),
                schema_path.to_string_lossy().to_string(),
                "--output-last-message".to_string(),
                output_path.to_string_lossy().to_string(),
                "-".to_string(),
            ])
            .with_stdin(prompt.to_string()),
        }
    }

    /// `(stdout, stderr, output_path) -> raw_output_string` (spec Section 4.6).
    async fn extract_output(&self, stdout: &str, output_path: &Path) -> String {
        match self.kind {
            AgentKind::JsonFlag => extract_json_flag_envelope(stdout),
            AgentKind::SchemaFile => match tokio::fs::read_to_string(output_path).await {
                Ok(contents) if !contents.trim().is_empty() => contents,
                _ => stdout.to_string(),
            },
        }
    }
}

/// Parses `{"structured_output": <object-or-string>}` and re-serialises the
/// inner value; falls back to the raw stdout if the envelope is absent or
/// malformed.
fn extract_json_flag_envelope(stdout: &str) -> String {
    let Ok(envelope) = serde_json::from_str::<serde_json::Value>(stdout) else {
        return stdout.to_string();
    };
    match envelope.get("structured_output") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(value @ serde_json::Value::Object(_)) => serde_json::to_string(value).unwrap_or_else(|_| stdout.to_string()),
        _ => stdout.to_string(),
    }
}

/// Outcome of a completed (possibly repaired) agent invocation.
pub struct AgentRunOutcome<T> {
    pub parsed: T,
    pub raw: String,
    pub repaired: bool,
    /// The first attempt's validation failure, present iff `repaired`.
    pub first_failure: Option<ValidationFailure>,
}

/// Run protocol (spec Section 4.6): build, run, extract, validate, and on
/// failure run the repair prompt exactly once more before giving up.
pub async fn run_agent<T, V, L>(
    driver: &AgentDriver,
    prompt: &str,
    schema: &serde_json::Value,
    schema_path: &Path,
    output_path: &Path,
    cancel: CancelListener,
    on_line: L,
    validate: V,
) -> Result<AgentRunOutcome<T>>
where
    V: Fn(&str) -> std::result::Result<T, ValidationFailure>,
    L: Fn(StreamKind, &str) + Send + Clone + 'static,
{
    let first = attempt(driver, prompt, schema, schema_path, output_path, cancel.clone(), on_line.clone(), &validate).await?;
    let first_failure = match first {
        Attempt::Valid { raw, parsed } => {
            return Ok(AgentRunOutcome {
                parsed,
                raw,
                repaired: false,
                first_failure: None,
            });
        }
        Attempt::Invalid(failure) => failure,
    };

    let repair = repair_prompt(schema, &first_failure);
    let second = attempt(driver, &repair, schema, schema_path, output_path, cancel, on_line, &validate).await?;
    match second {
        Attempt::Valid { raw, parsed } => Ok(AgentRunOutcome {
            parsed,
            raw,
            repaired: true,
            first_failure: Some(first_failure),
        }),
        Attempt::Invalid(second_failure) => Err(AgentError::InvalidAfterRepair {
            raw: second_failure.raw,
            message: second_failure.message,
        }),
    }
}

enum Attempt<T> {
    Valid { raw: String, parsed: T },
    Invalid(ValidationFailure),
}

async fn attempt<T, V, L>(
    driver: &AgentDriver,
    prompt: &str,
    schema: &serde_json::Value,
    schema_path: &Path,
    output_path: &Path,
    cancel: CancelListener,
    on_line: L,
    validate: &V,
) -> Result<Attempt<T>>
where
    V: Fn(&str) -> std::result::Result<T, ValidationFailure>,
    L: Fn(StreamKind, &str) + Send + 'static,
{
    let spec = driver.build_command(prompt, schema, schema_path, output_path);
    let outcome = run_process(spec, driver.timeout, cancel, move |stream, line| on_line(stream, line)).await?;
    if outcome.timed_out {
        return Err(AgentError::Timeout(driver.timeout));
    }
    if outcome.exit_code != 0 {
        return Err(AgentError::NonZeroExit {
            exit_code: outcome.exit_code,
            stderr: outcome.stderr,
        });
    }
    let raw = driver.extract_output(&outcome.stdout, output_path).await;
    match validate(&raw) {
        Ok(parsed) => Ok(Attempt::Valid { raw, parsed }),
        Err(failure) => Ok(Attempt::Invalid(failure)),
    }
}
