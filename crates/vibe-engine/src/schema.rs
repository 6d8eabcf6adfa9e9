//! Schema validator and repair-prompt builder (spec Section 4.5).
//!
//! Two JSON Schemas (draft 2020-12) are fixed: one per agent role. Both
//! forbid extra properties and pin `type` to a role-specific constant.

use std::sync::OnceLock;

use jsonschema::{Draft, JSONSchema};
use vibe_core::{ImplementerOutput, ReviewerOutput, Verdict};

/// Carries enough to build a repair prompt: the raw text that failed and
/// a human-readable reason.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub raw: String,
    pub message: String,
}

fn implementer_schema_value() -> serde_json::Value {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "summary", "commit_message", "tests", "notes"],
        "properties": {
            "type": { "const": "implementer" },
            "summary": { "type": "string" },
            "commit_message": { "type": "string" },
            "tests": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["command", "result"],
                    "properties": {
                        "command": { "type": "string" },
                        "result": { "enum": ["pass", "fail", "not_run"] },
                        "notes": { "type": "string" }
                    }
                }
            },
            "notes": { "type": "array", "items": { "type": "string" } }
        }
    })
}

fn reviewer_schema_value() -> serde_json::Value {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "verdict", "requested_changes", "notes"],
        "properties": {
            "type": { "const": "reviewer" },
            "verdict": { "enum": ["approved", "changes_requested"] },
            "requested_changes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["id", "path", "description", "acceptance"],
                    "properties": {
                        "id": { "type": "string" },
                        "path": { "type": "string" },
                        "description": { "type": "string" },
                        "acceptance": { "type": "string" }
                    }
                }
            },
            "notes": { "type": "array", "items": { "type": "string" } }
        }
    })
}

/// The implementer output schema, as pretty JSON, persisted verbatim to
/// `schemas/implementer.json`.
pub fn implementer_schema() -> serde_json::Value {
    implementer_schema_value()
}

/// The reviewer output schema, as pretty JSON, persisted verbatim to
/// `schemas/reviewer.json`.
pub fn reviewer_schema() -> serde_json::Value {
    reviewer_schema_value()
}

fn compiled_implementer_schema() -> &'static JSONSchema {
    static SCHEMA: OnceLock<JSONSchema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(&implementer_schema_value())
            .expect("implementer schema is valid")
    })
}

fn compiled_reviewer_schema() -> &'static JSONSchema {
    static SCHEMA: OnceLock<JSONSchema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(&reviewer_schema_value())
            .expect("reviewer schema is valid")
    })
}

pub fn validate_implementer_output(raw: &str) -> Result<ImplementerOutput, ValidationFailure> {
    let instance: serde_json::Value = serde_json::from_str(raw).map_err(|e| ValidationFailure {
        raw: raw.to_string(),
        message: format!("invalid JSON: {e}"),
    })?;
    let schema = compiled_implementer_schema();
    if let Err(errors) = schema.validate(&instance) {
        return Err(ValidationFailure {
            raw: raw.to_string(),
            message: errors.map(|e| format!("{e} at {}", e.instance_path)).collect::<Vec<_>>().join("; "),
        });
    }
    serde_json::from_value(instance).map_err(|e| ValidationFailure {
        raw: raw.to_string(),
        message: format!("schema-valid but could not deserialize: {e}"),
    })
}

pub fn validate_reviewer_output(raw: &str) -> Result<ReviewerOutput, ValidationFailure> {
    let instance: serde_json::Value = serde_json::from_str(raw).map_err(|e| ValidationFailure {
        raw: raw.to_string(),
        message: format!("invalid JSON: {e}"),
    })?;
    let schema = compiled_reviewer_schema();
    if let Err(errors) = schema.validate(&instance) {
        return Err(ValidationFailure {
            raw: raw.to_string(),
            message: errors.map(|e| format!("{e} at {}", e.instance_path)).collect::<Vec<_>>().join("; "),
        });
    }
    let output: ReviewerOutput = serde_json::from_value(instance).map_err(|e| ValidationFailure {
        raw: raw.to_string(),
        message: format!("schema-valid but could not deserialize: {e}"),
    })?;

    // Cross-field rule (spec Section 4.5): approved implies no requested changes.
    if output.verdict == Verdict::Approved && !output.requested_changes.is_empty() {
        return Err(ValidationFailure {
            raw: raw.to_string(),
            message: "verdict is approved but requested_changes is non-empty".to_string(),
        });
    }
    Ok(output)
}

/// Fixed-shape repair prompt (spec Section 4.5): schema, raw invalid
/// output, and the validation error, asking for corrected JSON only.
pub fn repair_prompt(schema: &serde_json::Value, failure: &ValidationFailure) -> String {
    let schema_pretty = serde_json::to_string_pretty(schema).unwrap_or_default();
    format!(
        "Your previous response did not match the required JSON schema.\n\n\
         ## Schema\n\n```json\n{schema_pretty}\n```\n\n\
         ## Your previous output\n\n```\n{}\n```\n\n\
         ## Validation error\n\n{}\n\n\
         Respond again with only the corrected JSON object: no prose, no code fences, no commentary.",
        failure.raw, failure.message,
    )
}
