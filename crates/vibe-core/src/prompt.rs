//! Prompt assembly for the implementer and reviewer agents (spec Section 4.9).
//!
//! Pure string building: no IO. Callers persist the result verbatim to the
//! run directory before invoking the agent.

use crate::types::{RequestedChange, TestResult};

/// Build the implementer prompt.
///
/// On iterations after the first, `requested_changes` lists what the
/// reviewer asked for; the caller passes an empty slice on iteration 0.
pub fn implementer_prompt(task: &str, iteration: u32, requested_changes: &[RequestedChange]) -> String {
    let mut out = String::new();
    out.push_str("You are the implementer agent in an automated implement-review loop.\n\n");
    out.push_str("## Task\n\n");
    out.push_str(task.trim());
    out.push_str("\n\n");

    if iteration > 0 && !requested_changes.is_empty() {
        out.push_str(&format!(
            "## Iteration {iteration}: addressing requested changes\n\n"
        ));
        for change in requested_changes {
            out.push_str(&format!(
                "- [{}] {} (path: {}) — acceptance: {}\n",
                change.id, change.description, change.path, change.acceptance
            ));
        }
        out.push('\n');
    }

    out.push_str("## Required output\n\n");
    out.push_str("Respond with a single JSON object with exactly these fields:\n\n");
    out.push_str("1. `type`: the literal string `\"implementer\"`\n");
    out.push_str("2. `summary`: a short human-readable summary of what you changed\n");
    out.push_str("3. `commit_message`: a git commit message for your changes\n");
    out.push_str("4. `tests`: an array of `{command, result, notes?}` objects, one per test command you ran, where `result` is `pass`, `fail`, or `not_run`\n");
    out.push_str("5. `notes`: an array of free-form strings with anything else worth flagging\n\n");
    out.push_str("## Rules\n\n");
    out.push_str("- Do not run any `git` or GitHub CLI commands yourself; the engine commits, pushes, and opens the pull request for you.\n");
    out.push_str("- Output only the JSON object: no prose, no code fences, no commentary before or after it.\n");
    out
}

/// Build the reviewer prompt.
///
/// `pr_url` is `None` before a PR exists yet, in which case a placeholder
/// is shown. `diff_stat` and `budgeted_diff` are the verbatim outputs of
/// the git service's diff-stat and budgeted-diff operations.
pub fn reviewer_prompt(
    pr_url: Option<&str>,
    implementer_summary: &str,
    tests: &[TestResult],
    diff_stat: &str,
    budgeted_diff: &str,
) -> String {
    let mut out = String::new();
    out.push_str("You are the reviewer agent in an automated implement-review loop.\n\n");
    out.push_str("## Pull request\n\n");
    out.push_str(pr_url.unwrap_or("(no pull request URL yet)"));
    out.push_str("\n\n");

    out.push_str("## Implementer summary\n\n");
    out.push_str(implementer_summary.trim());
    out.push_str("\n\n");

    out.push_str("## Test results\n\n");
    if tests.is_empty() {
        out.push_str("(the implementer reported no test results)\n\n");
    } else {
        for test in tests {
            let notes = test.notes.as_deref().unwrap_or("");
            out.push_str(&format!(
                "- `{}`: {}{}\n",
                test.command,
                test.result.as_str(),
                if notes.is_empty() { String::new() } else { format!(" — {notes}") }
            ));
        }
        out.push('\n');
    }

    out.push_str("## Diff stat\n\n```\n");
    out.push_str(diff_stat.trim_end_matches('\n'));
    out.push_str("\n```\n\n");

    out.push_str("## Diff\n\n```diff\n");
    out.push_str(budgeted_diff.trim_end_matches('\n'));
    out.push_str("\n```\n\n");

    out.push_str("## Required output\n\n");
    out.push_str("Respond with a single JSON object with exactly these fields:\n\n");
    out.push_str("1. `type`: the literal string `\"reviewer\"`\n");
    out.push_str("2. `verdict`: either `\"approved\"` or `\"changes_requested\"`\n");
    out.push_str("3. `requested_changes`: an array of `{id, path, description, acceptance}` objects, in the order you want them addressed\n");
    out.push_str("4. `notes`: an array of free-form strings with anything else worth flagging\n\n");
    out.push_str("## Rules\n\n");
    out.push_str("- If `verdict` is `\"approved\"`, `requested_changes` must be an empty array.\n");
    out.push_str("- Output only the JSON object: no prose, no code fences, no commentary before or after it.\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TestOutcome;

    #[test]
    fn implementer_prompt_omits_iteration_section_on_first_pass() {
        let prompt = implementer_prompt("Add user authentication", 0, &[]);
        assert!(prompt.contains("Add user authentication"));
        assert!(!prompt.contains("addressing requested changes"));
        assert!(prompt.contains("\"implementer\""));
    }

    #[test]
    fn implementer_prompt_lists_requested_changes_on_iteration() {
        let changes = vec![RequestedChange {
            id: "C1".into(),
            path: "src/x.py".into(),
            description: "handle nil".into(),
            acceptance: "add guard".into(),
        }];
        let prompt = implementer_prompt("Add user authentication", 1, &changes);
        assert!(prompt.contains("Iteration 1"));
        assert!(prompt.contains("[C1]"));
        assert!(prompt.contains("handle nil"));
        assert!(prompt.contains("add guard"));
    }

    #[test]
    fn reviewer_prompt_uses_placeholder_when_pr_missing() {
        let prompt = reviewer_prompt(None, "did the thing", &[], "1 file changed", "diff --git a b");
        assert!(prompt.contains("no pull request URL yet"));
    }

    #[test]
    fn reviewer_prompt_includes_test_results_and_diff() {
        let tests = vec![TestResult {
            command: "cargo test".into(),
            result: TestOutcome::Pass,
            notes: Some("all green".into()),
        }];
        let prompt = reviewer_prompt(
            Some("https://example.com/pr/1"),
            "did the thing",
            &tests,
            "1 file changed, 2 insertions(+)",
            "diff --git a/x b/x",
        );
        assert!(prompt.contains("https://example.com/pr/1"));
        assert!(prompt.contains("cargo test"));
        assert!(prompt.contains("all green"));
        assert!(prompt.contains("1 file changed, 2 insertions(+)"));
        assert!(prompt.contains("diff --git a/x b/x"));
        assert!(prompt.contains("requested_changes"));
    }
}
