//! Critic review gate
//!
//! When a worker reports a task complete, a critic agent reviews the work
//! in the same worktree before the task may count as completed. The critic
//! signals its verdict with an exact marker in its output, the same
//! convention the loop engine uses for its completion promise. The
//! scheduler drives the cycle; this module owns the configuration, the
//! verdict scan, and the prompt text.

use serde::{Deserialize, Serialize};

use crate::models::Task;

/// Critic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticConfig {
    /// Fix-up rounds a rejected task gets before it is marked failed
    #[serde(
        rename = "maxIterations",
        alias = "max_iterations",
        default = "default_max_iterations"
    )]
    pub max_iterations: u32,
    /// Exact marker an approving critic must emit
    #[serde(
        rename = "approvalMarker",
        alias = "approval_marker",
        default = "default_approval_marker"
    )]
    pub approval_marker: String,
    /// Exact marker a rejecting critic must emit
    #[serde(
        rename = "rejectionMarker",
        alias = "rejection_marker",
        default = "default_rejection_marker"
    )]
    pub rejection_marker: String,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_approval_marker() -> String {
    "<verdict>APPROVED</verdict>".to_string()
}

fn default_rejection_marker() -> String {
    "<verdict>REJECTED</verdict>".to_string()
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            approval_marker: default_approval_marker(),
            rejection_marker: default_rejection_marker(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticVerdict {
    Approved,
    Rejected,
}

/// Scan buffered critic output for a verdict marker. Case-sensitive exact
/// substring match; rejection wins when both markers appear. `None` means
/// the critic produced no usable verdict, which callers count as a
/// rejection against the same budget.
pub fn parse_verdict(output: &str, config: &CriticConfig) -> Option<CriticVerdict> {
    if output.contains(&config.rejection_marker) {
        return Some(CriticVerdict::Rejected);
    }
    if output.contains(&config.approval_marker) {
        return Some(CriticVerdict::Approved);
    }
    None
}

/// Build the review prompt for one critic run. Deterministic for a given
/// task, attempt, and feedback history.
pub fn build_review_prompt(
    task: &Task,
    attempt: u32,
    prior_feedback: &[String],
    config: &CriticConfig,
) -> String {
    let feedback_section = if prior_feedback.is_empty() {
        String::new()
    } else {
        let rounds: Vec<String> = prior_feedback
            .iter()
            .enumerate()
            .map(|(i, feedback)| format!("### Round {}\n{}", i + 1, feedback))
            .collect();
        format!(
            "\n## Previous Review Feedback\n\nThe worker was asked to address this feedback. \
             Verify each point was resolved.\n\n{}\n",
            rounds.join("\n\n")
        )
    };

    format!(
        r#"# Code Review

You are the critic for a completed task. This is review round {attempt} of at most {max} for this task.

**Task**: {subject}

## Instructions

1. Inspect the changes in this worktree (`git log`, `git diff` against the branch point)
2. Judge whether the changes fully accomplish the task above
3. Check for broken code, missing tests, and unrelated modifications
4. Run the project's test suite if one exists
{feedback_section}
## Verdict

End your review with exactly one of these markers:

- `{approval}` if the work fully accomplishes the task
- `{rejection}` if it does not, followed by specific, actionable feedback the worker can fix
"#,
        attempt = attempt,
        max = config.max_iterations + 1,
        subject = task.subject,
        feedback_section = feedback_section,
        approval = config.approval_marker,
        rejection = config.rejection_marker,
    )
}

/// Build the fix-up prompt sent back to the original worker after a
/// rejection. Carries the full feedback history, oldest first.
pub fn build_fixup_prompt(task: &Task, feedback: &[String]) -> String {
    let rounds: Vec<String> = feedback
        .iter()
        .enumerate()
        .map(|(i, entry)| format!("### Round {}\n{}", i + 1, entry))
        .collect();

    format!(
        r#"# Review Feedback

Your work on the task below was reviewed and rejected. Address every point of
feedback, keep the changes in this worktree, and commit your fixes.

**Task**: {subject}

## Feedback

{rounds}

When every point is addressed, finish as you normally would.
"#,
        subject = task.subject,
        rounds = rounds.join("\n\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CriticConfig::default();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.approval_marker, "<verdict>APPROVED</verdict>");
        assert_eq!(config.rejection_marker, "<verdict>REJECTED</verdict>");
    }

    #[test]
    fn test_parse_verdict_approved() {
        let config = CriticConfig::default();
        let output = "The changes look solid.\n<verdict>APPROVED</verdict>";
        assert_eq!(
            parse_verdict(output, &config),
            Some(CriticVerdict::Approved)
        );
    }

    #[test]
    fn test_parse_verdict_rejected() {
        let config = CriticConfig::default();
        let output = "Tests are missing.\n<verdict>REJECTED</verdict>\nAdd a test for the parser.";
        assert_eq!(
            parse_verdict(output, &config),
            Some(CriticVerdict::Rejected)
        );
    }

    #[test]
    fn test_rejection_wins_when_both_markers_present() {
        let config = CriticConfig::default();
        let output = "<verdict>APPROVED</verdict> wait, no: <verdict>REJECTED</verdict>";
        assert_eq!(
            parse_verdict(output, &config),
            Some(CriticVerdict::Rejected)
        );
    }

    #[test]
    fn test_marker_match_is_case_sensitive() {
        let config = CriticConfig::default();
        assert_eq!(parse_verdict("<verdict>approved</verdict>", &config), None);
        assert_eq!(parse_verdict("no verdict here", &config), None);
    }

    #[test]
    fn test_review_prompt_contains_task_and_markers() {
        let config = CriticConfig::default();
        let task = Task::new("t1", "Implement the CSV importer");

        let prompt = build_review_prompt(&task, 1, &[], &config);
        assert!(prompt.contains("Implement the CSV importer"));
        assert!(prompt.contains("round 1 of at most 4"));
        assert!(prompt.contains("<verdict>APPROVED</verdict>"));
        assert!(prompt.contains("<verdict>REJECTED</verdict>"));
        assert!(!prompt.contains("Previous Review Feedback"));
    }

    #[test]
    fn test_review_prompt_includes_prior_feedback() {
        let config = CriticConfig::default();
        let task = Task::new("t1", "Implement the CSV importer");
        let feedback = vec!["Importer drops the header row".to_string()];

        let prompt = build_review_prompt(&task, 2, &feedback, &config);
        assert!(prompt.contains("Previous Review Feedback"));
        assert!(prompt.contains("Importer drops the header row"));
        assert!(prompt.contains("round 2 of at most 4"));
    }

    #[test]
    fn test_review_prompt_is_deterministic() {
        let config = CriticConfig::default();
        let task = Task::new("t1", "Implement the CSV importer");

        let a = build_review_prompt(&task, 1, &[], &config);
        let b = build_review_prompt(&task, 1, &[], &config);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fixup_prompt_lists_feedback_rounds() {
        let task = Task::new("t1", "Implement the CSV importer");
        let feedback = vec![
            "Header row is dropped".to_string(),
            "Quoted fields break".to_string(),
        ];

        let prompt = build_fixup_prompt(&task, &feedback);
        assert!(prompt.contains("### Round 1\nHeader row is dropped"));
        assert!(prompt.contains("### Round 2\nQuoted fields break"));
        assert!(prompt.contains("Implement the CSV importer"));
    }
}
