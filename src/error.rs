// Engine error kinds shared across modules

use thiserror::Error;

/// Errors surfaced by the orchestration engine.
///
/// Task-scoped errors (agent failure, VCS failure, critic exhaustion) mark
/// the affected task `failed` and never abort the plan's scheduler loop.
/// Plan-scoped errors (persistence) halt the loop with a `failed` plan.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Cyclic or dangling dependency detected while building the graph.
    /// Fatal to the build call only.
    #[error("Malformed dependency graph: {0}")]
    MalformedGraph(String),

    /// Worktree reuse or double-release. Acquire conflicts are hard errors;
    /// release conflicts are logged and treated as no-ops by the caller.
    #[error("Worktree conflict for task {task_id}: {reason}")]
    WorktreeConflict { task_id: String, reason: String },

    /// A worker reported failure or its process crashed.
    #[error("Agent failure on task {task_id}: {message}")]
    AgentFailure { task_id: String, message: String },

    /// The critic rejected a task more times than the configured budget.
    #[error("Critic iteration budget ({max_iterations}) exhausted for task {task_id}")]
    CriticIterationExhausted { task_id: String, max_iterations: u32 },

    /// A worker did not acknowledge a stop request within the grace period.
    /// Surfaced as a warning; cleanup proceeds regardless.
    #[error("Worker for task {task_id} did not acknowledge stop within {grace_secs}s")]
    TimeoutOnCancel { task_id: String, grace_secs: u64 },

    /// Durable storage failed. Plan-scoped and fatal to the scheduler loop.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A version-control operation failed. Task-scoped: the affected task
    /// becomes `failed`, the engine never crashes on VCS errors.
    #[error("Git operation failed: {0}")]
    Vcs(String),
}

impl EngineError {
    pub fn vcs(err: git2::Error) -> Self {
        EngineError::Vcs(err.message().to_string())
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        EngineError::Persistence(format!("{:#}", err))
    }

    /// True for errors that fail the owning plan rather than a single task.
    pub fn is_plan_fatal(&self) -> bool {
        matches!(self, EngineError::Persistence(_))
    }
}

impl From<git2::Error> for EngineError {
    fn from(err: git2::Error) -> Self {
        EngineError::vcs(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::MalformedGraph("cycle involving task a".to_string());
        assert_eq!(
            err.to_string(),
            "Malformed dependency graph: cycle involving task a"
        );

        let err = EngineError::CriticIterationExhausted {
            task_id: "t1".to_string(),
            max_iterations: 3,
        };
        assert!(err.to_string().contains("t1"));
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn test_plan_fatal_classification() {
        assert!(EngineError::Persistence("disk full".to_string()).is_plan_fatal());
        assert!(!EngineError::Vcs("merge failed".to_string()).is_plan_fatal());
        assert!(!EngineError::AgentFailure {
            task_id: "t1".to_string(),
            message: "crashed".to_string(),
        }
        .is_plan_fatal());
    }
}
