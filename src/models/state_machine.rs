// Plan status state machine with validation

use super::PlanStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Invalid plan transition from {from:?} to {to:?}")]
    InvalidTransition { from: PlanStatus, to: PlanStatus },
}

/// Validates if a plan can transition from one status to another
pub fn can_transition(from: PlanStatus, to: PlanStatus) -> bool {
    match (from, to) {
        // Drafting and discussion chain
        (PlanStatus::Draft, PlanStatus::Discussing) => true,
        (PlanStatus::Discussing, PlanStatus::Discussed) => true,
        (PlanStatus::Discussed, PlanStatus::Delegating) => true,

        // Execution
        (PlanStatus::Delegating, PlanStatus::InProgress) => true,
        // A plan with no tasks is reviewable immediately
        (PlanStatus::Delegating, PlanStatus::ReadyForReview) => true,
        (PlanStatus::Delegating, PlanStatus::Failed) => true,
        (PlanStatus::Delegating, PlanStatus::Cancelled) => true,
        (PlanStatus::InProgress, PlanStatus::ReadyForReview) => true,
        (PlanStatus::InProgress, PlanStatus::Failed) => true,
        (PlanStatus::InProgress, PlanStatus::Cancelled) => true,

        // User acceptance
        (PlanStatus::ReadyForReview, PlanStatus::Completed) => true,

        // Restart resets the whole plan back to delegation
        (PlanStatus::Failed, PlanStatus::Delegating) => true,
        (PlanStatus::Cancelled, PlanStatus::Delegating) => true,

        // Same state is always allowed (no-op)
        (a, b) if a == b => true,

        // All other transitions are invalid
        _ => false,
    }
}

/// Validates and performs a plan status transition
pub fn transition_plan(
    current: PlanStatus,
    target: PlanStatus,
) -> Result<PlanStatus, StateTransitionError> {
    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discussion_chain() {
        assert!(can_transition(PlanStatus::Draft, PlanStatus::Discussing));
        assert!(can_transition(PlanStatus::Discussing, PlanStatus::Discussed));
        assert!(can_transition(PlanStatus::Discussed, PlanStatus::Delegating));
    }

    #[test]
    fn test_execution_transitions() {
        assert!(can_transition(PlanStatus::Delegating, PlanStatus::InProgress));
        assert!(can_transition(
            PlanStatus::InProgress,
            PlanStatus::ReadyForReview
        ));
        assert!(can_transition(PlanStatus::InProgress, PlanStatus::Failed));
    }

    #[test]
    fn test_cancellation_from_executing_states() {
        assert!(can_transition(PlanStatus::Delegating, PlanStatus::Cancelled));
        assert!(can_transition(PlanStatus::InProgress, PlanStatus::Cancelled));
        assert!(!can_transition(PlanStatus::Draft, PlanStatus::Cancelled));
        assert!(!can_transition(
            PlanStatus::ReadyForReview,
            PlanStatus::Cancelled
        ));
    }

    #[test]
    fn test_review_acceptance() {
        assert!(can_transition(
            PlanStatus::ReadyForReview,
            PlanStatus::Completed
        ));
        let result = transition_plan(PlanStatus::ReadyForReview, PlanStatus::Completed);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), PlanStatus::Completed);
    }

    #[test]
    fn test_restart_from_terminal_failures() {
        assert!(can_transition(PlanStatus::Failed, PlanStatus::Delegating));
        assert!(can_transition(PlanStatus::Cancelled, PlanStatus::Delegating));
        assert!(!can_transition(PlanStatus::Completed, PlanStatus::Delegating));
    }

    #[test]
    fn test_cannot_skip_discussion() {
        assert!(!can_transition(PlanStatus::Draft, PlanStatus::Delegating));
        assert!(!can_transition(PlanStatus::Draft, PlanStatus::InProgress));
        assert!(!can_transition(PlanStatus::Discussing, PlanStatus::InProgress));
    }

    #[test]
    fn test_same_state_allowed() {
        assert!(can_transition(PlanStatus::InProgress, PlanStatus::InProgress));
        assert!(can_transition(PlanStatus::Draft, PlanStatus::Draft));
    }

    #[test]
    fn test_invalid_transition_error() {
        let result = transition_plan(PlanStatus::Draft, PlanStatus::Completed);
        assert!(result.is_err());
        let message = result.unwrap_err().to_string();
        assert!(message.contains("Draft"));
        assert!(message.contains("Completed"));
    }
}
