// Status state machines with transition validation
//
// Work item transitions are monotonic: once an item moves forward along
// queued -> in_progress -> pr_ready -> completed it never moves backward.
// Cancelled is reachable from queued or in_progress only; blocked also
// from pr_ready, for merge conflicts escalated after the session finished.

use super::{RunStatus, RunTaskStatus, TeamStatus, WorkItemStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Invalid work item transition from {from:?} to {to:?}")]
    InvalidWorkItemTransition {
        from: WorkItemStatus,
        to: WorkItemStatus,
    },

    #[error("Invalid run task transition from {from:?} to {to:?}")]
    InvalidRunTaskTransition {
        from: RunTaskStatus,
        to: RunTaskStatus,
    },

    #[error("Invalid run transition from {from:?} to {to:?}")]
    InvalidRunTransition { from: RunStatus, to: RunStatus },

    #[error("Invalid team transition from {from:?} to {to:?}")]
    InvalidTeamTransition { from: TeamStatus, to: TeamStatus },
}

/// Validates if a work item can transition from one status to another.
pub fn work_item_can_transition(from: WorkItemStatus, to: WorkItemStatus) -> bool {
    use WorkItemStatus::*;
    match (from, to) {
        // Forward path
        (Queued, InProgress) => true,
        (InProgress, PrReady) => true,
        (PrReady, Completed) => true,

        // Blocked covers escalated merge conflicts too, which surface
        // after the item already reached pr_ready
        (Queued, Blocked) | (InProgress, Blocked) | (PrReady, Blocked) => true,
        (Queued, Cancelled) | (InProgress, Cancelled) => true,

        // A blocked item re-enters the queue once unblocked
        (Blocked, Queued) => true,

        // Same state is a no-op
        (a, b) if a == b => true,

        _ => false,
    }
}

pub fn transition_work_item(
    current: WorkItemStatus,
    target: WorkItemStatus,
) -> Result<WorkItemStatus, StateTransitionError> {
    if !work_item_can_transition(current, target) {
        return Err(StateTransitionError::InvalidWorkItemTransition {
            from: current,
            to: target,
        });
    }
    Ok(target)
}

pub fn work_item_is_terminal(status: WorkItemStatus) -> bool {
    matches!(status, WorkItemStatus::Completed | WorkItemStatus::Cancelled)
}

/// Validates run task transitions, including the bounded retry path
/// failed -> retrying -> running.
pub fn run_task_can_transition(from: RunTaskStatus, to: RunTaskStatus) -> bool {
    use RunTaskStatus::*;
    match (from, to) {
        (Pending, Running) => true,
        (Running, Completed) => true,
        (Running, Failed) => true,
        (Failed, Retrying) => true,
        (Retrying, Running) => true,
        (a, b) if a == b => true,
        _ => false,
    }
}

pub fn transition_run_task(
    current: RunTaskStatus,
    target: RunTaskStatus,
) -> Result<RunTaskStatus, StateTransitionError> {
    if !run_task_can_transition(current, target) {
        return Err(StateTransitionError::InvalidRunTaskTransition {
            from: current,
            to: target,
        });
    }
    Ok(target)
}

pub fn run_task_is_terminal(status: RunTaskStatus) -> bool {
    matches!(status, RunTaskStatus::Completed | RunTaskStatus::Failed)
}

/// Validates run transitions. Cancellation is allowed from any state prior
/// to completed/failed.
pub fn run_can_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    match (from, to) {
        (Pending, Running) => true,
        (Running, Merging) => true,
        (Running, Completed) => true, // nothing left to merge
        (Merging, Completed) => true,
        (Running, Failed) | (Merging, Failed) | (Pending, Failed) => true,
        (Pending, Cancelled) | (Running, Cancelled) | (Merging, Cancelled) => true,
        (a, b) if a == b => true,
        _ => false,
    }
}

pub fn transition_run(
    current: RunStatus,
    target: RunStatus,
) -> Result<RunStatus, StateTransitionError> {
    if !run_can_transition(current, target) {
        return Err(StateTransitionError::InvalidRunTransition {
            from: current,
            to: target,
        });
    }
    Ok(target)
}

pub fn run_is_terminal(status: RunStatus) -> bool {
    matches!(
        status,
        RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
    )
}

/// Validates team lifecycle transitions. Error is reachable from any state
/// on infrastructure failure and only leaves via explicit operator reset to
/// stopped.
pub fn team_can_transition(from: TeamStatus, to: TeamStatus) -> bool {
    use TeamStatus::*;
    match (from, to) {
        (Stopped, Active) => true,
        (Active, Paused) => true,
        (Paused, Active) => true,
        (Active, Stopped) | (Paused, Stopped) => true,
        (_, Error) => true,
        (Error, Stopped) => true, // operator reset
        (a, b) if a == b => true,
        _ => false,
    }
}

pub fn transition_team(
    current: TeamStatus,
    target: TeamStatus,
) -> Result<TeamStatus, StateTransitionError> {
    if !team_can_transition(current, target) {
        return Err(StateTransitionError::InvalidTeamTransition {
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
    fn test_work_item_forward_path() {
        use WorkItemStatus::*;
        assert!(work_item_can_transition(Queued, InProgress));
        assert!(work_item_can_transition(InProgress, PrReady));
        assert!(work_item_can_transition(PrReady, Completed));
    }

    #[test]
    fn test_work_item_is_monotonic() {
        use WorkItemStatus::*;
        // Completed never reopens
        assert!(!work_item_can_transition(Completed, InProgress));
        assert!(!work_item_can_transition(Completed, Queued));
        assert!(!work_item_can_transition(PrReady, InProgress));
        assert!(!work_item_can_transition(InProgress, Queued));
        // No skipping forward either
        assert!(!work_item_can_transition(Queued, PrReady));
        assert!(!work_item_can_transition(Queued, Completed));
    }

    #[test]
    fn test_work_item_blocked_and_cancelled_sources() {
        use WorkItemStatus::*;
        assert!(work_item_can_transition(Queued, Blocked));
        assert!(work_item_can_transition(InProgress, Blocked));
        // A conflict escalated after the session finished blocks the item
        assert!(work_item_can_transition(PrReady, Blocked));
        assert!(work_item_can_transition(Queued, Cancelled));
        assert!(work_item_can_transition(InProgress, Cancelled));
        assert!(!work_item_can_transition(PrReady, Cancelled));
        assert!(!work_item_can_transition(Completed, Blocked));
        assert!(!work_item_can_transition(Completed, Cancelled));
        // Unblocking re-queues
        assert!(work_item_can_transition(Blocked, Queued));
        assert!(!work_item_can_transition(Blocked, InProgress));
    }

    #[test]
    fn test_transition_work_item_rejects_invalid() {
        let result = transition_work_item(WorkItemStatus::Completed, WorkItemStatus::InProgress);
        assert!(result.is_err());
        let ok = transition_work_item(WorkItemStatus::Queued, WorkItemStatus::InProgress);
        assert_eq!(ok.unwrap(), WorkItemStatus::InProgress);
    }

    #[test]
    fn test_run_task_retry_path() {
        use RunTaskStatus::*;
        assert!(run_task_can_transition(Pending, Running));
        assert!(run_task_can_transition(Running, Failed));
        assert!(run_task_can_transition(Failed, Retrying));
        assert!(run_task_can_transition(Retrying, Running));
        assert!(!run_task_can_transition(Completed, Running));
        assert!(!run_task_can_transition(Failed, Running)); // must go through retrying
        assert!(!run_task_can_transition(Pending, Completed));
    }

    #[test]
    fn test_run_transitions() {
        use RunStatus::*;
        assert!(run_can_transition(Pending, Running));
        assert!(run_can_transition(Running, Merging));
        assert!(run_can_transition(Merging, Completed));
        assert!(run_can_transition(Running, Cancelled));
        assert!(!run_can_transition(Completed, Running));
        assert!(!run_can_transition(Completed, Cancelled));
        assert!(!run_can_transition(Failed, Cancelled));
    }

    #[test]
    fn test_team_transitions() {
        use TeamStatus::*;
        assert!(team_can_transition(Stopped, Active));
        assert!(team_can_transition(Active, Paused));
        assert!(team_can_transition(Paused, Active));
        assert!(team_can_transition(Active, Stopped));
        assert!(team_can_transition(Paused, Error));
        assert!(team_can_transition(Error, Stopped));
        assert!(!team_can_transition(Error, Active));
        assert!(!team_can_transition(Stopped, Paused));
    }

    #[test]
    fn test_terminal_states() {
        assert!(work_item_is_terminal(WorkItemStatus::Completed));
        assert!(work_item_is_terminal(WorkItemStatus::Cancelled));
        assert!(!work_item_is_terminal(WorkItemStatus::Blocked));
        assert!(run_task_is_terminal(RunTaskStatus::Failed));
        assert!(!run_task_is_terminal(RunTaskStatus::Retrying));
        assert!(run_is_terminal(RunStatus::Cancelled));
        assert!(!run_is_terminal(RunStatus::Merging));
    }
}
