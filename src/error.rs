//! Classified error kinds for the orchestration core
//!
//! Git failures are classified at the git layer boundary so callers can
//! distinguish benign outcomes (branch already exists) from fatal ones
//! (repository path invalid) without string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Invalid path or not a git repository. Fatal to team readiness.
    #[error("repository error: {0}")]
    Repository(String),

    /// The branch already exists. Benign: callers check out the existing branch.
    #[error("branch '{0}' already exists")]
    BranchExists(String),

    /// The branch is already checked out in another worktree. Benign for
    /// re-entrant acquisition, fatal if two sessions race for the same branch.
    #[error("branch '{0}' is already checked out in another worktree")]
    WorktreeConflict(String),

    /// Expected merge conflict, routed to the conflict monitor.
    #[error("merge conflict in {} file(s)", .0.len())]
    MergeConflict(Vec<String>),

    /// Per-task agent capability failure, retried per the bounded policy.
    #[error("agent capability error: {0}")]
    Capability(String),

    /// No-progress or interval overrun. Treated like a capability error.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("invalid state transition: {0}")]
    Transition(String),

    /// Internal invariant violation. A bug, not a recoverable condition;
    /// aborts the offending run with state captured for diagnosis.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Unclassified git failure.
    #[error("git error: {0}")]
    Git(String),
}

impl OrchestratorError {
    /// Transient errors qualify for the bounded retry policy; merge
    /// escalations and repository errors never do.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Timeout(_) | OrchestratorError::Git(_)
        )
    }

    /// Classify a raw git2 error, using the branch name the caller was
    /// operating on for the benign variants.
    pub fn from_git(err: git2::Error, branch: &str) -> Self {
        use git2::ErrorCode;
        match err.code() {
            ErrorCode::Exists => OrchestratorError::BranchExists(branch.to_string()),
            ErrorCode::Locked | ErrorCode::Conflict => {
                OrchestratorError::WorktreeConflict(branch.to_string())
            }
            ErrorCode::NotFound if err.message().contains("repository") => {
                OrchestratorError::Repository(err.message().to_string())
            }
            _ => OrchestratorError::Git(err.message().to_string()),
        }
    }
}

impl From<crate::models::state_machine::StateTransitionError> for OrchestratorError {
    fn from(err: crate::models::state_machine::StateTransitionError) -> Self {
        OrchestratorError::Transition(err.to_string())
    }
}

impl From<git2::Error> for OrchestratorError {
    fn from(err: git2::Error) -> Self {
        OrchestratorError::Git(err.message().to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(OrchestratorError::Timeout("no-progress".into()).is_transient());
        assert!(OrchestratorError::Git("remote hung up".into()).is_transient());
        assert!(!OrchestratorError::MergeConflict(vec!["a.rs".into()]).is_transient());
        assert!(!OrchestratorError::Repository("missing".into()).is_transient());
        assert!(!OrchestratorError::Capability("boom".into()).is_transient());
    }

    #[test]
    fn test_from_git_classifies_exists() {
        let err = git2::Error::new(
            git2::ErrorCode::Exists,
            git2::ErrorClass::Reference,
            "reference already exists",
        );
        match OrchestratorError::from_git(err, "feature-x") {
            OrchestratorError::BranchExists(name) => assert_eq!(name, "feature-x"),
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
