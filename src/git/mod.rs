//! Git operations using git2-rs
//!
//! Every operation here is atomic with respect to the repository: it either
//! fully succeeds and returns the resulting ref/commit, or fails with a
//! classified error and leaves the repository unchanged from the caller's
//! perspective. Organized into focused submodules:
//! - `manager` - Core GitManager struct and repository access
//! - `branches` - Branch operations (create, delete, list, checkout, history)
//! - `worktrees` - Worktree management (add, remove, prune)
//! - `commits` - Stage-all commits, diffs, changed regions, push
//! - `merge` - Merge checks, merges, union-favor resolution
//! - `types` - Shared data structures

// Submodules
mod branches;
mod commits;
mod manager;
mod merge;
mod types;
mod worktrees;

pub use manager::GitManager;

pub use types::{
    BranchInfo, CommitInfo, CommitOutcome, DiffInfo, FileDiff, LineRange, MergeCheck, MergeOutcome,
    WorktreeInfo,
};
