//! Git data types and structures
//!
//! Contains all shared types used across git operations

use serde::{Deserialize, Serialize};

/// Represents a git branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub is_head: bool,
    pub commit_id: String,
}

/// Represents a git commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    pub short_id: String,
    pub message: String,
    pub author: String,
    pub email: String,
    pub timestamp: i64,
    pub parent_ids: Vec<String>,
}

/// Represents a git worktree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: String,
    pub branch: Option<String>,
    pub is_locked: bool,
}

/// Represents a diff between commits/branches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffInfo {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
    pub files: Vec<FileDiff>,
}

impl DiffInfo {
    /// Diffstat summary kept on escalated conflict records.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} file(s) changed, +{} -{}",
            self.files_changed, self.insertions, self.deletions
        );
        for file in &self.files {
            if let Some(path) = file.new_path.as_ref().or(file.old_path.as_ref()) {
                out.push_str(&format!("\n  {} {}", file.status, path));
            }
        }
        out
    }
}

/// Represents a single file's diff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub status: String,
}

/// Inclusive line range in merge-base coordinates, taken from a diff hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn overlaps(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Result of a side-effect-free merge check between two branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeCheck {
    pub clean: bool,
    pub conflicting_paths: Vec<String>,
}

/// Result of an actual merge into the target branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Id of the resulting commit; the source head on fast-forward.
    pub commit_id: String,
    pub fast_forward: bool,
    /// True when the target already contained the source.
    pub already_up_to_date: bool,
}

/// Result of a stage-all commit attempt in a worktree.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Created(CommitInfo),
    /// The worktree had no changes; not an error.
    NothingToCommit,
}

impl CommitOutcome {
    pub fn commit(&self) -> Option<&CommitInfo> {
        match self {
            CommitOutcome::Created(info) => Some(info),
            CommitOutcome::NothingToCommit => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_range_overlap() {
        let a = LineRange { start: 1, end: 5 };
        let b = LineRange { start: 5, end: 9 };
        let c = LineRange { start: 6, end: 9 };
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_diff_summary_includes_paths() {
        let diff = DiffInfo {
            files_changed: 1,
            insertions: 3,
            deletions: 1,
            files: vec![FileDiff {
                old_path: Some("src/lib.rs".into()),
                new_path: Some("src/lib.rs".into()),
                status: "modified".into(),
            }],
        };
        let summary = diff.summary();
        assert!(summary.contains("+3 -1"));
        assert!(summary.contains("src/lib.rs"));
    }
}
