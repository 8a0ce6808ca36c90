//! Agent capability and conflict-intent seams
//!
//! The orchestrator never talks to a model directly. It drives an opaque
//! `AgentCapability` one turn at a time inside a worktree, and asks an
//! `IntentAnalyzer` whether two conflicting branches can still coexist.

use crate::error::Result;
use crate::git::GitManager;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What a single capability turn did to the worktree.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Files were modified; `summary` becomes the commit message.
    Changed { summary: String },
    /// Files were modified and the work item is finished.
    Done { summary: String },
    /// The turn ran but touched nothing.
    NoChanges,
    /// Unrecoverable capability failure. The branch is left as-is.
    Fatal { message: String },
}

/// Everything a capability gets to see about its assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub work_item_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub branch: String,
    /// 0-based turn counter within the session.
    pub turn: u32,
}

/// An opaque coding agent. Implementations own prompting, model choice,
/// and tool use; the orchestrator only sees the per-turn outcome.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    /// A short label for logs and task records.
    fn name(&self) -> &str;

    /// Specialization tag matched against WorkItem requirements, if any.
    fn specialization(&self) -> Option<&str> {
        None
    }

    /// Run one turn inside `worktree`. The capability may read and write
    /// files freely but must not touch git state; committing is the
    /// session's job.
    async fn execute_turn(&self, ctx: &TaskContext, worktree: &Path) -> Result<TurnOutcome>;
}

/// Verdict on whether two conflicting branches pursue compatible changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum CompatibilityVerdict {
    Compatible,
    Incompatible { reason: String },
}

/// Decides whether a textual conflict between two branches is worth an
/// auto-resolution attempt or must go to a human.
pub trait IntentAnalyzer: Send + Sync {
    fn assess(
        &self,
        git: &GitManager,
        source_branch: &str,
        target_branch: &str,
        conflicting_paths: &[String],
    ) -> Result<CompatibilityVerdict>;
}

/// Default analyzer: the branches are compatible iff their changed line
/// ranges against the merge base are disjoint in every conflicting file.
/// Overlapping edits to the same lines are contradictory by definition
/// and always escalate.
pub struct DisjointRegionAnalyzer;

impl IntentAnalyzer for DisjointRegionAnalyzer {
    fn assess(
        &self,
        git: &GitManager,
        source_branch: &str,
        target_branch: &str,
        conflicting_paths: &[String],
    ) -> Result<CompatibilityVerdict> {
        let source_regions = git.changed_regions(source_branch, target_branch)?;
        let target_regions = git.changed_regions(target_branch, source_branch)?;

        for path in conflicting_paths {
            let from_source = source_regions.get(path).map(Vec::as_slice).unwrap_or(&[]);
            let from_target = target_regions.get(path).map(Vec::as_slice).unwrap_or(&[]);

            for a in from_source {
                for b in from_target {
                    if a.overlaps(b) {
                        log::debug!(
                            "[IntentAnalyzer] Overlapping edits in {} ({}..{} vs {}..{})",
                            path,
                            a.start,
                            a.end,
                            b.start,
                            b.end
                        );
                        return Ok(CompatibilityVerdict::Incompatible {
                            reason: format!(
                                "both branches edit lines {}-{} of {}",
                                a.start.max(b.start),
                                a.end.min(b.end),
                                path
                            ),
                        });
                    }
                }
            }
        }

        Ok(CompatibilityVerdict::Compatible)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::LineRange;

    #[test]
    fn test_line_range_overlap_rules() {
        let a = LineRange { start: 1, end: 5 };
        let b = LineRange { start: 5, end: 9 };
        let c = LineRange { start: 6, end: 9 };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_verdict_serialization() {
        let verdict = CompatibilityVerdict::Incompatible {
            reason: "both branches edit lines 3-3 of shared.txt".to_string(),
        };
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(json.contains("\"verdict\":\"incompatible\""));
    }
}
