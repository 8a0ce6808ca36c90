//! Merge and conflict handling for GitManager
//!
//! Merge checks are tree-level (`merge_trees` on the merge base) so they
//! never touch the working directory or repository history. Actual merges
//! are ref-level: a fast-forward or a merge commit written directly onto
//! the target branch, with the main checkout synced only when HEAD points
//! at the target.

use git2::{build::CheckoutBuilder, MergeOptions};

use crate::error::{OrchestratorError, Result};
use crate::git::types::{MergeCheck, MergeOutcome};
use crate::git::GitManager;

impl GitManager {
    /// Check whether `source` merges cleanly into `target`.
    ///
    /// Side-effect-free and idempotent: repeated calls yield the same
    /// conflict set and the target's head commit is unchanged.
    pub fn test_merge(&self, source: &str, target: &str) -> Result<MergeCheck> {
        let index = self.merged_index(source, target, None)?;
        let conflicting_paths = conflict_paths(&index)?;

        Ok(MergeCheck {
            clean: conflicting_paths.is_empty(),
            conflicting_paths,
        })
    }

    /// Merge `source` into `target`: fast-forward when possible, otherwise a
    /// merge commit. Fails with `MergeConflict(paths)` when `test_merge`
    /// reports conflicts, leaving the repository untouched.
    pub fn merge(&self, source: &str, target: &str) -> Result<MergeOutcome> {
        let check = self.test_merge(source, target)?;
        if !check.clean {
            log::warn!(
                "[GitManager] Merge {} -> {} has conflicts: {:?}",
                source,
                target,
                check.conflicting_paths
            );
            return Err(OrchestratorError::MergeConflict(check.conflicting_paths));
        }

        let source_tip = self.branch_tip(source)?;
        let target_tip = self.branch_tip(target)?;
        let merge_base = self.repo.merge_base(source_tip, target_tip)?;

        if merge_base == source_tip {
            log::info!("[GitManager] {} already contains {}", target, source);
            return Ok(MergeOutcome {
                commit_id: target_tip.to_string(),
                fast_forward: false,
                already_up_to_date: true,
            });
        }

        if merge_base == target_tip {
            // Fast-forward: move the target ref to the source tip
            let ref_name = format!("refs/heads/{}", target);
            let mut target_ref = self.repo.find_reference(&ref_name)?;
            target_ref.set_target(
                source_tip,
                &format!("Fast-forward merge {} into {}", source, target),
            )?;
            self.sync_head_checkout(target)?;

            log::info!("[GitManager] Fast-forward merged {} into {}", source, target);
            return Ok(MergeOutcome {
                commit_id: source_tip.to_string(),
                fast_forward: true,
                already_up_to_date: false,
            });
        }

        let message = format!("Merge branch '{}' into '{}'", source, target);
        let commit_id = self.commit_merged_tree(source, target, None, &message)?;

        log::info!("[GitManager] Merged {} into {}: {}", source, target, commit_id);
        Ok(MergeOutcome {
            commit_id,
            fast_forward: false,
            already_up_to_date: false,
        })
    }

    /// One bounded auto-resolution attempt: a three-way merge that favors
    /// the union of both sides for conflicting hunks. Returns the merge
    /// commit id when the unioned result is conflict-free, None when even
    /// union resolution leaves conflicts (the caller escalates).
    pub fn merge_union_favor(&self, source: &str, target: &str) -> Result<Option<String>> {
        let index = self.merged_index(source, target, Some(git2::FileFavor::Union))?;
        if index.has_conflicts() {
            return Ok(None);
        }

        let message = format!(
            "Merge branch '{}' into '{}' (auto-resolved)",
            source, target
        );
        let commit_id =
            self.commit_merged_tree(source, target, Some(git2::FileFavor::Union), &message)?;

        log::info!(
            "[GitManager] Auto-resolved merge {} -> {}: {}",
            source,
            target,
            commit_id
        );
        Ok(Some(commit_id))
    }

    /// Three-way index merge of the two branch tips over their merge base.
    /// Never touches refs or the working directory.
    fn merged_index(
        &self,
        source: &str,
        target: &str,
        favor: Option<git2::FileFavor>,
    ) -> Result<git2::Index> {
        let source_tip = self.branch_tip(source)?;
        let target_tip = self.branch_tip(target)?;
        let merge_base = self.repo.merge_base(source_tip, target_tip)?;

        let source_tree = self.repo.find_commit(source_tip)?.tree()?;
        let target_tree = self.repo.find_commit(target_tip)?.tree()?;
        let base_tree = self.repo.find_commit(merge_base)?.tree()?;

        let mut merge_opts = MergeOptions::new();
        if let Some(favor) = favor {
            merge_opts.file_favor(favor);
        }

        Ok(self.repo.merge_trees(
            &base_tree,
            &target_tree,
            &source_tree,
            Some(&mut merge_opts),
        )?)
    }

    /// Write the merged tree as a two-parent commit on the target branch.
    fn commit_merged_tree(
        &self,
        source: &str,
        target: &str,
        favor: Option<git2::FileFavor>,
        message: &str,
    ) -> Result<String> {
        let mut index = self.merged_index(source, target, favor)?;
        if index.has_conflicts() {
            return Err(OrchestratorError::MergeConflict(conflict_paths(&index)?));
        }

        let tree_id = index.write_tree_to(&self.repo)?;
        let tree = self.repo.find_tree(tree_id)?;

        let source_commit = self.repo.find_commit(self.branch_tip(source)?)?;
        let target_commit = self.repo.find_commit(self.branch_tip(target)?)?;
        let signature = self.signature()?;

        let commit_id = self.repo.commit(
            Some(&format!("refs/heads/{}", target)),
            &signature,
            &signature,
            message,
            &tree,
            &[&target_commit, &source_commit],
        )?;

        self.sync_head_checkout(target)?;
        Ok(commit_id.to_string())
    }

    /// Refresh the main working directory when HEAD is the branch we just
    /// moved; worktree checkouts of other branches are unaffected.
    fn sync_head_checkout(&self, branch: &str) -> Result<()> {
        if self.repo.workdir().is_none() {
            return Ok(());
        }
        if let Ok(head) = self.repo.head() {
            if head.shorthand() == Some(branch) {
                self.repo
                    .checkout_head(Some(CheckoutBuilder::default().force()))?;
            }
        }
        Ok(())
    }
}

fn conflict_paths(index: &git2::Index) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    if index.has_conflicts() {
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                paths.push(String::from_utf8_lossy(&entry.path).to_string());
            }
        }
    }
    Ok(paths)
}
