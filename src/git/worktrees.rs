//! Worktree management for GitManager
//!
//! Contains methods for creating, listing, removing, and pruning worktrees

use git2::{BranchType, Repository, Worktree, WorktreeAddOptions};
use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::git::types::WorktreeInfo;
use crate::git::GitManager;

impl GitManager {
    /// Create an isolated worktree checked out to `branch`.
    ///
    /// Fails with `WorktreeConflict` when the branch is already checked out
    /// in another worktree (per-branch exclusivity). The branch must already
    /// exist; callers create it first so branch creation errors stay
    /// classified separately.
    pub fn create_worktree(&self, branch: &str, path: &Path) -> Result<WorktreeInfo> {
        if let Some(existing) = self.worktree_for_branch(branch)? {
            return Err(OrchestratorError::WorktreeConflict(format!(
                "{} (checked out at {})",
                branch, existing.path
            )));
        }

        let branch_ref = self
            .repo
            .find_branch(branch, BranchType::Local)
            .map_err(|e| OrchestratorError::from_git(e, branch))?;

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch_ref.get()));

        // Branch names like "task/uuid" would create nested directories in
        // .git/worktrees/, which fails
        let worktree_name = branch.replace('/', "-");

        let worktree = self
            .repo
            .worktree(&worktree_name, path, Some(&opts))
            .map_err(|e| OrchestratorError::from_git(e, branch))?;

        log::info!(
            "[GitManager] Created worktree {} at {:?} on branch {}",
            worktree_name,
            path,
            branch
        );

        self.worktree_to_info(&worktree)
    }

    /// List all worktrees
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let worktrees = self.repo.worktrees()?;

        let mut result = Vec::new();
        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                result.push(self.worktree_to_info(&worktree)?);
            }
        }

        Ok(result)
    }

    /// Find the worktree holding `branch`, if any
    pub fn worktree_for_branch(&self, branch: &str) -> Result<Option<WorktreeInfo>> {
        Ok(self
            .list_worktrees()?
            .into_iter()
            .find(|wt| wt.branch.as_deref() == Some(branch)))
    }

    /// Remove a worktree by path
    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        let target = path.to_string_lossy();
        let worktrees = self.repo.worktrees()?;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                let worktree_path = worktree.path().to_string_lossy();
                if worktree_path.trim_end_matches('/') == target.trim_end_matches('/') {
                    let mut opts = git2::WorktreePruneOptions::new();
                    opts.valid(true).working_tree(true);
                    worktree.prune(Some(&mut opts))?;
                    log::info!("[GitManager] Removed worktree at {:?}", path);
                    return Ok(());
                }
            }
        }

        Err(OrchestratorError::Git(format!(
            "worktree not found: {}",
            target
        )))
    }

    /// Prune worktrees whose physical directory no longer exists. Returns
    /// the number pruned.
    pub fn prune_orphaned_worktrees(&self) -> Result<u32> {
        let worktrees = self.repo.worktrees()?;
        let mut pruned_count = 0;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                if !worktree.path().exists() {
                    log::info!(
                        "[GitManager] Pruning orphaned worktree '{}' (path {:?} no longer exists)",
                        name,
                        worktree.path()
                    );
                    if let Err(e) = worktree.prune(None) {
                        log::warn!("[GitManager] Failed to prune worktree '{}': {}", name, e);
                    } else {
                        pruned_count += 1;
                    }
                }
            }
        }

        Ok(pruned_count)
    }

    /// Convert a Worktree to WorktreeInfo
    pub(crate) fn worktree_to_info(&self, worktree: &Worktree) -> Result<WorktreeInfo> {
        let name = worktree.name().unwrap_or("").to_string();
        let path = worktree.path().to_string_lossy().to_string();
        let is_locked = worktree
            .is_locked()
            .map(|status| !matches!(status, git2::WorktreeLockStatus::Unlocked))
            .unwrap_or(false);

        // Determine the branch by opening the worktree's own repository
        let branch = if let Ok(wt_repo) = Repository::open(worktree.path()) {
            wt_repo
                .head()
                .ok()
                .filter(|head| head.is_branch())
                .and_then(|head| head.shorthand().map(|s| s.to_string()))
        } else {
            None
        };

        Ok(WorktreeInfo {
            name,
            path,
            branch,
            is_locked,
        })
    }
}
