//! Worktree pool for parallel sessions
//!
//! Each running session gets its own isolated worktree, keyed by work item.
//! Slots are bounded by the team's concurrency limit. A branch can back at
//! most one worktree; the git layer enforces that exclusivity.

use crate::error::{OrchestratorError, Result};
use crate::git::GitManager;
use crate::utils::sanitize_path_component;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Information about an allocated worktree
#[derive(Debug, Clone)]
pub struct WorktreeAllocation {
    pub work_item_id: String,
    pub path: PathBuf,
    pub branch: String,
    /// Kept on disk after release for manual conflict review.
    pub keep_on_release: bool,
}

/// Pool of worktrees for one team's repository
pub struct WorktreePool {
    repo_path: PathBuf,
    /// Task branches are cut from this branch, never from HEAD.
    base_branch: String,
    /// work_item_id -> allocation
    active: HashMap<String, WorktreeAllocation>,
    /// Finished sessions whose branch still awaits a merge outcome; these
    /// do not count against the slot limit.
    parked: HashMap<String, WorktreeAllocation>,
    max_worktrees: usize,
}

impl WorktreePool {
    pub fn new(repo_path: &Path, base_branch: &str, max_worktrees: usize) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            base_branch: base_branch.to_string(),
            active: HashMap::new(),
            parked: HashMap::new(),
            max_worktrees,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.max_worktrees.saturating_sub(self.active.len())
    }

    pub fn has_worktree(&self, work_item_id: &str) -> bool {
        self.active.contains_key(work_item_id)
    }

    pub fn allocation(&self, work_item_id: &str) -> Option<&WorktreeAllocation> {
        self.active.get(work_item_id)
    }

    pub fn active_allocations(&self) -> impl Iterator<Item = &WorktreeAllocation> {
        self.active.values()
    }

    /// Acquire a worktree for a work item on the given branch.
    ///
    /// Ensures the branch exists (reusing it if a previous attempt created
    /// it), cleans up stale state, and creates the worktree. Acquiring
    /// twice for the same work item returns the existing allocation.
    pub fn acquire(&mut self, work_item_id: &str, branch: &str) -> Result<WorktreeAllocation> {
        if let Some(existing) = self.active.get(work_item_id) {
            return Ok(existing.clone());
        }

        // A parked worktree keeps its branch checkout; reactivate it
        // instead of fighting the exclusivity check.
        if let Some(parked) = self.parked.remove(work_item_id) {
            if self.active.len() >= self.max_worktrees {
                self.parked.insert(work_item_id.to_string(), parked);
                return Err(OrchestratorError::WorktreeConflict(format!(
                    "worktree pool exhausted: {} active, max {}",
                    self.active.len(),
                    self.max_worktrees
                )));
            }
            self.active.insert(work_item_id.to_string(), parked.clone());
            return Ok(parked);
        }

        if self.active.len() >= self.max_worktrees {
            return Err(OrchestratorError::WorktreeConflict(format!(
                "worktree pool exhausted: {} active, max {}",
                self.active.len(),
                self.max_worktrees
            )));
        }

        let worktree_path = self
            .repo_path
            .join(".worktrees")
            .join(sanitize_path_component(work_item_id));

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OrchestratorError::Repository(format!("Failed to create worktree directory: {}", e))
            })?;
        }

        let git = GitManager::open(&self.repo_path)?;

        // A retried task reuses the branch it created last time.
        match git.create_branch(branch, Some(&self.base_branch)) {
            Ok(_) => {}
            Err(OrchestratorError::BranchExists(_)) => {
                log::debug!("[WorktreePool] Reusing existing branch {}", branch);
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = git.prune_orphaned_worktrees() {
            log::warn!("[WorktreePool] Failed to prune orphaned worktrees: {}", e);
        }

        // Clean up if the path exists but is no longer a valid worktree
        if worktree_path.exists() && !worktree_path.join(".git").exists() {
            log::warn!(
                "[WorktreePool] Removing stale directory at {:?}",
                worktree_path
            );
            if let Err(e) = std::fs::remove_dir_all(&worktree_path) {
                log::warn!("[WorktreePool] Failed to remove stale directory: {}", e);
            }
        }

        git.create_worktree(branch, &worktree_path)?;

        log::info!(
            "[WorktreePool] Created worktree for work item {} at {:?} on branch {}",
            work_item_id,
            worktree_path,
            branch
        );

        let allocation = WorktreeAllocation {
            work_item_id: work_item_id.to_string(),
            path: worktree_path,
            branch: branch.to_string(),
            keep_on_release: false,
        };

        self.active
            .insert(work_item_id.to_string(), allocation.clone());
        Ok(allocation)
    }

    /// Mark a worktree to survive release, for escalated-conflict review.
    pub fn keep_for_review(&mut self, work_item_id: &str) {
        if let Some(allocation) = self
            .active
            .get_mut(work_item_id)
            .or_else(|| self.parked.get_mut(work_item_id))
        {
            allocation.keep_on_release = true;
        }
    }

    /// Free the slot of a finished session but keep its worktree on disk
    /// until the conflict monitor has merged or escalated the branch.
    pub fn park_for_merge(&mut self, work_item_id: &str) {
        if let Some(allocation) = self.active.remove(work_item_id) {
            log::info!(
                "[WorktreePool] Parked worktree for {} at {:?} pending merge",
                work_item_id,
                allocation.path
            );
            self.parked.insert(work_item_id.to_string(), allocation);
        }
    }

    /// Drop a parked worktree once its branch was merged.
    pub fn remove_parked(&mut self, work_item_id: &str) {
        let allocation = match self.parked.remove(work_item_id) {
            Some(a) => a,
            None => return,
        };
        if let Err(e) = self.remove_worktree_dir(&allocation) {
            log::warn!("[WorktreePool] Failed to remove parked worktree: {}", e);
        }
    }

    /// Release a worktree, freeing its slot.
    ///
    /// The branch is always kept so work is never lost. The worktree
    /// directory is removed unless it was pinned with `keep_for_review`.
    pub fn release(&mut self, work_item_id: &str) -> Result<()> {
        let allocation = match self.active.remove(work_item_id) {
            Some(a) => a,
            None => return Ok(()), // Already released
        };

        if allocation.keep_on_release {
            log::info!(
                "[WorktreePool] Keeping worktree for {} at {:?} for conflict review",
                work_item_id,
                allocation.path
            );
            return Ok(());
        }

        self.remove_worktree_dir(&allocation)?;

        log::info!(
            "[WorktreePool] Released worktree for work item {} at {:?}",
            work_item_id,
            allocation.path
        );
        Ok(())
    }

    /// Release every worktree, active and parked (team stop / shutdown).
    pub fn release_all(&mut self) {
        let work_item_ids: Vec<String> = self
            .active
            .keys()
            .chain(self.parked.keys())
            .cloned()
            .collect();
        for id in work_item_ids {
            if let Some(parked) = self.parked.remove(&id) {
                self.active.insert(id.clone(), parked);
            }
            if let Err(e) = self.release(&id) {
                log::warn!("[WorktreePool] Failed to release worktree for {}: {}", id, e);
            }
        }
    }

    fn remove_worktree_dir(&self, allocation: &WorktreeAllocation) -> Result<()> {
        let git = GitManager::open(&self.repo_path)?;
        if let Err(e) = git.remove_worktree(&allocation.path) {
            log::warn!("[WorktreePool] Failed to remove worktree: {}", e);
        }
        if allocation.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&allocation.path) {
                log::warn!("[WorktreePool] Failed to remove worktree directory: {}", e);
            }
        }
        Ok(())
    }
}
