//! Branch operations for GitManager
//!
//! Contains methods for creating, deleting, listing, and checking out
//! branches, plus commit history reads

use git2::{Branch, BranchType, Commit};

use crate::error::{OrchestratorError, Result};
use crate::git::types::{BranchInfo, CommitInfo};
use crate::git::GitManager;

impl GitManager {
    /// Create a new branch from the given ref (branch name or revspec).
    /// Defaults to the current HEAD when `from_ref` is None.
    ///
    /// Fails with `BranchExists` when the name is already taken; callers for
    /// whom that is benign check out the existing branch instead.
    pub fn create_branch(&self, name: &str, from_ref: Option<&str>) -> Result<BranchInfo> {
        if self.repo.find_branch(name, BranchType::Local).is_ok() {
            return Err(OrchestratorError::BranchExists(name.to_string()));
        }

        let target = match from_ref {
            Some(spec) => self
                .repo
                .revparse_single(spec)
                .and_then(|obj| obj.peel_to_commit())
                .map_err(|e| OrchestratorError::from_git(e, name))?,
            None => self
                .repo
                .head()
                .and_then(|head| head.peel_to_commit())
                .map_err(|e| OrchestratorError::from_git(e, name))?,
        };

        let branch = self
            .repo
            .branch(name, &target, false)
            .map_err(|e| OrchestratorError::from_git(e, name))?;

        log::info!("[GitManager] Created branch {} at {}", name, target.id());
        self.branch_to_info(&branch)
    }

    /// Delete a branch
    pub fn delete_branch(&self, name: &str) -> Result<()> {
        let mut branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .map_err(|e| OrchestratorError::from_git(e, name))?;
        branch
            .delete()
            .map_err(|e| OrchestratorError::from_git(e, name))?;
        Ok(())
    }

    /// Get all local branches
    pub fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        let branches = self.repo.branches(Some(BranchType::Local))?;

        let mut result = Vec::new();
        for branch in branches {
            let (branch, _) = branch?;
            result.push(self.branch_to_info(&branch)?);
        }

        Ok(result)
    }

    /// Check whether a local branch exists
    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Get the current branch
    pub fn current_branch(&self) -> Result<BranchInfo> {
        let head = self.repo.head()?;

        if !head.is_branch() {
            return Err(OrchestratorError::Git("HEAD is not a branch".to_string()));
        }

        let branch = Branch::wrap(head);
        self.branch_to_info(&branch)
    }

    /// Checkout a branch in the main working directory
    pub fn checkout_branch(&self, name: &str) -> Result<()> {
        let obj = self
            .repo
            .revparse_single(&format!("refs/heads/{}", name))
            .map_err(|e| OrchestratorError::from_git(e, name))?;

        self.repo.checkout_tree(&obj, None)?;
        self.repo.set_head(&format!("refs/heads/{}", name))?;

        Ok(())
    }

    /// The most recent `n` commits reachable from a branch tip
    pub fn recent_commits(&self, branch: &str, n: usize) -> Result<Vec<CommitInfo>> {
        let branch_ref = self
            .repo
            .find_branch(branch, BranchType::Local)
            .map_err(|e| OrchestratorError::from_git(e, branch))?;
        let tip = branch_ref.get().peel_to_commit()?;

        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(tip.id())?;

        let mut result = Vec::new();
        for (i, oid) in revwalk.enumerate() {
            if i >= n {
                break;
            }
            let commit = self.repo.find_commit(oid?)?;
            result.push(self.commit_to_info(&commit)?);
        }

        Ok(result)
    }

    /// Number of commits on `branch` that are not on `base`
    pub fn commits_ahead_of(&self, branch: &str, base: &str) -> Result<usize> {
        let branch_tip = self.branch_tip(branch)?;
        let base_tip = self.branch_tip(base)?;
        let merge_base = self.repo.merge_base(branch_tip, base_tip)?;

        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(branch_tip)?;
        revwalk.hide(merge_base)?;
        Ok(revwalk.count())
    }

    /// Tip commit id of a local branch
    pub(crate) fn branch_tip(&self, name: &str) -> Result<git2::Oid> {
        let branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .map_err(|e| OrchestratorError::from_git(e, name))?;
        Ok(branch.get().peel_to_commit()?.id())
    }

    /// Get the default branch name for this repository.
    ///
    /// Resolution order: current HEAD branch, then "main"/"master" if they
    /// exist, then "main".
    pub fn default_branch_name(&self) -> String {
        if let Ok(head) = self.repo.head() {
            if head.is_branch() {
                if let Some(name) = head.shorthand() {
                    return name.to_string();
                }
            }
        }

        for name in &["main", "master"] {
            if self.repo.find_branch(name, BranchType::Local).is_ok() {
                return (*name).to_string();
            }
        }

        "main".to_string()
    }

    /// Convert a Branch to BranchInfo
    pub(crate) fn branch_to_info(&self, branch: &Branch) -> Result<BranchInfo> {
        let name = branch.name()?.unwrap_or("").to_string();
        let is_head = branch.is_head();
        let commit = branch.get().peel_to_commit()?;

        Ok(BranchInfo {
            name,
            is_head,
            commit_id: commit.id().to_string(),
        })
    }

    /// Convert a Commit to CommitInfo
    pub(crate) fn commit_to_info(&self, commit: &Commit) -> Result<CommitInfo> {
        let author = commit.author();
        let parent_ids = commit.parent_ids().map(|oid| oid.to_string()).collect();

        Ok(CommitInfo {
            id: commit.id().to_string(),
            short_id: commit.id().to_string()[..7].to_string(),
            message: commit.message().unwrap_or("").to_string(),
            author: author.name().unwrap_or("").to_string(),
            email: author.email().unwrap_or("").to_string(),
            timestamp: commit.time().seconds(),
            parent_ids,
        })
    }
}
