//! Commit operations for GitManager
//!
//! Contains stage-all commits in worktrees, diffs, changed-region
//! extraction, and push

use git2::{Delta, Diff, DiffOptions, Repository};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::git::types::{CommitInfo, CommitOutcome, DiffInfo, FileDiff, LineRange};
use crate::git::GitManager;

impl GitManager {
    /// Stage all changes in a worktree and commit them.
    ///
    /// An empty diff is a `NothingToCommit` outcome, never an error, so the
    /// session loop can distinguish a quiet turn from a failed one.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<CommitOutcome> {
        let wt_repo = Repository::open(worktree_path).map_err(|e| {
            OrchestratorError::Repository(format!(
                "cannot open worktree {}: {}",
                worktree_path.display(),
                e.message()
            ))
        })?;

        let mut index = wt_repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = wt_repo.head()?.peel_to_commit()?;

        // Identical tree means the stage-all found nothing
        if tree_id == parent.tree_id() {
            return Ok(CommitOutcome::NothingToCommit);
        }

        let tree = wt_repo.find_tree(tree_id)?;
        let signature = wt_repo
            .signature()
            .or_else(|_| git2::Signature::now("Gitswarm", "gitswarm@example.com"))?;

        let oid = wt_repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &[&parent])?;

        let commit = wt_repo.find_commit(oid)?;
        let info = CommitInfo {
            id: commit.id().to_string(),
            short_id: commit.id().to_string()[..7].to_string(),
            message: commit.message().unwrap_or("").to_string(),
            author: commit.author().name().unwrap_or("").to_string(),
            email: commit.author().email().unwrap_or("").to_string(),
            timestamp: commit.time().seconds(),
            parent_ids: commit.parent_ids().map(|p| p.to_string()).collect(),
        };

        log::info!(
            "[GitManager] Committed {} in worktree {:?}",
            info.short_id,
            worktree_path
        );

        Ok(CommitOutcome::Created(info))
    }

    /// Diff of a branch against a base branch (merge-base relative)
    pub fn diff_branch(&self, branch: &str, base: &str) -> Result<DiffInfo> {
        let diff = self.branch_diff_raw(branch, base, 3)?;
        self.diff_to_info(&diff)
    }

    /// Per-file changed line ranges of `branch` relative to the merge base
    /// with `base`, in merge-base (old file) coordinates. Feeds conflict
    /// intent analysis.
    pub fn changed_regions(
        &self,
        branch: &str,
        base: &str,
    ) -> Result<BTreeMap<String, Vec<LineRange>>> {
        // Zero context so ranges cover edited lines only, not surroundings
        let diff = self.branch_diff_raw(branch, base, 0)?;

        let mut regions: BTreeMap<String, Vec<LineRange>> = BTreeMap::new();
        diff.foreach(
            &mut |_, _| true,
            None,
            Some(&mut |delta, hunk| {
                if let Some(path) = delta
                    .old_file()
                    .path()
                    .or_else(|| delta.new_file().path())
                {
                    let start = hunk.old_start();
                    // A pure insertion has old_lines == 0; treat it as
                    // touching the line it is anchored at
                    let end = start + hunk.old_lines().max(1) - 1;
                    regions
                        .entry(path.to_string_lossy().to_string())
                        .or_default()
                        .push(LineRange { start, end });
                }
                true
            }),
            None,
        )?;

        Ok(regions)
    }

    fn branch_diff_raw(&self, branch: &str, base: &str, context: u32) -> Result<Diff<'_>> {
        let branch_tip = self.branch_tip(branch)?;
        let base_tip = self.branch_tip(base)?;
        let merge_base = self.repo.merge_base(branch_tip, base_tip)?;

        let branch_tree = self.repo.find_commit(branch_tip)?.tree()?;
        let base_tree = self.repo.find_commit(merge_base)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.context_lines(context);
        Ok(self
            .repo
            .diff_tree_to_tree(Some(&base_tree), Some(&branch_tree), Some(&mut opts))?)
    }

    /// Whether the repository has an "origin" remote configured
    pub fn has_remote(&self) -> bool {
        self.repo.find_remote("origin").is_ok()
    }

    /// Push a branch to the origin remote
    pub fn push_branch(&self, branch_name: &str) -> Result<()> {
        let mut remote = self
            .repo
            .find_remote("origin")
            .map_err(|e| OrchestratorError::from_git(e, branch_name))?;

        let refspec = format!("refs/heads/{}:refs/heads/{}", branch_name, branch_name);

        let mut callbacks = git2::RemoteCallbacks::new();
        callbacks.credentials(|_url, username_from_url, _allowed_types| {
            git2::Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
        });

        let mut push_options = git2::PushOptions::new();
        push_options.remote_callbacks(callbacks);

        remote
            .push(&[&refspec], Some(&mut push_options))
            .map_err(|e| OrchestratorError::Git(e.message().to_string()))?;

        log::info!("[GitManager] Pushed branch {} to origin", branch_name);
        Ok(())
    }

    /// Convert a Diff to DiffInfo
    pub(crate) fn diff_to_info(&self, diff: &Diff) -> Result<DiffInfo> {
        let stats = diff.stats()?;

        let mut files = Vec::new();
        diff.foreach(
            &mut |delta, _| {
                let old_path = delta
                    .old_file()
                    .path()
                    .map(|p| p.to_string_lossy().to_string());
                let new_path = delta
                    .new_file()
                    .path()
                    .map(|p| p.to_string_lossy().to_string());

                files.push(FileDiff {
                    old_path,
                    new_path,
                    status: delta_to_string(delta.status()),
                });

                true
            },
            None,
            None,
            None,
        )?;

        Ok(DiffInfo {
            files_changed: stats.files_changed(),
            insertions: stats.insertions(),
            deletions: stats.deletions(),
            files,
        })
    }
}

fn delta_to_string(delta: Delta) -> String {
    match delta {
        Delta::Added => "added",
        Delta::Deleted => "deleted",
        Delta::Modified => "modified",
        Delta::Renamed => "renamed",
        Delta::Copied => "copied",
        Delta::Ignored => "ignored",
        Delta::Untracked => "untracked",
        Delta::Typechange => "typechange",
        Delta::Unmodified => "unmodified",
        Delta::Unreadable => "unreadable",
        Delta::Conflicted => "conflicted",
    }
    .to_string()
}
