//! Conflict monitor
//!
//! Periodically tests every active task branch against the integration
//! branch. Clean branches merge once their work item is pr_ready.
//! Conflicting branches go through the intent analyzer: a compatible
//! verdict earns one bounded auto-resolution attempt; everything else
//! escalates with both diffs captured for review. Escalated conflicts are
//! never force-merged. All merges for a team run under one guard so two
//! sweeps cannot interleave ref updates.

use crate::capability::{CompatibilityVerdict, IntentAnalyzer};
use crate::error::{OrchestratorError, Result};
use crate::git::GitManager;
use crate::models::{ConflictRecord, ConflictResolution};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// One branch the monitor watches during a sweep.
#[derive(Debug, Clone)]
pub struct BranchWatch {
    pub branch: String,
    pub work_item_id: Option<String>,
    /// Clean branches only merge once their work item is ready.
    pub pr_ready: bool,
}

/// What the sweep did for one branch.
#[derive(Debug)]
pub enum SweepAction {
    /// Clean and merged into the integration branch.
    Merged { commit_id: String },
    /// Clean but not pr_ready yet; nothing to do.
    CleanPending,
    /// Nothing new on the branch.
    UpToDate,
    /// Conflict auto-resolved by a union merge that re-checked clean.
    AutoResolved {
        commit_id: String,
        conflicting_paths: Vec<String>,
    },
    /// Conflict escalated for human review; work item should block.
    Escalated(ConflictRecord),
}

#[derive(Debug)]
pub struct SweepOutcome {
    pub branch: String,
    pub work_item_id: Option<String>,
    pub action: SweepAction,
}

pub struct ConflictMonitor {
    repo_path: PathBuf,
    integration_branch: String,
    analyzer: Arc<dyn IntentAnalyzer>,
    /// Serializes merges with the lifecycle manager's own merge sites.
    merge_guard: Arc<AsyncMutex<()>>,
    cancel: Arc<AtomicBool>,
    check_interval: Duration,
    resolve_timeout: Duration,
}

impl ConflictMonitor {
    pub fn new(
        repo_path: PathBuf,
        integration_branch: String,
        analyzer: Arc<dyn IntentAnalyzer>,
        merge_guard: Arc<AsyncMutex<()>>,
        cancel: Arc<AtomicBool>,
        check_interval: Duration,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            repo_path,
            integration_branch,
            analyzer,
            merge_guard,
            cancel,
            check_interval,
            resolve_timeout,
        }
    }

    /// Run sweeps until cancelled. `provide` supplies the branches to watch
    /// each cycle; `consume` receives every outcome. The interval re-arms
    /// after each sweep, so a slow sweep never stacks up behind itself.
    pub async fn run_loop<P, C>(&self, mut provide: P, mut consume: C)
    where
        P: FnMut() -> Vec<BranchWatch> + Send,
        C: FnMut(SweepOutcome) + Send,
    {
        log::info!(
            "[ConflictMonitor] Started, checking every {:?}",
            self.check_interval
        );
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                log::info!("[ConflictMonitor] Stopping");
                return;
            }

            let watches = provide();
            match self.sweep(&watches).await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        consume(outcome);
                    }
                }
                Err(e) => {
                    log::error!("[ConflictMonitor] Sweep failed: {}", e);
                }
            }

            tokio::time::sleep(self.check_interval).await;
        }
    }

    /// One pass over all watched branches.
    pub async fn sweep(&self, watches: &[BranchWatch]) -> Result<Vec<SweepOutcome>> {
        let mut outcomes = Vec::with_capacity(watches.len());
        for watch in watches {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            match self.check_branch(watch).await {
                Ok(action) => outcomes.push(SweepOutcome {
                    branch: watch.branch.clone(),
                    work_item_id: watch.work_item_id.clone(),
                    action,
                }),
                Err(e) => {
                    // One broken branch must not stall the sweep.
                    log::warn!(
                        "[ConflictMonitor] Check of branch {} failed: {}",
                        watch.branch,
                        e
                    );
                }
            }
        }
        Ok(outcomes)
    }

    async fn check_branch(&self, watch: &BranchWatch) -> Result<SweepAction> {
        let git = GitManager::open(&self.repo_path)?;

        if git.commits_ahead_of(&watch.branch, &self.integration_branch)? == 0 {
            return Ok(SweepAction::UpToDate);
        }

        let check = git.test_merge(&watch.branch, &self.integration_branch)?;
        if check.clean {
            if !watch.pr_ready {
                return Ok(SweepAction::CleanPending);
            }
            let _guard = self.merge_guard.lock().await;
            let outcome = git.merge(&watch.branch, &self.integration_branch)?;
            log::info!(
                "[ConflictMonitor] Merged {} into {} at {}",
                watch.branch,
                self.integration_branch,
                outcome.commit_id
            );
            return Ok(SweepAction::Merged {
                commit_id: outcome.commit_id,
            });
        }

        log::warn!(
            "[ConflictMonitor] Conflict between {} and {} in {:?}",
            watch.branch,
            self.integration_branch,
            check.conflicting_paths
        );

        let verdict = self.analyzer.assess(
            &git,
            &watch.branch,
            &self.integration_branch,
            &check.conflicting_paths,
        )?;

        match verdict {
            CompatibilityVerdict::Compatible => {
                match self.try_auto_resolve(&watch.branch).await {
                    Ok(Some(commit_id)) => {
                        log::info!(
                            "[ConflictMonitor] Auto-resolved {} into {} at {}",
                            watch.branch,
                            self.integration_branch,
                            commit_id
                        );
                        Ok(SweepAction::AutoResolved {
                            commit_id,
                            conflicting_paths: check.conflicting_paths.clone(),
                        })
                    }
                    Ok(None) => Ok(SweepAction::Escalated(self.escalation_record(
                        &git,
                        watch,
                        &check.conflicting_paths,
                        "union merge still conflicting",
                    )?)),
                    Err(e) => Ok(SweepAction::Escalated(self.escalation_record(
                        &git,
                        watch,
                        &check.conflicting_paths,
                        &format!("auto-resolution failed: {}", e),
                    )?)),
                }
            }
            CompatibilityVerdict::Incompatible { reason } => {
                Ok(SweepAction::Escalated(self.escalation_record(
                    &git,
                    watch,
                    &check.conflicting_paths,
                    &reason,
                )?))
            }
        }
    }

    /// One bounded union-merge attempt, committed only when the result is
    /// conflict-free. Runs on the blocking pool under the merge guard.
    async fn try_auto_resolve(&self, branch: &str) -> Result<Option<String>> {
        let _guard = self.merge_guard.lock().await;

        let repo_path = self.repo_path.clone();
        let source = branch.to_string();
        let target = self.integration_branch.clone();
        let attempt = tokio::task::spawn_blocking(move || {
            let git = GitManager::open(&repo_path)?;
            git.merge_union_favor(&source, &target)
        });

        match tokio::time::timeout(self.resolve_timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(OrchestratorError::Invariant(format!(
                "auto-resolution task panicked: {}",
                join_err
            ))),
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "auto-resolution exceeded {:?}",
                self.resolve_timeout
            ))),
        }
    }

    fn escalation_record(
        &self,
        git: &GitManager,
        watch: &BranchWatch,
        conflicting_paths: &[String],
        reason: &str,
    ) -> Result<ConflictRecord> {
        log::warn!(
            "[ConflictMonitor] Escalating conflict on {}: {}",
            watch.branch,
            reason
        );
        let source_diff = git
            .diff_branch(&watch.branch, &self.integration_branch)?
            .summary();
        let target_diff = git
            .diff_branch(&self.integration_branch, &watch.branch)?
            .summary();

        Ok(ConflictRecord {
            source_branch: watch.branch.clone(),
            target_branch: self.integration_branch.clone(),
            work_item_id: watch.work_item_id.clone(),
            conflicting_paths: conflicting_paths.to_vec(),
            resolution: ConflictResolution::Escalated,
            source_diff: Some(source_diff),
            target_diff: Some(target_diff),
            detected_at: Utc::now(),
        })
    }
}
