//! Agent sessions
//!
//! An `AgentSession` drives one capability in one worktree for one work
//! item: branch setup, the turn loop with a commit after every change,
//! no-progress timeout, cooperative cancellation at turn boundaries, and
//! the final push. The pool below bounds how many run at once.

pub mod worktree_pool;

use crate::capability::{AgentCapability, TaskContext, TurnOutcome};
use crate::error::{OrchestratorError, Result};
use crate::git::{CommitOutcome, GitManager};
use crate::models::{GitActivityEntry, LogEntry, LogLevel, TaskTelemetry, TokenUsage, WorkItem};
use crate::utils::lock_mutex_recover;
use chrono::Utc;
use regex::Regex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use worktree_pool::WorktreePool;

/// Safety bound on total turns regardless of progress.
const MAX_TURNS: u32 = 50;

/// Oldest log lines are dropped once a task's telemetry reaches this size.
const MAX_TELEMETRY_LOGS: usize = 500;

/// What one finished session produced.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub branch: String,
    pub commit_count: usize,
    pub files_changed: usize,
    pub telemetry: TaskTelemetry,
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// The capability reported `Done`; the branch is ready for merge.
    Finished(SessionReport),
    /// Cancelled at a turn boundary; in-flight work was committed first.
    Cancelled(SessionReport),
}

pub struct AgentSession {
    repo_path: PathBuf,
    work_item: WorkItem,
    branch: String,
    agent_name: String,
    integration_branch: String,
    capability: Arc<dyn AgentCapability>,
    pool: Arc<Mutex<WorktreePool>>,
    cancel: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    no_progress_turns: u32,
}

impl AgentSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_path: PathBuf,
        work_item: WorkItem,
        branch: String,
        agent_name: String,
        integration_branch: String,
        capability: Arc<dyn AgentCapability>,
        pool: Arc<Mutex<WorktreePool>>,
        cancel: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        no_progress_turns: u32,
    ) -> Self {
        Self {
            repo_path,
            work_item,
            branch,
            agent_name,
            integration_branch,
            capability,
            pool,
            cancel,
            paused,
            no_progress_turns,
        }
    }

    /// Run the session to completion.
    ///
    /// On fatal capability errors the branch keeps whatever was committed;
    /// nothing is reset or force-pushed. The worktree slot is always freed,
    /// whatever the outcome; a finished session parks its worktree in the
    /// pool until the conflict monitor has merged or escalated the branch.
    pub async fn run(mut self) -> Result<SessionOutcome> {
        let allocation = {
            let mut pool = lock_mutex_recover(&self.pool);
            pool.acquire(&self.work_item.id, &self.branch)?
        };

        let mut telemetry = TaskTelemetry::default();
        self.log(
            &mut telemetry,
            LogLevel::Info,
            format!(
                "Session started for work item '{}' on branch {}",
                self.work_item.title, self.branch
            ),
        );
        record_git_activity(
            &mut telemetry,
            "worktree",
            format!("acquired {}", allocation.path.display()),
        );

        let result = self.turn_loop(&allocation.path, &mut telemetry).await;

        {
            let mut pool = lock_mutex_recover(&self.pool);
            if matches!(result, Ok(SessionOutcome::Finished(_))) {
                pool.park_for_merge(&self.work_item.id);
            } else if let Err(e) = pool.release(&self.work_item.id) {
                log::warn!("[AgentSession] Failed to release worktree: {}", e);
            }
        }

        result
    }

    async fn turn_loop(
        &mut self,
        worktree: &std::path::Path,
        telemetry: &mut TaskTelemetry,
    ) -> Result<SessionOutcome> {
        let mut commit_count = 0usize;
        let mut no_progress = 0u32;

        for turn in 0..MAX_TURNS {
            // Cancellation and pause are honored only here, never
            // mid-commit. A paused team lets the current turn finish and
            // then holds before the next one.
            while self.paused.load(Ordering::SeqCst) && !self.cancel.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            if self.cancel.load(Ordering::SeqCst) {
                log::info!(
                    "[AgentSession] Cancelled at turn {} on branch {}",
                    turn,
                    self.branch
                );
                let report = self.finish_report(commit_count, telemetry)?;
                return Ok(SessionOutcome::Cancelled(report));
            }

            let ctx = TaskContext {
                work_item_id: self.work_item.id.clone(),
                title: self.work_item.title.clone(),
                description: self.work_item.description.clone(),
                acceptance_criteria: self
                    .work_item
                    .acceptance_criteria
                    .lines()
                    .map(str::to_string)
                    .collect(),
                branch: self.branch.clone(),
                turn,
            };

            let outcome = self.capability.execute_turn(&ctx, worktree).await?;
            match outcome {
                TurnOutcome::Changed { summary } => {
                    accumulate_tokens(&mut telemetry.tokens, &summary);
                    if self.commit_turn(worktree, &summary, telemetry)? {
                        commit_count += 1;
                        no_progress = 0;
                    } else {
                        // Claimed a change but the tree is identical.
                        no_progress += 1;
                    }
                }
                TurnOutcome::Done { summary } => {
                    accumulate_tokens(&mut telemetry.tokens, &summary);
                    if self.commit_turn(worktree, &summary, telemetry)? {
                        commit_count += 1;
                    }
                    self.log(
                        telemetry,
                        LogLevel::Info,
                        format!("Capability finished after {} turn(s)", turn + 1),
                    );
                    self.push_if_remote(telemetry);
                    let report = self.finish_report(commit_count, telemetry)?;
                    return Ok(SessionOutcome::Finished(report));
                }
                TurnOutcome::NoChanges => {
                    no_progress += 1;
                }
                TurnOutcome::Fatal { message } => {
                    self.log(
                        telemetry,
                        LogLevel::Error,
                        format!("Fatal capability error: {}", message),
                    );
                    return Err(OrchestratorError::Capability(message));
                }
            }

            if no_progress >= self.no_progress_turns {
                self.log(
                    telemetry,
                    LogLevel::Warn,
                    format!("No progress for {} consecutive turns", no_progress),
                );
                return Err(OrchestratorError::Timeout(format!(
                    "no progress after {} turns on branch {}",
                    no_progress, self.branch
                )));
            }
        }

        Err(OrchestratorError::Timeout(format!(
            "turn limit of {} reached on branch {}",
            MAX_TURNS, self.branch
        )))
    }

    /// Commit everything in the worktree. Returns whether a commit was made.
    fn commit_turn(
        &self,
        worktree: &std::path::Path,
        summary: &str,
        telemetry: &mut TaskTelemetry,
    ) -> Result<bool> {
        let git = GitManager::open(&self.repo_path)?;
        let message = if summary.is_empty() {
            format!("{}: update", self.agent_name)
        } else {
            summary.to_string()
        };
        match git.commit_all(worktree, &message)? {
            CommitOutcome::Created(info) => {
                record_git_activity(telemetry, "commit", format!("{} {}", info.id, message));
                Ok(true)
            }
            CommitOutcome::NothingToCommit => Ok(false),
        }
    }

    /// Push the branch when a remote is configured; local-only repositories
    /// complete without pushing. Push failures do not fail the session, the
    /// work is already safe on the local branch.
    fn push_if_remote(&self, telemetry: &mut TaskTelemetry) {
        let git = match GitManager::open(&self.repo_path) {
            Ok(g) => g,
            Err(e) => {
                log::warn!("[AgentSession] Cannot open repo for push: {}", e);
                return;
            }
        };
        if !git.has_remote() {
            log::debug!(
                "[AgentSession] No origin remote, keeping {} local",
                self.branch
            );
            return;
        }
        match git.push_branch(&self.branch) {
            Ok(()) => {
                record_git_activity(telemetry, "push", format!("pushed {}", self.branch));
            }
            Err(e) => {
                self.log(
                    telemetry,
                    LogLevel::Warn,
                    format!("Push of {} failed: {}", self.branch, e),
                );
            }
        }
    }

    fn finish_report(
        &self,
        commit_count: usize,
        telemetry: &mut TaskTelemetry,
    ) -> Result<SessionReport> {
        let git = GitManager::open(&self.repo_path)?;
        let files_changed = git
            .diff_branch(&self.branch, &self.integration_branch)?
            .files_changed;
        Ok(SessionReport {
            branch: self.branch.clone(),
            commit_count,
            files_changed,
            telemetry: telemetry.clone(),
        })
    }

    fn log(&self, telemetry: &mut TaskTelemetry, level: LogLevel, message: String) {
        match level {
            LogLevel::Error => log::error!("[AgentSession] {}", message),
            LogLevel::Warn => log::warn!("[AgentSession] {}", message),
            _ => log::info!("[AgentSession] {}", message),
        }
        if telemetry.logs.len() >= MAX_TELEMETRY_LOGS {
            telemetry.logs.remove(0);
        }
        telemetry.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }
}

fn record_git_activity(telemetry: &mut TaskTelemetry, action: &str, detail: String) {
    telemetry.git_activity.push(GitActivityEntry {
        timestamp: Utc::now(),
        action: action.to_string(),
        detail,
    });
}

/// Best-effort token accounting from capability turn summaries. Lines like
/// "input tokens: 1200" or "450 output tokens" accumulate; anything else
/// counts as zero.
pub fn accumulate_tokens(usage: &mut TokenUsage, text: &str) {
    usage.input_tokens += scan_tokens(text, r"(?i)input[ _]?tokens\D{0,3}(\d+)")
        + scan_tokens(text, r"(?i)(\d+)\s*input[ _]?tokens");
    usage.output_tokens += scan_tokens(text, r"(?i)output[ _]?tokens\D{0,3}(\d+)")
        + scan_tokens(text, r"(?i)(\d+)\s*output[ _]?tokens");
}

fn scan_tokens(text: &str, pattern: &str) -> u64 {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(_) => return 0,
    };
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().parse::<u64>().ok())
        .sum()
}
