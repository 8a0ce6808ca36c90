//! Team lifecycle manager
//!
//! One `TeamManager` per team owns the aggregate behind an `Arc<Mutex<_>>`
//! handle; there are no process-wide singletons. Dependencies (store,
//! capability, analyzer, event sink) are injected. `start` runs the
//! readiness check, creates a run, spawns sessions up to capacity, and
//! arms the conflict monitor; `stop` cancels cooperatively and tears the
//! worktrees down. State is persisted after every transition and one event
//! is emitted per transition.

use crate::capability::{AgentCapability, IntentAnalyzer};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{self, EventSink, OrchestratorEvent};
use crate::models::state_machine::{run_is_terminal, transition_team, transition_work_item};
use crate::models::{
    AgentStatus, ConflictRecord, ConflictResolution, RunStatus, RunTaskStatus, TeamStatus,
    WorkItem, WorkItemResult, WorkItemStatus,
};
use crate::monitor::{BranchWatch, ConflictMonitor, SweepAction, SweepOutcome};
use crate::queue;
use crate::run::{self, RetryPolicy};
use crate::session::worktree_pool::WorktreePool;
use crate::session::{AgentSession, SessionOutcome};
use crate::storage::{TeamFile, TeamStore};
use crate::utils::lock_mutex_recover;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

struct Inner {
    state: Mutex<TeamFile>,
    store: Arc<dyn TeamStore>,
    capability: Arc<dyn AgentCapability>,
    analyzer: Arc<dyn IntentAnalyzer>,
    events: EventSink,
    config: OrchestratorConfig,
    repo_path: PathBuf,
    cancel: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    merge_guard: Arc<AsyncMutex<()>>,
    pool: Arc<Mutex<WorktreePool>>,
}

pub struct TeamManager {
    inner: Arc<Inner>,
}

impl TeamManager {
    pub fn new(
        mut team_file: TeamFile,
        store: Arc<dyn TeamStore>,
        capability: Arc<dyn AgentCapability>,
        analyzer: Arc<dyn IntentAnalyzer>,
        events: EventSink,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        // The config carries the fleet default; a team may override it.
        if team_file.team.integration_branch.is_empty() {
            team_file.team.integration_branch = config.integration_branch.clone();
        }
        let repo_path = PathBuf::from(&team_file.team.repo_path);
        let pool = Arc::new(Mutex::new(WorktreePool::new(
            &repo_path,
            &team_file.team.integration_branch,
            team_file.team.max_concurrent_tasks.min(config.max_concurrent_tasks),
        )));
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(team_file),
                store,
                capability,
                analyzer,
                events,
                config,
                repo_path,
                cancel: Arc::new(AtomicBool::new(false)),
                paused: Arc::new(AtomicBool::new(false)),
                merge_guard: Arc::new(AsyncMutex::new(())),
                pool,
            }),
        })
    }

    pub fn status(&self) -> TeamStatus {
        lock_mutex_recover(&self.inner.state).team.status
    }

    /// Clone of the current aggregate, for inspection and the read model.
    pub fn snapshot(&self) -> TeamFile {
        lock_mutex_recover(&self.inner.state).clone()
    }

    /// Readiness check, run creation, session spawn up to capacity, monitor.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let selections;
        {
            let mut file = lock_mutex_recover(&inner.state);

            let readiness = queue::readiness(&file.team, &file.work_items, &file.agents);
            if !readiness.ready {
                return Err(OrchestratorError::Transition(format!(
                    "team {} is not ready to start: {:?}",
                    file.team.id, readiness.unmet
                )));
            }

            let capacity = file
                .team
                .max_concurrent_tasks
                .min(inner.config.max_concurrent_tasks);
            let picked: Vec<(WorkItem, String, String)> =
                queue::select_for_capacity(&file.work_items, &file.agents, capacity)
                    .into_iter()
                    .map(|s| (s.work_item.clone(), s.agent.name.clone(), s.agent.id.clone()))
                    .collect();
            // Nothing matched (all queued items need a specialization no
            // idle agent has): the team stays stopped.
            if picked.is_empty() {
                return Err(OrchestratorError::Transition(
                    "no work item could be matched to an idle agent".to_string(),
                ));
            }

            set_team_status(&mut file, &inner.events, TeamStatus::Active)?;

            let run_input: Vec<(WorkItem, String)> = picked
                .iter()
                .map(|(item, agent_name, _)| (item.clone(), agent_name.clone()))
                .collect();
            let mut new_run = run::create_run(
                &file.team.id,
                &file.team.integration_branch,
                &run_input,
            );
            run::set_run_status(&mut new_run, RunStatus::Running)?;

            selections = new_run
                .tasks
                .iter()
                .map(|t| SpawnSpec {
                    run_id: new_run.id.clone(),
                    task_id: t.id.clone(),
                    work_item_id: t.work_item_id.clone().unwrap_or_default(),
                    agent_name: t.agent_name.clone(),
                    agent_id: picked
                        .iter()
                        .find(|(item, _, _)| Some(&item.id) == t.work_item_id.as_ref())
                        .map(|(_, _, id)| id.clone())
                        .unwrap_or_default(),
                    branch: t.branch.clone(),
                })
                .collect::<Vec<_>>();

            // Selected items leave the queue now
            for spec in &selections {
                set_work_item_status(
                    &mut file,
                    &inner.events,
                    &spec.work_item_id,
                    WorkItemStatus::InProgress,
                )?;
            }

            let run_id = new_run.id.clone();
            file.runs.push(new_run);
            events::emit(
                &inner.events,
                events::make_event(
                    events::EVENT_RUN_STARTED,
                    &file.team.id,
                    &serde_json::json!({ "runId": run_id }),
                ),
            );
        }
        persist(inner);

        inner.cancel.store(false, Ordering::SeqCst);
        inner.paused.store(false, Ordering::SeqCst);

        for spec in selections {
            tokio::spawn(supervise_task(inner.clone(), spec));
        }
        tokio::spawn(run_monitor(inner.clone()));

        log::info!("[TeamManager] Team started");
        Ok(())
    }

    /// Hold new turns and monitor sweeps; in-flight turns finish first.
    pub fn pause(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut file = lock_mutex_recover(&inner.state);
            set_team_status(&mut file, &inner.events, TeamStatus::Paused)?;
        }
        inner.paused.store(true, Ordering::SeqCst);
        persist(inner);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut file = lock_mutex_recover(&inner.state);
            set_team_status(&mut file, &inner.events, TeamStatus::Active)?;
        }
        inner.paused.store(false, Ordering::SeqCst);
        persist(inner);
        Ok(())
    }

    /// Cancel the run cooperatively and tear down the worktrees. Branches
    /// survive so no committed work is lost.
    pub fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        inner.cancel.store(true, Ordering::SeqCst);
        {
            let mut file = lock_mutex_recover(&inner.state);
            set_team_status(&mut file, &inner.events, TeamStatus::Stopped)?;

            if let Some(active) = file.runs.iter_mut().find(|r| !run_is_terminal(r.status)) {
                run::set_run_status(active, RunStatus::Cancelled)?;
            }
            let in_progress: Vec<String> = file
                .work_items
                .iter()
                .filter(|i| i.status == WorkItemStatus::InProgress)
                .map(|i| i.id.clone())
                .collect();
            for id in in_progress {
                set_work_item_status(&mut file, &inner.events, &id, WorkItemStatus::Cancelled)?;
            }
            let team_id = file.team.id.clone();
            for agent in &mut file.agents {
                if agent.status == AgentStatus::Idle {
                    continue;
                }
                agent.finish_work();
                emit_agent_status(&inner.events, &team_id, agent);
            }
        }
        persist(inner);

        lock_mutex_recover(&inner.pool).release_all();
        log::info!("[TeamManager] Team stopped");
        Ok(())
    }
}

#[derive(Clone)]
struct SpawnSpec {
    run_id: String,
    task_id: String,
    work_item_id: String,
    agent_name: String,
    agent_id: String,
    branch: String,
}

/// Drive one task through its session attempts, honoring the retry policy.
async fn supervise_task(inner: Arc<Inner>, spec: SpawnSpec) {
    let policy = RetryPolicy {
        max_retries: inner.config.max_retries,
    };

    loop {
        if inner.cancel.load(Ordering::SeqCst) {
            break;
        }
        while inner.paused.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if inner.cancel.load(Ordering::SeqCst) {
                return;
            }
        }

        let (work_item, integration_branch) = {
            let mut file = lock_mutex_recover(&inner.state);
            let item = match file.work_items.iter().find(|i| i.id == spec.work_item_id) {
                Some(i) => i.clone(),
                None => break,
            };
            let team_id = file.team.id.clone();
            let integration = file.team.integration_branch.clone();
            if let Some(active) = file.runs.iter_mut().find(|r| r.id == spec.run_id) {
                let run_id = active.id.clone();
                let old = task_status(active, &spec.task_id);
                if let Err(e) = run::start_task(active, &spec.task_id) {
                    log::error!("[TeamManager] Cannot start task {}: {}", spec.task_id, e);
                    break;
                }
                emit_task_status(&inner.events, &team_id, &run_id, active, &spec.task_id, old);
            }
            (item, integration)
        };

        // Bind the agent to its worktree before the first turn so the
        // `Working` invariant holds for the whole session.
        let acquired = {
            let mut pool = lock_mutex_recover(&inner.pool);
            pool.acquire(&spec.work_item_id, &spec.branch)
        };
        match acquired {
            Ok(allocation) => {
                let mut file = lock_mutex_recover(&inner.state);
                let team_id = file.team.id.clone();
                if let Some(agent) = file.agents.iter_mut().find(|a| a.id == spec.agent_id) {
                    agent.start_work(allocation.path.to_string_lossy(), &spec.branch);
                    emit_agent_status(&inner.events, &team_id, agent);
                }
                if let Some(active) = file.runs.iter_mut().find(|r| r.id == spec.run_id) {
                    if let Some(task) = active.tasks.iter_mut().find(|t| t.id == spec.task_id) {
                        task.worktree_path =
                            Some(allocation.path.to_string_lossy().to_string());
                    }
                }
            }
            Err(e) => {
                record_failure(&inner, &spec, &e, &policy);
                if !should_continue(&inner, &spec, &e, &policy) {
                    break;
                }
                continue;
            }
        }
        persist(&inner);

        let session = AgentSession::new(
            inner.repo_path.clone(),
            work_item,
            spec.branch.clone(),
            spec.agent_name.clone(),
            integration_branch,
            inner.capability.clone(),
            inner.pool.clone(),
            inner.cancel.clone(),
            inner.paused.clone(),
            inner.config.no_progress_turns,
        );
        let outcome = session.run().await;

        match outcome {
            Ok(SessionOutcome::Finished(report)) => {
                let mut file = lock_mutex_recover(&inner.state);
                let team_id = file.team.id.clone();
                if let Some(active) = file.runs.iter_mut().find(|r| r.id == spec.run_id) {
                    let old = task_status(active, &spec.task_id);
                    if let Err(e) = run::complete_task(active, &spec.task_id, &report) {
                        log::error!("[TeamManager] {}", e);
                    }
                    emit_task_status(
                        &inner.events,
                        &team_id,
                        &spec.run_id,
                        active,
                        &spec.task_id,
                        old,
                    );
                }
                if let Err(e) = set_work_item_status(
                    &mut file,
                    &inner.events,
                    &spec.work_item_id,
                    WorkItemStatus::PrReady,
                ) {
                    log::error!("[TeamManager] {}", e);
                }
                if let Some(item) = file
                    .work_items
                    .iter_mut()
                    .find(|i| i.id == spec.work_item_id)
                {
                    item.result = Some(WorkItemResult {
                        branch: report.branch.clone(),
                        commit_count: report.commit_count,
                        files_changed: report.files_changed,
                        merge_ref: None,
                    });
                }
                release_agent(&mut file, &inner.events, &spec.agent_id);
                drop(file);
                persist(&inner);
                break;
            }
            Ok(SessionOutcome::Cancelled(report)) => {
                let mut file = lock_mutex_recover(&inner.state);
                let team_id = file.team.id.clone();
                if let Some(active) = file.runs.iter_mut().find(|r| r.id == spec.run_id) {
                    let old = task_status(active, &spec.task_id);
                    // Committed work is recorded; the stop path cancels the item.
                    if let Err(e) = run::complete_task(active, &spec.task_id, &report) {
                        log::error!("[TeamManager] {}", e);
                    }
                    emit_task_status(
                        &inner.events,
                        &team_id,
                        &spec.run_id,
                        active,
                        &spec.task_id,
                        old,
                    );
                }
                release_agent(&mut file, &inner.events, &spec.agent_id);
                drop(file);
                persist(&inner);
                break;
            }
            Err(e) => {
                record_failure(&inner, &spec, &e, &policy);
                if !should_continue(&inner, &spec, &e, &policy) {
                    break;
                }
            }
        }
    }

    maybe_finish_run(&inner, &spec.run_id);
}

/// Mark the task failed and keep the telemetry trail.
fn record_failure(
    inner: &Arc<Inner>,
    spec: &SpawnSpec,
    error: &OrchestratorError,
    _policy: &RetryPolicy,
) {
    let mut file = lock_mutex_recover(&inner.state);
    let team_id = file.team.id.clone();
    if let Some(active) = file.runs.iter_mut().find(|r| r.id == spec.run_id) {
        let old = task_status(active, &spec.task_id);
        if let Err(e) = run::fail_task(active, &spec.task_id, &error.to_string(), None) {
            log::error!("[TeamManager] {}", e);
        }
        emit_task_status(
            &inner.events,
            &team_id,
            &spec.run_id,
            active,
            &spec.task_id,
            old,
        );
    }
    release_agent(&mut file, &inner.events, &spec.agent_id);
    drop(file);
    persist(inner);
}

/// Decide between another attempt and giving up. Giving up blocks the
/// work item for operator attention.
fn should_continue(
    inner: &Arc<Inner>,
    spec: &SpawnSpec,
    error: &OrchestratorError,
    policy: &RetryPolicy,
) -> bool {
    let mut file = lock_mutex_recover(&inner.state);
    let attempts = file
        .runs
        .iter()
        .find(|r| r.id == spec.run_id)
        .and_then(|r| r.tasks.iter().find(|t| t.id == spec.task_id))
        .map(|t| t.attempts)
        .unwrap_or(0);

    if !inner.cancel.load(Ordering::SeqCst) && policy.should_retry(error, attempts) {
        if let Some(active) = file.runs.iter_mut().find(|r| r.id == spec.run_id) {
            if run::retry_task(active, &spec.task_id).is_ok() {
                events::emit(
                    &inner.events,
                    events::make_event(
                        events::EVENT_TASK_RETRYING,
                        &file.team.id,
                        &serde_json::json!({
                            "taskId": spec.task_id,
                            "attempts": attempts,
                        }),
                    ),
                );
                drop(file);
                persist(inner);
                return true;
            }
        }
    }

    if let Err(e) = set_work_item_status(
        &mut file,
        &inner.events,
        &spec.work_item_id,
        WorkItemStatus::Blocked,
    ) {
        log::error!("[TeamManager] {}", e);
    }
    drop(file);
    persist(inner);
    false
}

/// The conflict monitor task for one started team.
async fn run_monitor(inner: Arc<Inner>) {
    let integration_branch = lock_mutex_recover(&inner.state)
        .team
        .integration_branch
        .clone();
    let monitor = ConflictMonitor::new(
        inner.repo_path.clone(),
        integration_branch,
        inner.analyzer.clone(),
        inner.merge_guard.clone(),
        inner.cancel.clone(),
        Duration::from_secs(inner.config.check_interval_secs),
        Duration::from_secs(inner.config.resolve_timeout_secs),
    );

    let provide_inner = inner.clone();
    let consume_inner = inner.clone();
    monitor
        .run_loop(
            move || watches_for_active_run(&provide_inner),
            move |outcome| apply_sweep_outcome(&consume_inner, outcome),
        )
        .await;
}

fn watches_for_active_run(inner: &Arc<Inner>) -> Vec<BranchWatch> {
    if inner.paused.load(Ordering::SeqCst) {
        return Vec::new();
    }
    let file = lock_mutex_recover(&inner.state);
    let active = match file.runs.iter().find(|r| !run_is_terminal(r.status)) {
        Some(r) => r,
        None => return Vec::new(),
    };

    active
        .tasks
        .iter()
        .filter(|t| t.attempts > 0)
        .filter_map(|t| {
            let item = t
                .work_item_id
                .as_ref()
                .and_then(|id| file.work_items.iter().find(|i| &i.id == id))?;
            match item.status {
                WorkItemStatus::InProgress | WorkItemStatus::PrReady => Some(BranchWatch {
                    branch: t.branch.clone(),
                    work_item_id: Some(item.id.clone()),
                    pr_ready: item.status == WorkItemStatus::PrReady,
                }),
                _ => None,
            }
        })
        .collect()
}

fn apply_sweep_outcome(inner: &Arc<Inner>, outcome: SweepOutcome) {
    let run_id;
    {
        let mut file = lock_mutex_recover(&inner.state);
        run_id = file
            .runs
            .iter()
            .find(|r| !run_is_terminal(r.status))
            .map(|r| r.id.clone());

        match outcome.action {
            SweepAction::Merged { commit_id } => {
                complete_merged_item(
                    &mut file,
                    inner,
                    outcome.work_item_id.as_deref(),
                    &outcome.branch,
                    &commit_id,
                );
            }
            SweepAction::AutoResolved {
                commit_id,
                conflicting_paths,
            } => {
                let team_id = file.team.id.clone();
                let target_branch = file.team.integration_branch.clone();
                events::emit(
                    &inner.events,
                    events::make_event(
                        events::EVENT_CONFLICT_AUTO_RESOLVED,
                        &team_id,
                        &events::ConflictPayload {
                            source_branch: outcome.branch.clone(),
                            target_branch: target_branch.clone(),
                            work_item_id: outcome.work_item_id.clone(),
                            conflicting_paths: conflicting_paths.clone(),
                            resolution: "auto_resolved".to_string(),
                        },
                    ),
                );
                file.conflicts.push(ConflictRecord {
                    source_branch: outcome.branch.clone(),
                    target_branch,
                    work_item_id: outcome.work_item_id.clone(),
                    conflicting_paths,
                    resolution: ConflictResolution::AutoResolved,
                    source_diff: None,
                    target_diff: None,
                    detected_at: Utc::now(),
                });
                complete_merged_item(
                    &mut file,
                    inner,
                    outcome.work_item_id.as_deref(),
                    &outcome.branch,
                    &commit_id,
                );
            }
            SweepAction::Escalated(record) => {
                // An already escalated branch stays escalated; repeat
                // sweeps must not stack duplicate records.
                let already_escalated = file.conflicts.iter().any(|c| {
                    c.source_branch == record.source_branch
                        && c.resolution == ConflictResolution::Escalated
                });
                if already_escalated {
                    return;
                }
                if let Some(work_item_id) = &outcome.work_item_id {
                    let status = file
                        .work_items
                        .iter()
                        .find(|i| &i.id == work_item_id)
                        .map(|i| i.status);
                    if matches!(
                        status,
                        Some(WorkItemStatus::InProgress | WorkItemStatus::PrReady)
                    ) {
                        if let Err(e) = set_work_item_status(
                            &mut file,
                            &inner.events,
                            work_item_id,
                            WorkItemStatus::Blocked,
                        ) {
                            log::error!("[TeamManager] {}", e);
                        }
                    }
                    lock_mutex_recover(&inner.pool).keep_for_review(work_item_id);
                }
                let team_id = file.team.id.clone();
                events::emit(
                    &inner.events,
                    events::make_event(
                        events::EVENT_CONFLICT_ESCALATED,
                        &team_id,
                        &events::ConflictPayload {
                            source_branch: record.source_branch.clone(),
                            target_branch: record.target_branch.clone(),
                            work_item_id: record.work_item_id.clone(),
                            conflicting_paths: record.conflicting_paths.clone(),
                            resolution: "escalated".to_string(),
                        },
                    ),
                );
                file.conflicts.push(record);
            }
            SweepAction::CleanPending | SweepAction::UpToDate => return,
        }
    }
    persist(inner);
    if let Some(run_id) = run_id {
        maybe_finish_run(inner, &run_id);
    }
}

/// Mark a merged branch's work item completed and drop its parked worktree.
fn complete_merged_item(
    file: &mut TeamFile,
    inner: &Arc<Inner>,
    work_item_id: Option<&str>,
    branch: &str,
    commit_id: &str,
) {
    if let Some(work_item_id) = work_item_id {
        if let Err(e) = set_work_item_status(
            file,
            &inner.events,
            work_item_id,
            WorkItemStatus::Completed,
        ) {
            log::error!("[TeamManager] {}", e);
        }
        if let Some(item) = file.work_items.iter_mut().find(|i| i.id == work_item_id) {
            item.completed_at = Some(Utc::now());
            if let Some(result) = &mut item.result {
                result.merge_ref = Some(commit_id.to_string());
            }
        }
        lock_mutex_recover(&inner.pool).remove_parked(work_item_id);
    }
    let team_id = file.team.id.clone();
    events::emit(
        &inner.events,
        events::make_event(
            events::EVENT_MERGE_COMPLETED,
            &team_id,
            &serde_json::json!({
                "branch": branch,
                "commitId": commit_id,
            }),
        ),
    );
}

/// Roll the run up once every task is terminal and nothing is left to
/// merge. Emits run:completed / run:failed.
fn maybe_finish_run(inner: &Arc<Inner>, run_id: &str) {
    let mut emit_event: Option<OrchestratorEvent> = None;
    {
        let mut file = lock_mutex_recover(&inner.state);
        let team_id = file.team.id.clone();
        let item_statuses: Vec<(String, WorkItemStatus)> = file
            .work_items
            .iter()
            .map(|i| (i.id.clone(), i.status))
            .collect();

        let active = match file.runs.iter_mut().find(|r| r.id == run_id) {
            Some(r) if !run_is_terminal(r.status) => r,
            _ => return,
        };
        if run::rollup_status(active).is_none() {
            return;
        }

        let status_of = |id: &Option<String>| {
            id.as_ref()
                .and_then(|id| item_statuses.iter().find(|(i, _)| i == id))
                .map(|(_, s)| *s)
        };
        let merges_pending = active
            .tasks
            .iter()
            .any(|t| status_of(&t.work_item_id) == Some(WorkItemStatus::PrReady));

        if merges_pending {
            if active.status == RunStatus::Running {
                if let Err(e) = run::set_run_status(active, RunStatus::Merging) {
                    log::error!("[TeamManager] {}", e);
                }
            }
            return;
        }

        let any_failed = active
            .tasks
            .iter()
            .any(|t| t.status == RunTaskStatus::Failed)
            || active
                .tasks
                .iter()
                .any(|t| status_of(&t.work_item_id) == Some(WorkItemStatus::Blocked));
        let target = if any_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        if let Err(e) = run::set_run_status(active, target) {
            log::error!("[TeamManager] {}", e);
            return;
        }

        let completed = active
            .tasks
            .iter()
            .filter(|t| t.status == RunTaskStatus::Completed)
            .count() as u32;
        let failed = active.tasks.len() as u32 - completed;
        let name = if target == RunStatus::Failed {
            events::EVENT_RUN_FAILED
        } else {
            events::EVENT_RUN_COMPLETED
        };
        emit_event = Some(events::make_event(
            name,
            &team_id,
            &events::RunCompletedPayload {
                run_id: active.id.clone(),
                status: format!("{:?}", target).to_lowercase(),
                completed_tasks: completed,
                failed_tasks: failed,
                error: active.error.clone(),
            },
        ));
        log::info!("[TeamManager] Run {} finished as {:?}", active.id, target);
    }
    if let Some(event) = emit_event {
        events::emit(&inner.events, event);
    }
    persist(inner);
}

fn release_agent(file: &mut TeamFile, events: &EventSink, agent_id: &str) {
    let team_id = file.team.id.clone();
    if let Some(agent) = file.agents.iter_mut().find(|a| a.id == agent_id) {
        agent.finish_work();
        emit_agent_status(events, &team_id, agent);
    }
}

fn emit_agent_status(events: &EventSink, team_id: &str, agent: &crate::models::AgentProfile) {
    events::emit(
        events,
        events::make_event(
            events::EVENT_AGENT_STATUS_CHANGED,
            team_id,
            &serde_json::json!({
                "agentId": agent.id,
                "name": agent.name,
                "status": agent.status,
                "currentBranch": agent.current_branch,
            }),
        ),
    );
}

fn task_status(run: &crate::models::Run, task_id: &str) -> Option<RunTaskStatus> {
    run.tasks.iter().find(|t| t.id == task_id).map(|t| t.status)
}

fn emit_task_status(
    events: &EventSink,
    team_id: &str,
    run_id: &str,
    run: &crate::models::Run,
    task_id: &str,
    old: Option<RunTaskStatus>,
) {
    let task = match run.tasks.iter().find(|t| t.id == task_id) {
        Some(t) => t,
        None => return,
    };
    events::emit(
        events,
        events::make_event(
            events::EVENT_TASK_STATUS_CHANGED,
            team_id,
            &events::TaskStatusChangedPayload {
                task_id: task.id.clone(),
                run_id: run_id.to_string(),
                work_item_id: task.work_item_id.clone(),
                old_status: old
                    .map(|s| format!("{:?}", s).to_lowercase())
                    .unwrap_or_else(|| "unknown".to_string()),
                new_status: format!("{:?}", task.status).to_lowercase(),
            },
        ),
    );
}

fn set_team_status(file: &mut TeamFile, events: &EventSink, target: TeamStatus) -> Result<()> {
    let old = file.team.status;
    file.team.status = transition_team(old, target)?;
    file.team.updated_at = Utc::now();
    events::emit(
        events,
        events::make_event(
            events::EVENT_TEAM_STATUS_CHANGED,
            &file.team.id,
            &events::TeamStatusChangedPayload {
                team_id: file.team.id.clone(),
                old_status: format!("{:?}", old).to_lowercase(),
                new_status: format!("{:?}", target).to_lowercase(),
            },
        ),
    );
    Ok(())
}

fn set_work_item_status(
    file: &mut TeamFile,
    events: &EventSink,
    work_item_id: &str,
    target: WorkItemStatus,
) -> Result<()> {
    let team_id = file.team.id.clone();
    let item = file
        .work_items
        .iter_mut()
        .find(|i| i.id == work_item_id)
        .ok_or_else(|| {
            OrchestratorError::Invariant(format!("work item {} not in aggregate", work_item_id))
        })?;
    let old = item.status;
    item.status = transition_work_item(old, target)?;
    if target == WorkItemStatus::InProgress && item.started_at.is_none() {
        item.started_at = Some(Utc::now());
    }
    events::emit(
        events,
        events::make_event(
            events::EVENT_WORK_ITEM_STATUS_CHANGED,
            &team_id,
            &events::WorkItemStatusChangedPayload {
                work_item_id: work_item_id.to_string(),
                old_status: old.as_str().to_string(),
                new_status: target.as_str().to_string(),
            },
        ),
    );
    Ok(())
}

/// Persist the aggregate; a storage failure moves the team to `error`.
fn persist(inner: &Arc<Inner>) {
    let file = lock_mutex_recover(&inner.state).clone();
    if let Err(e) = inner.store.save_team(&file) {
        log::error!("[TeamManager] Failed to persist team state: {}", e);
        let mut file = lock_mutex_recover(&inner.state);
        // Error is reachable from every state
        if set_team_status(&mut file, &inner.events, TeamStatus::Error).is_err() {
            file.team.status = TeamStatus::Error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::scripted::ScriptedCapability;
    use crate::capability::DisjointRegionAnalyzer;
    use crate::models::{AgentProfile, TaskTelemetry, Team};
    use crate::session::SessionReport;
    use crate::storage::MemoryTeamStore;
    use git2::{Repository, Signature};
    use std::path::Path;
    use tempfile::TempDir;

    fn init_repo(path: &Path) -> String {
        let repo = Repository::init(path).unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let tree_id = {
            std::fs::write(path.join("README.md"), "init\n").unwrap();
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("README.md")).unwrap();
            index.write().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();
        let head = repo.head().unwrap();
        head.shorthand().unwrap().to_string()
    }

    fn team_file(repo: &Path, integration: &str, items: usize, agents: usize) -> TeamFile {
        let mut team = Team::new("alpha", repo.to_string_lossy());
        team.integration_branch = integration.to_string();
        team.max_concurrent_tasks = 2;
        let mut file = TeamFile::new(team);
        for i in 0..items {
            let mut item = WorkItem::new(format!("item {}", i), i as i32);
            item.team_id = Some(file.team.id.clone());
            file.work_items.push(item);
        }
        for i in 0..agents {
            file.agents.push(AgentProfile::new(
                &file.team.id,
                format!("agent-{}", i),
                "implementer",
            ));
        }
        file
    }

    fn config(integration: &str) -> OrchestratorConfig {
        OrchestratorConfig {
            integration_branch: integration.to_string(),
            check_interval_secs: 1,
            max_concurrent_tasks: 2,
            max_retries: 1,
            no_progress_turns: 2,
            resolve_timeout_secs: 30,
        }
    }

    fn manager(
        file: TeamFile,
        capability: ScriptedCapability,
        integration: &str,
    ) -> (TeamManager, tokio::sync::mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let manager = TeamManager::new(
            file,
            Arc::new(MemoryTeamStore::new()),
            Arc::new(capability),
            Arc::new(DisjointRegionAnalyzer),
            tx,
            config(integration),
        )
        .unwrap();
        (manager, rx)
    }

    async fn wait_until<F: Fn(&TeamFile) -> bool>(manager: &TeamManager, pred: F) -> TeamFile {
        for _ in 0..100 {
            let snapshot = manager.snapshot();
            if pred(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached; last state: {:?}", manager.snapshot().runs);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_run_merges_work_item() {
        let temp_dir = TempDir::new().unwrap();
        let integration = init_repo(temp_dir.path());

        let file = team_file(temp_dir.path(), &integration, 1, 1);
        let capability =
            ScriptedCapability::write_then_done("agent-0", "feature.txt", "done\n");
        let (manager, mut rx) = manager(file, capability, &integration);

        manager.start().unwrap();
        assert_eq!(manager.status(), TeamStatus::Active);

        let final_state = wait_until(&manager, |f| {
            f.runs
                .first()
                .map(|r| r.status == RunStatus::Completed)
                .unwrap_or(false)
        })
        .await;

        let item = &final_state.work_items[0];
        assert_eq!(item.status, WorkItemStatus::Completed);
        let result = item.result.as_ref().expect("completion result recorded");
        assert_eq!(result.commit_count, 1);
        assert!(result.merge_ref.is_some());

        // The merged file is reachable from the integration branch
        let git = crate::git::GitManager::open(temp_dir.path()).unwrap();
        let diff = git.recent_commits(&integration, 1).unwrap();
        assert!(!diff.is_empty());

        // Every transition along the way produced an event
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name);
        }
        for expected in [
            events::EVENT_TEAM_STATUS_CHANGED,
            events::EVENT_RUN_STARTED,
            events::EVENT_AGENT_STATUS_CHANGED,
            events::EVENT_TASK_STATUS_CHANGED,
            events::EVENT_WORK_ITEM_STATUS_CHANGED,
            events::EVENT_MERGE_COMPLETED,
            events::EVENT_RUN_COMPLETED,
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }

        manager.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrency_capped_by_capacity() {
        let temp_dir = TempDir::new().unwrap();
        let integration = init_repo(temp_dir.path());

        // 3 queued items but capacity 2: the run takes exactly 2 tasks
        let file = team_file(temp_dir.path(), &integration, 3, 3);
        let capability = ScriptedCapability::new("agent", vec![]);
        let (manager, _rx) = manager(file, capability, &integration);

        manager.start().unwrap();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.runs[0].tasks.len(), 2);
        let in_progress = snapshot
            .work_items
            .iter()
            .filter(|i| i.status == WorkItemStatus::InProgress)
            .count();
        assert_eq!(in_progress, 2);
        let queued = snapshot
            .work_items
            .iter()
            .filter(|i| i.status == WorkItemStatus::Queued)
            .count();
        assert_eq!(queued, 1);

        manager.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_progress_retries_once_then_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let integration = init_repo(temp_dir.path());

        let file = team_file(temp_dir.path(), &integration, 1, 1);
        // Empty script: every turn is NoChanges, so each attempt times out
        let capability = ScriptedCapability::new("agent-0", vec![]);
        let (manager, _rx) = manager(file, capability, &integration);

        manager.start().unwrap();
        let final_state = wait_until(&manager, |f| {
            f.work_items[0].status == WorkItemStatus::Blocked
        })
        .await;

        let task = &final_state.runs[0].tasks[0];
        assert_eq!(task.status, RunTaskStatus::Failed);
        assert_eq!(task.attempts, 2); // first try + one retry
        assert!(task.error.as_deref().unwrap_or("").contains("no progress"));

        let run_state = wait_until(&manager, |f| {
            f.runs[0].status == RunStatus::Failed
        })
        .await;
        assert_eq!(run_state.runs[0].status, RunStatus::Failed);

        manager.stop().unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_readiness() {
        let temp_dir = TempDir::new().unwrap();
        let integration = init_repo(temp_dir.path());

        // No agents: NoIdleAgentCapacity
        let file = team_file(temp_dir.path(), &integration, 1, 0);
        let capability = ScriptedCapability::new("agent", vec![]);
        let (manager, _rx) = manager(file, capability, &integration);

        let result = manager.start();
        assert!(matches!(result, Err(OrchestratorError::Transition(_))));
        assert_eq!(manager.status(), TeamStatus::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_resume_stop_cycle() {
        let temp_dir = TempDir::new().unwrap();
        let integration = init_repo(temp_dir.path());

        let file = team_file(temp_dir.path(), &integration, 1, 1);
        let capability = ScriptedCapability::new("agent-0", vec![]);
        let (manager, _rx) = manager(file, capability, &integration);

        manager.start().unwrap();
        manager.pause().unwrap();
        assert_eq!(manager.status(), TeamStatus::Paused);
        manager.resume().unwrap();
        assert_eq!(manager.status(), TeamStatus::Active);
        manager.stop().unwrap();
        assert_eq!(manager.status(), TeamStatus::Stopped);

        // Stopping from stopped is a no-op transition
        manager.stop().unwrap();
    }

    #[tokio::test]
    async fn test_pause_from_stopped_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let integration = init_repo(temp_dir.path());
        let file = team_file(temp_dir.path(), &integration, 1, 1);
        let capability = ScriptedCapability::new("agent", vec![]);
        let (manager, _rx) = manager(file, capability, &integration);

        assert!(manager.pause().is_err());
    }

    #[tokio::test]
    async fn test_start_stays_stopped_when_no_agent_matches() {
        let temp_dir = TempDir::new().unwrap();
        let integration = init_repo(temp_dir.path());

        // Readiness passes (queued work, idle agent), but the only item
        // needs a specialization the agent lacks
        let mut file = team_file(temp_dir.path(), &integration, 1, 1);
        file.work_items[0].required_specialization = Some("database".to_string());
        let capability = ScriptedCapability::new("agent-0", vec![]);
        let (manager, _rx) = manager(file, capability, &integration);

        let result = manager.start();
        assert!(matches!(result, Err(OrchestratorError::Transition(_))));
        assert_eq!(manager.status(), TeamStatus::Stopped);
        assert!(manager.snapshot().runs.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_merges_use_team_integration_branch() {
        let temp_dir = TempDir::new().unwrap();
        let integration = init_repo(temp_dir.path());

        let file = team_file(temp_dir.path(), &integration, 1, 1);
        let capability =
            ScriptedCapability::write_then_done("agent-0", "feature.txt", "done\n");

        // The config default names a branch this repository does not have;
        // the team's own integration branch must win everywhere
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let manager = TeamManager::new(
            file,
            Arc::new(MemoryTeamStore::new()),
            Arc::new(capability),
            Arc::new(DisjointRegionAnalyzer),
            tx,
            config("fleet-default-branch"),
        )
        .unwrap();

        manager.start().unwrap();
        let final_state = wait_until(&manager, |f| {
            f.runs
                .first()
                .map(|r| r.status == RunStatus::Completed)
                .unwrap_or(false)
        })
        .await;

        assert_eq!(final_state.runs[0].integration_branch, integration);
        assert!(final_state.work_items[0]
            .result
            .as_ref()
            .and_then(|r| r.merge_ref.as_ref())
            .is_some());
        // The task landed on the team's branch, not the config default
        let git = crate::git::GitManager::open(temp_dir.path()).unwrap();
        let commits = git.recent_commits(&integration, 5).unwrap();
        assert!(commits.len() > 1);

        manager.stop().unwrap();
    }

    /// Put one pr_ready work item with a completed task into the aggregate,
    /// as if its session just finished. Returns the item id and task branch.
    fn seed_finished_task(manager: &TeamManager, integration: &str) -> (String, String) {
        let mut file = lock_mutex_recover(&manager.inner.state);
        let item = file.work_items[0].clone();
        let mut run = run::create_run(
            &file.team.id,
            integration,
            &[(item.clone(), "agent-0".to_string())],
        );
        run::set_run_status(&mut run, RunStatus::Running).unwrap();
        let task_id = run.tasks[0].id.clone();
        let branch = run.tasks[0].branch.clone();
        run::start_task(&mut run, &task_id).unwrap();
        let report = SessionReport {
            branch: branch.clone(),
            commit_count: 1,
            files_changed: 1,
            telemetry: TaskTelemetry::default(),
        };
        run::complete_task(&mut run, &task_id, &report).unwrap();
        file.work_items[0].status = WorkItemStatus::PrReady;
        file.work_items[0].result = Some(WorkItemResult {
            branch: branch.clone(),
            commit_count: 1,
            files_changed: 1,
            merge_ref: None,
        });
        file.runs.push(run);
        (item.id, branch)
    }

    #[tokio::test]
    async fn test_escalated_conflict_blocks_item_once_and_fails_run() {
        let temp_dir = TempDir::new().unwrap();
        let integration = init_repo(temp_dir.path());
        let file = team_file(temp_dir.path(), &integration, 1, 1);
        let capability = ScriptedCapability::new("agent-0", vec![]);
        let (manager, mut rx) = manager(file, capability, &integration);

        let (item_id, branch) = seed_finished_task(&manager, &integration);
        let record = ConflictRecord {
            source_branch: branch.clone(),
            target_branch: integration.clone(),
            work_item_id: Some(item_id.clone()),
            conflicting_paths: vec!["shared.txt".to_string()],
            resolution: ConflictResolution::Escalated,
            source_diff: None,
            target_diff: None,
            detected_at: Utc::now(),
        };

        // The monitor sweeping the same conflict repeatedly must settle
        // after the first escalation
        for _ in 0..3 {
            apply_sweep_outcome(
                &manager.inner,
                SweepOutcome {
                    branch: branch.clone(),
                    work_item_id: Some(item_id.clone()),
                    action: SweepAction::Escalated(record.clone()),
                },
            );
        }

        let state = manager.snapshot();
        assert_eq!(state.work_items[0].status, WorkItemStatus::Blocked);
        assert_eq!(state.conflicts.len(), 1);
        assert_eq!(state.runs[0].status, RunStatus::Failed);
        // A blocked branch leaves the watch set
        assert!(watches_for_active_run(&manager.inner).is_empty());

        let mut escalations = 0;
        while let Ok(event) = rx.try_recv() {
            if event.name == events::EVENT_CONFLICT_ESCALATED {
                escalations += 1;
            }
        }
        assert_eq!(escalations, 1);
    }

    #[tokio::test]
    async fn test_auto_resolved_sweep_completes_item_and_emits_events() {
        let temp_dir = TempDir::new().unwrap();
        let integration = init_repo(temp_dir.path());
        let file = team_file(temp_dir.path(), &integration, 1, 1);
        let capability = ScriptedCapability::new("agent-0", vec![]);
        let (manager, mut rx) = manager(file, capability, &integration);

        let (item_id, branch) = seed_finished_task(&manager, &integration);
        apply_sweep_outcome(
            &manager.inner,
            SweepOutcome {
                branch,
                work_item_id: Some(item_id),
                action: SweepAction::AutoResolved {
                    commit_id: "abc1234".to_string(),
                    conflicting_paths: vec!["shared.txt".to_string()],
                },
            },
        );

        let state = manager.snapshot();
        assert_eq!(state.work_items[0].status, WorkItemStatus::Completed);
        assert_eq!(
            state.work_items[0].result.as_ref().unwrap().merge_ref.as_deref(),
            Some("abc1234")
        );
        assert_eq!(state.conflicts.len(), 1);
        assert_eq!(
            state.conflicts[0].resolution,
            ConflictResolution::AutoResolved
        );
        assert_eq!(state.runs[0].status, RunStatus::Completed);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name);
        }
        assert!(names.iter().any(|n| n == events::EVENT_CONFLICT_AUTO_RESOLVED));
        assert!(names.iter().any(|n| n == events::EVENT_MERGE_COMPLETED));
    }
}
