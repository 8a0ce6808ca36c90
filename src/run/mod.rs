//! Run and task tracking
//!
//! A run is one orchestration session for a team: one pending task per
//! selected work item, each on its own branch. All status changes go
//! through the validated state machines; telemetry accumulates on the
//! task as sessions report in.

use crate::error::Result;
use crate::models::state_machine::{
    run_task_is_terminal, transition_run, transition_run_task,
};
use crate::models::{
    ProcessMetrics, Run, RunStatus, RunTask, RunTaskStatus, TaskTelemetry, WorkItem,
};
use crate::session::SessionReport;
use crate::utils::sanitize_branch_name;
use chrono::Utc;
use sysinfo::{Pid, System};

/// Bounded retry policy. Only transient errors (timeouts, raw git
/// failures) qualify; merge escalations and capability failures never do.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

impl RetryPolicy {
    /// `attempts` counts tries already made, including the failing one.
    pub fn should_retry(&self, error: &crate::error::OrchestratorError, attempts: u32) -> bool {
        error.is_transient() && attempts <= self.max_retries
    }
}

/// Create a pending run for the selected work items. Each task gets a
/// branch derived from its work item id, unique within the run.
pub fn create_run(
    team_id: &str,
    integration_branch: &str,
    selections: &[(WorkItem, String)],
) -> Run {
    let run_id = uuid::Uuid::new_v4().to_string();
    let tasks = selections
        .iter()
        .map(|(item, agent_name)| RunTask {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.clone(),
            work_item_id: Some(item.id.clone()),
            agent_name: agent_name.clone(),
            branch: format!("task/{}", sanitize_branch_name(&item.id)),
            worktree_path: None,
            status: RunTaskStatus::Pending,
            telemetry: TaskTelemetry::default(),
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        })
        .collect();

    Run {
        id: run_id,
        team_id: team_id.to_string(),
        session_token: uuid::Uuid::new_v4().to_string(),
        status: RunStatus::Pending,
        integration_branch: integration_branch.to_string(),
        started_at: None,
        completed_at: None,
        error: None,
        tasks,
    }
}

/// Move the run itself to a new status, validated.
pub fn set_run_status(run: &mut Run, target: RunStatus) -> Result<()> {
    run.status = transition_run(run.status, target)?;
    match target {
        RunStatus::Running if run.started_at.is_none() => {
            run.started_at = Some(Utc::now());
        }
        RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => {
            run.completed_at = Some(Utc::now());
        }
        _ => {}
    }
    Ok(())
}

fn task_mut<'a>(run: &'a mut Run, task_id: &str) -> Option<&'a mut RunTask> {
    run.tasks.iter_mut().find(|t| t.id == task_id)
}

/// Mark a task running, counting the attempt. Valid from pending (first
/// try) and retrying (subsequent tries).
pub fn start_task(run: &mut Run, task_id: &str) -> Result<()> {
    if let Some(task) = task_mut(run, task_id) {
        task.status = transition_run_task(task.status, RunTaskStatus::Running)?;
        task.attempts += 1;
        task.started_at = Some(Utc::now());
        log::info!(
            "[RunTracker] Task {} running on branch {} (attempt {})",
            task.id,
            task.branch,
            task.attempts
        );
    }
    Ok(())
}

/// Record a successful session on the task.
pub fn complete_task(run: &mut Run, task_id: &str, report: &SessionReport) -> Result<()> {
    if let Some(task) = task_mut(run, task_id) {
        task.status = transition_run_task(task.status, RunTaskStatus::Completed)?;
        task.completed_at = Some(Utc::now());
        merge_telemetry(&mut task.telemetry, &report.telemetry);
        log::info!(
            "[RunTracker] Task {} completed: {} commit(s), {} file(s) changed",
            task.id,
            report.commit_count,
            report.files_changed
        );
    }
    Ok(())
}

/// Record a failed session, keeping any telemetry it produced.
pub fn fail_task(
    run: &mut Run,
    task_id: &str,
    error: &str,
    telemetry: Option<&TaskTelemetry>,
) -> Result<()> {
    if let Some(task) = task_mut(run, task_id) {
        task.status = transition_run_task(task.status, RunTaskStatus::Failed)?;
        task.completed_at = Some(Utc::now());
        task.error = Some(error.to_string());
        if let Some(t) = telemetry {
            merge_telemetry(&mut task.telemetry, t);
        }
        log::warn!("[RunTracker] Task {} failed: {}", task.id, error);
    }
    Ok(())
}

/// Queue a failed task for another attempt.
pub fn retry_task(run: &mut Run, task_id: &str) -> Result<()> {
    if let Some(task) = task_mut(run, task_id) {
        task.status = transition_run_task(task.status, RunTaskStatus::Retrying)?;
        task.error = None;
        task.completed_at = None;
        log::info!("[RunTracker] Task {} queued for retry", task.id);
    }
    Ok(())
}

/// Roll the run status up from its tasks once every task is terminal.
/// Returns the terminal status, or `None` while tasks are still in flight.
pub fn rollup_status(run: &Run) -> Option<RunStatus> {
    if run.tasks.iter().all(|t| run_task_is_terminal(t.status)) {
        if run.tasks.iter().any(|t| t.status == RunTaskStatus::Failed) {
            Some(RunStatus::Failed)
        } else {
            Some(RunStatus::Completed)
        }
    } else {
        None
    }
}

fn merge_telemetry(into: &mut TaskTelemetry, from: &TaskTelemetry) {
    into.tokens.input_tokens += from.tokens.input_tokens;
    into.tokens.output_tokens += from.tokens.output_tokens;
    into.git_activity.extend(from.git_activity.iter().cloned());
    into.logs.extend(from.logs.iter().cloned());
    if from.process.is_some() {
        into.process = from.process.clone();
    }
}

/// Sample CPU and memory for a capability's process, when it has one.
/// Returns `None` for in-process capabilities or exited pids.
pub fn sample_process(pid: u32) -> Option<ProcessMetrics> {
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    let process = system.process(Pid::from_u32(pid))?;
    Some(ProcessMetrics {
        pid,
        cpu_percent: process.cpu_usage(),
        memory_bytes: process.memory(),
        sampled_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;

    fn sample_run() -> Run {
        let items = vec![
            (WorkItem::new("first", 1), "alice".to_string()),
            (WorkItem::new("second", 2), "bob".to_string()),
        ];
        create_run("team-1", "main", &items)
    }

    fn sample_report(branch: &str) -> SessionReport {
        SessionReport {
            branch: branch.to_string(),
            commit_count: 2,
            files_changed: 3,
            telemetry: TaskTelemetry::default(),
        }
    }

    #[test]
    fn test_create_run_shapes_tasks() {
        let run = sample_run();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.tasks.len(), 2);
        assert!(!run.session_token.is_empty());

        // One branch per task, unique within the run
        assert_ne!(run.tasks[0].branch, run.tasks[1].branch);
        assert!(run.tasks[0].branch.starts_with("task/"));
        assert!(run.tasks.iter().all(|t| t.status == RunTaskStatus::Pending));
    }

    #[test]
    fn test_task_lifecycle_and_rollup() {
        let mut run = sample_run();
        set_run_status(&mut run, RunStatus::Running).unwrap();
        assert!(run.started_at.is_some());

        let (t1, t2) = (run.tasks[0].id.clone(), run.tasks[1].id.clone());
        start_task(&mut run, &t1).unwrap();
        start_task(&mut run, &t2).unwrap();
        assert!(rollup_status(&run).is_none());

        let branch = run.tasks[0].branch.clone();
        complete_task(&mut run, &t1, &sample_report(&branch)).unwrap();
        fail_task(&mut run, &t2, "no progress", None).unwrap();

        assert_eq!(rollup_status(&run), Some(RunStatus::Failed));
        assert_eq!(run.tasks[0].attempts, 1);
        assert_eq!(run.tasks[1].error.as_deref(), Some("no progress"));
    }

    #[test]
    fn test_retry_path() {
        let mut run = sample_run();
        set_run_status(&mut run, RunStatus::Running).unwrap();
        let t1 = run.tasks[0].id.clone();

        start_task(&mut run, &t1).unwrap();
        fail_task(&mut run, &t1, "timed out", None).unwrap();
        retry_task(&mut run, &t1).unwrap();
        assert_eq!(run.tasks[0].status, RunTaskStatus::Retrying);

        start_task(&mut run, &t1).unwrap();
        assert_eq!(run.tasks[0].status, RunTaskStatus::Running);
        assert_eq!(run.tasks[0].attempts, 2);
        assert!(run.tasks[0].error.is_none());
    }

    #[test]
    fn test_completed_task_cannot_restart() {
        let mut run = sample_run();
        set_run_status(&mut run, RunStatus::Running).unwrap();
        let t1 = run.tasks[0].id.clone();
        let branch = run.tasks[0].branch.clone();

        start_task(&mut run, &t1).unwrap();
        complete_task(&mut run, &t1, &sample_report(&branch)).unwrap();
        assert!(start_task(&mut run, &t1).is_err());
    }

    #[test]
    fn test_retry_policy_bounds() {
        let policy = RetryPolicy::default();
        let transient = OrchestratorError::Timeout("no progress".into());
        let escalation = OrchestratorError::MergeConflict(vec!["a.rs".into()]);

        assert!(policy.should_retry(&transient, 1));
        assert!(!policy.should_retry(&transient, 2)); // budget spent
        assert!(!policy.should_retry(&escalation, 1)); // never for conflicts
    }

    #[test]
    fn test_rollup_all_completed() {
        let mut run = sample_run();
        set_run_status(&mut run, RunStatus::Running).unwrap();
        for id in run.tasks.iter().map(|t| t.id.clone()).collect::<Vec<_>>() {
            start_task(&mut run, &id).unwrap();
            let branch = run
                .tasks
                .iter()
                .find(|t| t.id == id)
                .map(|t| t.branch.clone())
                .unwrap();
            complete_task(&mut run, &id, &sample_report(&branch)).unwrap();
        }
        assert_eq!(rollup_status(&run), Some(RunStatus::Completed));
    }

    #[test]
    fn test_sample_own_process() {
        let metrics = sample_process(std::process::id());
        // Our own pid always exists
        let metrics = metrics.expect("own process should be visible");
        assert_eq!(metrics.pid, std::process::id());
    }
}
