// Domain records shared across the orchestration core

pub mod state_machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    Active,
    Paused,
    Stopped,
    Error,
}

/// A team of agents bound to one repository. Status is mutated only by the
/// lifecycle manager; everything else comes from the external CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub name: String,
    pub repo_path: String,
    pub integration_branch: String,
    pub max_concurrent_tasks: usize,
    pub status: TeamStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Team {
    pub fn new(name: impl Into<String>, repo_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            repo_path: repo_path.into(),
            integration_branch: "main".to_string(),
            max_concurrent_tasks: 3,
            status: TeamStatus::Stopped,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Blocked,
    Error,
}

/// One coding agent belonging to a team.
///
/// Invariant: `status == Working` exactly when the agent owns one checked-out
/// worktree and branch (`worktree_path` and `current_branch` are both set).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub role: String,
    /// Optional specialization tag matched against work item requirements.
    pub specialization: Option<String>,
    pub status: AgentStatus,
    pub worktree_path: Option<String>,
    pub current_branch: Option<String>,
    pub last_active_at: DateTime<Utc>,
}

impl AgentProfile {
    pub fn new(team_id: impl Into<String>, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            team_id: team_id.into(),
            name: name.into(),
            role: role.into(),
            specialization: None,
            status: AgentStatus::Idle,
            worktree_path: None,
            current_branch: None,
            last_active_at: Utc::now(),
        }
    }

    /// Bind the agent to a worktree/branch pair and mark it working.
    pub fn start_work(&mut self, worktree_path: impl Into<String>, branch: impl Into<String>) {
        self.status = AgentStatus::Working;
        self.worktree_path = Some(worktree_path.into());
        self.current_branch = Some(branch.into());
        self.last_active_at = Utc::now();
    }

    /// Release the worktree binding and return to idle.
    pub fn finish_work(&mut self) {
        self.status = AgentStatus::Idle;
        self.worktree_path = None;
        self.current_branch = None;
        self.last_active_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Queued,
    InProgress,
    PrReady,
    Completed,
    Blocked,
    Cancelled,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Queued => "queued",
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::PrReady => "pr_ready",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Blocked => "blocked",
            WorkItemStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Estimated story size (S/M/L/XL).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorySize {
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl std::str::FromStr for StorySize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "small" | "s" => Ok(StorySize::Small),
            "medium" | "m" => Ok(StorySize::Medium),
            "large" | "l" => Ok(StorySize::Large),
            "extra_large" | "xl" => Ok(StorySize::ExtraLarge),
            _ => Err(format!(
                "Invalid story size: '{}'. Expected 's', 'm', 'l', or 'xl'",
                s
            )),
        }
    }
}

/// Completion results recorded when a work item's branch is finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemResult {
    pub branch: String,
    pub commit_count: usize,
    pub files_changed: usize,
    /// Merge commit id or PR reference, once the branch landed.
    pub merge_ref: Option<String>,
}

/// A unit of work queued for a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    /// External origin tag, e.g. an issue tracker name or "manual".
    pub source: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    /// Lower value = higher priority.
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_size: Option<StorySize>,
    pub status: WorkItemStatus,
    pub team_id: Option<String>,
    /// Specialization an agent should have to pick this up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_specialization: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkItemResult>,
}

impl WorkItem {
    pub fn new(title: impl Into<String>, priority: i32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: "manual".to_string(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: String::new(),
            priority,
            story_size: None,
            status: WorkItemStatus::Queued,
            team_id: None,
            required_specialization: None,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

/// One orchestration session for a team: a batch of work items processed to
/// completion (or failure) against one integration branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub team_id: String,
    pub session_token: String,
    pub status: RunStatus,
    pub integration_branch: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub tasks: Vec<RunTask>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

/// One task within a run, tracking a single work item's branch.
///
/// Invariant: the branch is unique within the owning run, and at most one
/// run task is `Running` against a given work item at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTask {
    pub id: String,
    pub run_id: String,
    pub work_item_id: Option<String>,
    pub agent_name: String,
    pub branch: String,
    pub worktree_path: Option<String>,
    pub status: RunTaskStatus,
    pub telemetry: TaskTelemetry,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Snapshot of the agent process taken while a task runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetrics {
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A single git-side action taken on behalf of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitActivityEntry {
    pub timestamp: DateTime<Utc>,
    /// "commit", "branch", "worktree", "merge", "push"
    pub action: String,
    pub detail: String,
}

/// Telemetry payload carried by each run task for the read model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTelemetry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessMetrics>,
    pub tokens: TokenUsage,
    pub git_activity: Vec<GitActivityEntry>,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    NoConflict,
    AutoResolved,
    Escalated,
}

/// Monitor-internal record of one branch-pair evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub source_branch: String,
    pub target_branch: String,
    pub work_item_id: Option<String>,
    pub conflicting_paths: Vec<String>,
    pub resolution: ConflictResolution,
    /// Diffstat summaries of each side against the merge base, kept for
    /// operator review when escalated.
    pub source_diff: Option<String>,
    pub target_diff: Option<String>,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_status_serialization() {
        let json = serde_json::to_string(&WorkItemStatus::PrReady).unwrap();
        assert_eq!(json, "\"pr_ready\"");
        assert_eq!(WorkItemStatus::InProgress.as_str(), "in_progress");
    }

    #[test]
    fn test_story_size_from_str() {
        assert_eq!("xl".parse::<StorySize>().unwrap(), StorySize::ExtraLarge);
        assert_eq!("M".parse::<StorySize>().unwrap(), StorySize::Medium);
        assert!("huge".parse::<StorySize>().is_err());
    }

    #[test]
    fn test_agent_work_binding_invariant() {
        let mut agent = AgentProfile::new("team-1", "alice", "implementer");
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.worktree_path.is_none());

        agent.start_work("/tmp/wt", "task/abc");
        assert_eq!(agent.status, AgentStatus::Working);
        assert!(agent.worktree_path.is_some());
        assert!(agent.current_branch.is_some());

        agent.finish_work();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.worktree_path.is_none());
        assert!(agent.current_branch.is_none());
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            input_tokens: 120,
            output_tokens: 80,
        };
        assert_eq!(usage.total(), 200);
    }
}
