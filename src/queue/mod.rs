//! Work queue ordering, assignment, and readiness checks
//!
//! Pure functions over the team aggregate. Ordering is priority ascending
//! (lower value first) with creation time as the tie-breaker, so the queue
//! is deterministic for equal priorities.

use crate::git::GitManager;
use crate::models::{AgentProfile, AgentStatus, Team, WorkItem, WorkItemStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Queued items in dispatch order.
pub fn queued_in_order(items: &[WorkItem]) -> Vec<&WorkItem> {
    let mut queued: Vec<&WorkItem> = items
        .iter()
        .filter(|i| i.status == WorkItemStatus::Queued)
        .collect();
    queued.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
    queued
}

/// A work item paired with the agent chosen to drive it.
#[derive(Debug)]
pub struct Selection<'a> {
    pub work_item: &'a WorkItem,
    pub agent: &'a AgentProfile,
}

/// Pick up to `capacity` queued items and pair each with an idle agent.
///
/// Items requiring a specialization only match agents carrying that tag.
/// Items without a requirement prefer unspecialized agents so specialists
/// stay free for the work that needs them.
pub fn select_for_capacity<'a>(
    items: &'a [WorkItem],
    agents: &'a [AgentProfile],
    capacity: usize,
) -> Vec<Selection<'a>> {
    let mut idle: Vec<&AgentProfile> = agents
        .iter()
        .filter(|a| a.status == AgentStatus::Idle)
        .collect();
    let mut selections = Vec::new();

    for item in queued_in_order(items) {
        if selections.len() >= capacity || idle.is_empty() {
            break;
        }

        let pick = match &item.required_specialization {
            Some(spec) => idle
                .iter()
                .position(|a| a.specialization.as_deref() == Some(spec.as_str())),
            None => idle
                .iter()
                .position(|a| a.specialization.is_none())
                .or(Some(0)),
        };

        if let Some(idx) = pick {
            selections.push(Selection {
                work_item: item,
                agent: idle.remove(idx),
            });
        }
        // No matching agent: the item stays queued for a later sweep.
    }

    selections
}

/// Per-item outcome of a bulk assignment. There is no rollback; each item
/// succeeds or fails on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AssignOutcome {
    Assigned { work_item_id: String },
    Skipped { work_item_id: String, reason: String },
}

/// Assign every listed item to `team_id`. Items not in `queued` status or
/// already owned by another team are skipped with a reason; the rest are
/// stamped and left queued until the team starts.
pub fn bulk_assign(items: &mut [WorkItem], ids: &[String], team_id: &str) -> Vec<AssignOutcome> {
    let mut outcomes = Vec::with_capacity(ids.len());

    for id in ids {
        let item = match items.iter_mut().find(|i| &i.id == id) {
            Some(i) => i,
            None => {
                outcomes.push(AssignOutcome::Skipped {
                    work_item_id: id.clone(),
                    reason: "work item not found".to_string(),
                });
                continue;
            }
        };

        if item.status != WorkItemStatus::Queued {
            outcomes.push(AssignOutcome::Skipped {
                work_item_id: id.clone(),
                reason: format!("status is {}, expected queued", item.status),
            });
            continue;
        }

        if let Some(owner) = &item.team_id {
            if owner != team_id {
                outcomes.push(AssignOutcome::Skipped {
                    work_item_id: id.clone(),
                    reason: format!("already assigned to team {}", owner),
                });
                continue;
            }
        }

        item.team_id = Some(team_id.to_string());
        item.assigned_at = Some(Utc::now());
        outcomes.push(AssignOutcome::Assigned {
            work_item_id: id.clone(),
        });
    }

    let assigned = outcomes
        .iter()
        .filter(|o| matches!(o, AssignOutcome::Assigned { .. }))
        .count();
    log::info!(
        "[WorkQueue] Bulk assign to team {}: {} assigned, {} skipped",
        team_id,
        assigned,
        outcomes.len() - assigned
    );
    outcomes
}

/// One condition blocking a team from starting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnmetCondition {
    RepoPathMissing,
    NotAGitRepository,
    NoQueuedWork,
    NoIdleAgentCapacity,
}

/// Structured readiness report, never a bare boolean.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    pub ready: bool,
    pub unmet: Vec<UnmetCondition>,
}

/// Evaluate whether a team can start a run right now.
pub fn readiness(team: &Team, items: &[WorkItem], agents: &[AgentProfile]) -> Readiness {
    let mut unmet = Vec::new();

    let repo_path = Path::new(&team.repo_path);
    if !repo_path.exists() {
        unmet.push(UnmetCondition::RepoPathMissing);
    } else if GitManager::open(repo_path).is_err() {
        unmet.push(UnmetCondition::NotAGitRepository);
    }

    let has_queued = items.iter().any(|i| {
        i.status == WorkItemStatus::Queued && i.team_id.as_deref() == Some(team.id.as_str())
    });
    if !has_queued {
        unmet.push(UnmetCondition::NoQueuedWork);
    }

    let idle = agents
        .iter()
        .filter(|a| a.status == AgentStatus::Idle)
        .count();
    if idle == 0 || team.max_concurrent_tasks == 0 {
        unmet.push(UnmetCondition::NoIdleAgentCapacity);
    }

    Readiness {
        ready: unmet.is_empty(),
        unmet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(title: &str, priority: i32, offset_secs: i64) -> WorkItem {
        let mut i = WorkItem::new(title, priority);
        i.created_at = Utc::now() + Duration::seconds(offset_secs);
        i
    }

    #[test]
    fn test_priority_then_created_at_ordering() {
        let items = vec![
            item("late low", 5, 0),
            item("urgent second", 1, 10),
            item("urgent first", 1, 5),
            item("medium", 3, 0),
        ];
        let ordered = queued_in_order(&items);
        let titles: Vec<&str> = ordered.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["urgent first", "urgent second", "medium", "late low"]
        );
    }

    #[test]
    fn test_capacity_one_picks_highest_priority() {
        let items = vec![item("low", 9, 0), item("high", 1, 0), item("mid", 5, 0)];
        let agents = vec![
            AgentProfile::new("team-1", "alice", "implementer"),
            AgentProfile::new("team-1", "bob", "implementer"),
        ];

        let selected = select_for_capacity(&items, &agents, 1);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].work_item.title, "high");
    }

    #[test]
    fn test_specialization_preference() {
        let mut db_item = item("migrate schema", 1, 0);
        db_item.required_specialization = Some("database".to_string());
        let plain_item = item("rename button", 2, 0);
        let items = vec![db_item, plain_item];

        let mut dba = AgentProfile::new("team-1", "dba", "implementer");
        dba.specialization = Some("database".to_string());
        let generalist = AgentProfile::new("team-1", "gen", "implementer");
        let agents = vec![dba, generalist];

        let selected = select_for_capacity(&items, &agents, 2);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].work_item.title, "migrate schema");
        assert_eq!(selected[0].agent.name, "dba");
        assert_eq!(selected[1].agent.name, "gen");
    }

    #[test]
    fn test_specialized_item_waits_for_matching_agent() {
        let mut db_item = item("migrate schema", 1, 0);
        db_item.required_specialization = Some("database".to_string());
        let items = vec![db_item];
        let agents = vec![AgentProfile::new("team-1", "gen", "implementer")];

        let selected = select_for_capacity(&items, &agents, 1);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_bulk_assign_partial_success() {
        let mut items = vec![
            item("a", 1, 0),
            item("b", 1, 0),
            item("c", 1, 0),
            item("d", 1, 0),
            item("e", 1, 0),
        ];
        // Two invalid targets: one completed, one owned elsewhere
        items[3].status = WorkItemStatus::Completed;
        items[4].team_id = Some("other-team".to_string());

        let mut ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        // An identity that matches no work item at all
        ids.push("no-such-item".to_string());
        let outcomes = bulk_assign(&mut items, &ids, "team-1");

        let assigned = outcomes
            .iter()
            .filter(|o| matches!(o, AssignOutcome::Assigned { .. }))
            .count();
        assert_eq!(assigned, 3);
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.contains(&AssignOutcome::Skipped {
            work_item_id: "no-such-item".to_string(),
            reason: "work item not found".to_string(),
        }));

        // Successful items are stamped but stay queued
        assert_eq!(items[0].team_id.as_deref(), Some("team-1"));
        assert_eq!(items[0].status, WorkItemStatus::Queued);
        assert!(items[0].assigned_at.is_some());
        // Failed items are untouched
        assert_eq!(items[4].team_id.as_deref(), Some("other-team"));
    }

    #[test]
    fn test_readiness_reports_all_unmet_conditions() {
        let team = Team::new("t", "/nonexistent/repo/path");
        let readiness = readiness(&team, &[], &[]);
        assert!(!readiness.ready);
        assert!(readiness.unmet.contains(&UnmetCondition::RepoPathMissing));
        assert!(readiness.unmet.contains(&UnmetCondition::NoQueuedWork));
        assert!(readiness
            .unmet
            .contains(&UnmetCondition::NoIdleAgentCapacity));
    }

    #[test]
    fn test_readiness_ready_team() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        git2::Repository::init(temp_dir.path()).unwrap();

        let mut team = Team::new("t", temp_dir.path().to_string_lossy());
        team.max_concurrent_tasks = 2;
        let mut wi = item("work", 1, 0);
        wi.team_id = Some(team.id.clone());
        let agents = vec![AgentProfile::new(&team.id, "alice", "implementer")];

        let readiness = readiness(&team, &[wi], &agents);
        assert!(readiness.ready, "unmet: {:?}", readiness.unmet);
    }
}
