// Event types and payload structures emitted by the orchestration core
// Delivery transport (WebSocket, channel fan-out, ...) lives outside the crate

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

// Event name constants
pub const EVENT_TEAM_STATUS_CHANGED: &str = "team:status_changed";
pub const EVENT_AGENT_STATUS_CHANGED: &str = "agent:status_changed";
pub const EVENT_WORK_ITEM_STATUS_CHANGED: &str = "work_item:status_changed";

// Run lifecycle events
pub const EVENT_RUN_STARTED: &str = "run:started";
pub const EVENT_RUN_COMPLETED: &str = "run:completed";
pub const EVENT_RUN_FAILED: &str = "run:failed";
pub const EVENT_TASK_STATUS_CHANGED: &str = "task:status_changed";
pub const EVENT_TASK_RETRYING: &str = "task:retrying";

// Conflict monitor events
pub const EVENT_MERGE_COMPLETED: &str = "merge:completed";
pub const EVENT_CONFLICT_AUTO_RESOLVED: &str = "conflict:auto_resolved";
pub const EVENT_CONFLICT_ESCALATED: &str = "conflict:escalated";

/// One event with its name and serialized payload, delivered over the
/// injected sink in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorEvent {
    pub name: String,
    pub team_id: String,
    pub payload: serde_json::Value,
}

/// The orchestrator's only outward channel.
pub type EventSink = UnboundedSender<OrchestratorEvent>;

/// Payload for team status change events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamStatusChangedPayload {
    pub team_id: String,
    pub old_status: String,
    pub new_status: String,
}

/// Payload for work item status change events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemStatusChangedPayload {
    pub work_item_id: String,
    pub old_status: String,
    pub new_status: String,
}

/// Payload for run task status change events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusChangedPayload {
    pub task_id: String,
    pub run_id: String,
    pub work_item_id: Option<String>,
    pub old_status: String,
    pub new_status: String,
}

/// Payload for run completion/failure events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCompletedPayload {
    pub run_id: String,
    pub status: String,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub error: Option<String>,
}

/// Payload for merge and conflict events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPayload {
    pub source_branch: String,
    pub target_branch: String,
    pub work_item_id: Option<String>,
    pub conflicting_paths: Vec<String>,
    pub resolution: String,
}

/// Build an event, serializing the payload. Serialization of these payload
/// structs cannot fail, so a failure is reported as a null payload.
pub fn make_event<P: Serialize>(name: &str, team_id: &str, payload: &P) -> OrchestratorEvent {
    OrchestratorEvent {
        name: name.to_string(),
        team_id: team_id.to_string(),
        payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
    }
}

/// Send an event, logging instead of failing when the receiver is gone.
pub fn emit(sink: &EventSink, event: OrchestratorEvent) {
    let name = event.name.clone();
    if sink.send(event).is_err() {
        log::debug!("[Events] No receiver for event {}", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payload_is_camel_case() {
        let event = make_event(
            EVENT_WORK_ITEM_STATUS_CHANGED,
            "team-1",
            &WorkItemStatusChangedPayload {
                work_item_id: "wi-1".to_string(),
                old_status: "queued".to_string(),
                new_status: "in_progress".to_string(),
            },
        );
        assert_eq!(event.name, "work_item:status_changed");
        assert!(event.payload.get("workItemId").is_some());
        assert_eq!(event.payload["newStatus"], "in_progress");
    }

    #[test]
    fn test_emit_without_receiver_does_not_panic() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        emit(
            &tx,
            make_event(
                EVENT_RUN_STARTED,
                "team-1",
                &serde_json::json!({"runId": "r-1"}),
            ),
        );
    }

    #[test]
    fn test_events_arrive_in_emission_order() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..3 {
            emit(
                &tx,
                make_event(EVENT_TASK_STATUS_CHANGED, "team-1", &serde_json::json!({"i": i})),
            );
        }
        for i in 0..3 {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.payload["i"], i);
        }
    }
}
