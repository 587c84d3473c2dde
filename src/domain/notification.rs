//! Notifications published by the core.

use serde::{Deserialize, Serialize};

use super::task::{Task, TaskId, TaskState, TaskType};
use super::upload::UploadRecord;

/// Final result of a task as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionResult {
    Completed,
    Failed,
}

impl CompletionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Payload delivered to the registry sink when a task finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotification {
    pub task_id: TaskId,

    pub event_id: String,

    #[serde(rename = "type")]
    pub task_type: TaskType,

    pub result: CompletionResult,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_record: Option<UploadRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub attempts: u32,
}

impl CompletionNotification {
    /// Build the notification for a task in a terminal state
    pub fn from_task(task: &Task) -> Option<Self> {
        let result = match task.state {
            TaskState::Completed => CompletionResult::Completed,
            TaskState::Failed => CompletionResult::Failed,
            _ => return None,
        };

        let output = task.output.clone().unwrap_or_default();

        Some(Self {
            task_id: task.id,
            event_id: task.event_ref.clone(),
            task_type: task.task_type,
            result,
            artifact_ref: output.artifact_ref.or_else(|| task.payload_str("artifact").map(String::from)),
            upload_record: output.upload_record,
            signature_request_id: output.signature_request_id,
            error: task.error.clone(),
            attempts: task.attempts,
        })
    }
}

/// Messages on the broadcast notification bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Notification {
    /// An event was accepted and written to the log
    EventLogged { event_id: String },

    /// An event was accepted but could not be written to the log
    LoggingDegraded { event_id: String, error: String },

    /// A task reached a terminal state
    TaskCompleted(CompletionNotification),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::TaskOutput;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_only_terminal_tasks_produce_notifications() {
        let task = Task::new("evt-1", TaskType::Upload, 5, json!({"artifact": "a.bin"}), Utc::now());
        assert!(CompletionNotification::from_task(&task).is_none());
    }

    #[test]
    fn test_failed_task_notification_carries_error() {
        let mut task = Task::new("evt-1", TaskType::Upload, 5, json!({"artifact": "a.bin"}), Utc::now());
        task.fail(Utc::now(), "boom").unwrap();

        let note = CompletionNotification::from_task(&task).unwrap();
        assert_eq!(note.result, CompletionResult::Failed);
        assert_eq!(note.error.as_deref(), Some("boom"));
        assert_eq!(note.artifact_ref.as_deref(), Some("a.bin"));

        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["result"], "failed");
        assert_eq!(json["eventId"], "evt-1");
        assert_eq!(json["type"], "upload");
    }

    #[test]
    fn test_completed_task_notification_uses_output() {
        let mut task = Task::new("evt-2", TaskType::SignatureRequest, 7, json!({}), Utc::now());
        task.mark_dispatched(Utc::now()).unwrap();
        task.complete(
            Utc::now(),
            TaskOutput {
                signature_request_id: Some("sig-1".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let note = CompletionNotification::from_task(&task).unwrap();
        assert_eq!(note.result, CompletionResult::Completed);
        assert_eq!(note.signature_request_id.as_deref(), Some("sig-1"));
        assert_eq!(note.attempts, 1);
    }
}
