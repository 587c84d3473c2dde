//! Tasks derived from events.
//!
//! A task is owned by the orchestrator while queued and by its executor while
//! dispatched. `completed` and `failed` are terminal: every transition method
//! refuses to move a task out of them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::upload::UploadRecord;

pub type TaskId = Uuid;

/// Kinds of work the orchestrator can dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Upload an artifact through the storage pipeline
    Upload,

    /// Open a signature request
    SignatureRequest,

    /// Deliver a completion notification to the registry sink
    RegistryNotify,

    /// Pin uploaded content for long-term retention
    Pin,

    /// Re-check content that failed verification after upload
    Reconcile,

    /// Expire stale signature requests
    SignatureSweep,

    /// Archive old entries of the event log
    ArchiveEvents,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        Self::Upload,
        Self::SignatureRequest,
        Self::RegistryNotify,
        Self::Pin,
        Self::Reconcile,
        Self::SignatureSweep,
        Self::ArchiveEvents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::SignatureRequest => "signature_request",
            Self::RegistryNotify => "registry_notify",
            Self::Pin => "pin",
            Self::Reconcile => "reconcile",
            Self::SignatureSweep => "signature_sweep",
            Self::ArchiveEvents => "archive_events",
        }
    }

    /// Priority used when the triggering event does not override it
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::SignatureRequest => 7,
            Self::Upload => 5,
            Self::RegistryNotify => 3,
            Self::Pin => 2,
            Self::SignatureSweep => 2,
            Self::Reconcile => 1,
            Self::ArchiveEvents => 1,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Dispatched,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// References produced by a successful execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_record: Option<UploadRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_request_id: Option<String>,

    /// Short human-readable result (e.g. "pinned 3 records")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl TaskOutput {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..Default::default()
        }
    }
}

/// A unit of work derived from an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,

    /// Event this task was derived from
    pub event_ref: String,

    #[serde(rename = "type")]
    pub task_type: TaskType,

    /// Higher dispatches sooner
    pub priority: i32,

    pub state: TaskState,

    /// Number of times the task has been dispatched
    #[serde(default)]
    pub attempts: u32,

    /// Structured executor input
    #[serde(default)]
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Earliest time a retried task may be dispatched again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
}

impl Task {
    /// Create a new queued task
    pub fn new(
        event_ref: impl Into<String>,
        task_type: TaskType,
        priority: i32,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_ref: event_ref.into(),
            task_type,
            priority,
            state: TaskState::Queued,
            attempts: 0,
            payload,
            created_at,
            started_at: None,
            completed_at: None,
            not_before: None,
            error: None,
            output: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a queued task may be dispatched at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Queued && self.not_before.map_or(true, |t| t <= now)
    }

    /// Read a string field from the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// queued → dispatched (counts an attempt)
    pub fn mark_dispatched(&mut self, now: DateTime<Utc>) -> Result<(), TaskTransitionError> {
        self.guard(TaskState::Queued, TaskState::Dispatched)?;
        self.state = TaskState::Dispatched;
        self.attempts += 1;
        self.started_at = Some(now);
        self.not_before = None;
        Ok(())
    }

    /// dispatched → completed
    pub fn complete(&mut self, now: DateTime<Utc>, output: TaskOutput) -> Result<(), TaskTransitionError> {
        self.guard(TaskState::Dispatched, TaskState::Completed)?;
        self.state = TaskState::Completed;
        self.completed_at = Some(now);
        self.error = None;
        self.output = Some(output);
        Ok(())
    }

    /// queued | dispatched → failed
    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> Result<(), TaskTransitionError> {
        if self.is_terminal() {
            return Err(self.transition_error(TaskState::Failed));
        }
        self.state = TaskState::Failed;
        self.completed_at = Some(now);
        self.error = Some(error.into());
        Ok(())
    }

    /// dispatched → queued, for a retry with a new priority and delay
    pub fn requeue(
        &mut self,
        priority: i32,
        not_before: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Result<(), TaskTransitionError> {
        self.guard(TaskState::Dispatched, TaskState::Queued)?;
        self.state = TaskState::Queued;
        self.priority = priority;
        self.not_before = Some(not_before);
        self.error = Some(error.into());
        Ok(())
    }

    /// Put a task that was in flight during a crash back in the queue.
    ///
    /// The attempt that was running is still counted.
    pub fn recover(&mut self) -> Result<(), TaskTransitionError> {
        self.guard(TaskState::Dispatched, TaskState::Queued)?;
        self.state = TaskState::Queued;
        self.started_at = None;
        Ok(())
    }

    fn guard(&self, from: TaskState, to: TaskState) -> Result<(), TaskTransitionError> {
        if self.state != from {
            return Err(self.transition_error(to));
        }
        Ok(())
    }

    fn transition_error(&self, to: TaskState) -> TaskTransitionError {
        TaskTransitionError {
            task_id: self.id,
            from: self.state,
            to,
        }
    }
}

/// Attempted a transition the task lifecycle does not allow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for task {task_id}: {from:?} -> {to:?}")]
pub struct TaskTransitionError {
    pub task_id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::new("evt-1", TaskType::Upload, 5, json!({"artifact": "a.bin"}), Utc::now())
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = task();
        let now = Utc::now();

        task.mark_dispatched(now).unwrap();
        assert_eq!(task.state, TaskState::Dispatched);
        assert_eq!(task.attempts, 1);

        task.complete(now, TaskOutput::summary("done")).unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.completed_at, Some(now));
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let now = Utc::now();

        let mut completed = task();
        completed.mark_dispatched(now).unwrap();
        completed.complete(now, TaskOutput::default()).unwrap();

        assert!(completed.fail(now, "late failure").is_err());
        assert!(completed.mark_dispatched(now).is_err());
        assert!(completed.requeue(1, now, "retry").is_err());
        assert!(completed.recover().is_err());
        assert_eq!(completed.state, TaskState::Completed);

        let mut failed = task();
        failed.fail(now, "no executor").unwrap();
        assert!(failed.complete(now, TaskOutput::default()).is_err());
        assert!(failed.mark_dispatched(now).is_err());
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.error.as_deref(), Some("no executor"));
    }

    #[test]
    fn test_requeue_sets_delay() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(5);

        let mut task = task();
        task.mark_dispatched(now).unwrap();
        task.requeue(4, later, "timeout").unwrap();

        assert_eq!(task.priority, 4);
        assert!(!task.is_ready(now));
        assert!(task.is_ready(later));
        assert_eq!(task.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_serialization_uses_camel_case() {
        let json = serde_json::to_value(task()).unwrap();
        assert_eq!(json["type"], "upload");
        assert_eq!(json["state"], "queued");
        assert!(json.get("eventRef").is_some());
        assert!(json.get("createdAt").is_some());
    }
}
