//! Error taxonomy for ingestion, execution and orchestration.
//!
//! Validation errors are returned to the submitter synchronously. Execution
//! errors are recorded on the task and surfaced in its completion
//! notification; they never stop the dispatch loop.

use thiserror::Error;

use crate::domain::{TaskId, TaskState, TaskType};

/// A submitted event or task was rejected before entering the system
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Event is missing a type")]
    MissingType,

    #[error("Unknown event type: {0}")]
    UnknownType(String),

    #[error("Unparseable timestamp '{value}': {reason}")]
    BadTimestamp { value: String, reason: String },

    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Event type {event_type} requires metadata field '{field}'")]
    MissingMetadata { event_type: String, field: String },

    #[error("Invalid metadata field '{field}': {reason}")]
    InvalidMetadata { field: String, reason: String },

    #[error("Invalid task: {0}")]
    InvalidTask(String),
}

/// Why a task execution did not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Transient failure; the orchestrator may retry
    #[error("Retryable failure: {0}")]
    Retryable(String),

    /// Permanent failure; no retry
    #[error("Terminal failure: {0}")]
    Terminal(String),

    #[error("No executor registered for task type {0}")]
    NoExecutor(TaskType),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Deadline exceeded after {seconds}s")]
    DeadlineExceeded { seconds: u64 },
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::DeadlineExceeded { .. })
    }
}

/// Errors returned by orchestrator operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {id} cannot be cancelled in state {state:?}")]
    NotCancellable { id: TaskId, state: TaskState },

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Orchestrator has shut down")]
    ShutDown,

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_executor_message_names_type() {
        let err = ExecutionError::NoExecutor(TaskType::Pin);
        assert_eq!(err.to_string(), "No executor registered for task type pin");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_deadline_is_retryable() {
        assert!(ExecutionError::DeadlineExceeded { seconds: 30 }.is_retryable());
        assert!(ExecutionError::Retryable("503".into()).is_retryable());
        assert!(!ExecutionError::Terminal("missing".into()).is_retryable());
    }
}
