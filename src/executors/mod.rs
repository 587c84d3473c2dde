//! Task executors.
//!
//! Each executor handles exactly one [`TaskType`]. The orchestrator looks the
//! executor up in an [`ExecutorRegistry`], runs it under its deadline and turns
//! the returned [`ExecutionOutcome`] into a task transition.

pub mod maintenance;
pub mod registry_notify;
pub mod signature;
pub mod upload;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Task, TaskOutput, TaskType};

pub use maintenance::{ArchiveEventsExecutor, PinExecutor, ReconcileExecutor, SignatureSweepExecutor};
pub use registry_notify::RegistryNotifyExecutor;
pub use signature::SignatureRequestExecutor;
pub use upload::{UploadExecutor, UPLOAD_DEADLINE};

/// Default deadline for executors that do not set their own
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Additional work requested by a finished execution
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUp {
    pub task_type: TaskType,

    /// `None` uses the task type's default priority
    pub priority: Option<i32>,

    pub payload: Value,
}

impl FollowUp {
    pub fn new(task_type: TaskType, payload: Value) -> Self {
        Self {
            task_type,
            priority: None,
            payload,
        }
    }
}

/// Successful execution result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub output: TaskOutput,
    pub follow_ups: Vec<FollowUp>,
}

impl Completion {
    pub fn new(output: TaskOutput) -> Self {
        Self {
            output,
            follow_ups: Vec::new(),
        }
    }

    pub fn with_follow_up(mut self, follow_up: FollowUp) -> Self {
        self.follow_ups.push(follow_up);
        self
    }
}

/// What an executor reports back to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(Completion),

    /// Transient failure; may be retried
    Retryable(String),

    /// Permanent failure
    Terminal(String),
}

impl ExecutionOutcome {
    pub fn completed(output: TaskOutput) -> Self {
        Self::Completed(Completion::new(output))
    }
}

/// Handler for one task type
#[async_trait]
pub trait Executor: Send + Sync {
    /// Task type this executor handles
    fn task_type(&self) -> TaskType;

    /// Hard deadline for one execution
    fn deadline(&self) -> Duration {
        DEFAULT_DEADLINE
    }

    async fn execute(&self, task: &Task) -> ExecutionOutcome;
}

/// Type-keyed executor lookup
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one for its type
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.task_type(), executor);
    }

    pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.executors.contains_key(&task_type)
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.executors.keys().copied().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
