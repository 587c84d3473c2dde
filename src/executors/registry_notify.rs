//! Delivers completion notifications to the registry sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use super::{ExecutionOutcome, Executor};
use crate::domain::{CompletionNotification, Task, TaskOutput, TaskType};
use crate::sink::RegistrySink;

pub const NOTIFY_DEADLINE: Duration = Duration::from_secs(10);

pub struct RegistryNotifyExecutor {
    sink: Arc<dyn RegistrySink>,
    deadline: Duration,
}

impl RegistryNotifyExecutor {
    pub fn new(sink: Arc<dyn RegistrySink>) -> Self {
        Self {
            sink,
            deadline: NOTIFY_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

#[async_trait]
impl Executor for RegistryNotifyExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::RegistryNotify
    }

    fn deadline(&self) -> Duration {
        self.deadline
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, sink = self.sink.name()))]
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        let notification: CompletionNotification = match serde_json::from_value(task.payload.clone()) {
            Ok(n) => n,
            Err(e) => return ExecutionOutcome::Terminal(format!("malformed completion payload: {e}")),
        };

        match self.sink.deliver(&notification).await {
            Ok(()) => ExecutionOutcome::completed(TaskOutput::summary(format!(
                "delivered {} for task {}",
                notification.result.as_str(),
                notification.task_id
            ))),
            Err(e) => ExecutionOutcome::Retryable(e.to_string()),
        }
    }
}
