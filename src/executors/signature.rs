//! Signature request executor.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{ExecutionOutcome, Executor};
use crate::domain::{Task, TaskOutput, TaskType};
use crate::signatures::{SignatureError, SignatureStateMachine};

pub struct SignatureRequestExecutor {
    machine: Arc<SignatureStateMachine>,
}

impl SignatureRequestExecutor {
    pub fn new(machine: Arc<SignatureStateMachine>) -> Self {
        Self { machine }
    }

    async fn open(&self, task: &Task, message: &str) -> Result<String, SignatureError> {
        match task.payload.get("signers").and_then(Value::as_array) {
            Some(signers) => {
                let signers = signers
                    .iter()
                    .map(|s| {
                        s.as_str()
                            .map(String::from)
                            .ok_or_else(|| SignatureError::Validation(format!("signer is not a string: {s}")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let threshold = task
                    .payload
                    .get("threshold")
                    .and_then(Value::as_u64)
                    .map(|t| t as usize);

                let multi = self
                    .machine
                    .create_multi(&task.event_ref, message, &signers, threshold)
                    .await?;
                Ok(multi.id)
            }
            None => {
                let required = task.payload_str("requiredSigner");
                let request = self.machine.create(&task.event_ref, message, required).await?;
                Ok(request.id)
            }
        }
    }
}

#[async_trait]
impl Executor for SignatureRequestExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::SignatureRequest
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, event_ref = %task.event_ref))]
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        let Some(message) = task.payload_str("message") else {
            return ExecutionOutcome::Terminal("signature request has no message".to_string());
        };

        let request_id = match self.open(task, message).await {
            Ok(id) => id,
            // Re-run after a restart: the request from the first run stands
            Err(SignatureError::AlreadyOpen { request_id, .. }) => {
                debug!(request_id = %request_id, "Signature request already open for event");
                request_id
            }
            Err(e) => return ExecutionOutcome::Terminal(e.to_string()),
        };

        ExecutionOutcome::completed(TaskOutput {
            signature_request_id: Some(request_id),
            ..Default::default()
        })
    }
}
