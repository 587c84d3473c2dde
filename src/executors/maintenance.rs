//! Maintenance executors run by ritual ticks and upload follow-ups.
//!
//! - `pin`: pin verified, unpinned uploads
//! - `reconcile`: re-check uploads that failed verification
//! - `signature_sweep`: expire stale signature requests
//! - `archive_events`: move old events out of the hot log
//!
//! A payload `contentId` narrows pin and reconcile to one record.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::instrument;

use super::{Completion, ExecutionOutcome, Executor, FollowUp};
use crate::core::clock::SharedClock;
use crate::core::event_store::EventLog;
use crate::domain::{Task, TaskOutput, TaskType};
use crate::signatures::SignatureStateMachine;
use crate::storage::StoragePipeline;

pub struct PinExecutor {
    pipeline: Arc<StoragePipeline>,
}

impl PinExecutor {
    pub fn new(pipeline: Arc<StoragePipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Executor for PinExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Pin
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        let report = self.pipeline.pin_pending(task.payload_str("contentId")).await;

        if !report.failed.is_empty() {
            let failed: Vec<String> = report
                .failed
                .iter()
                .map(|(cid, err)| format!("{cid}: {err}"))
                .collect();
            return ExecutionOutcome::Retryable(format!("pin failed for {}", failed.join(", ")));
        }

        ExecutionOutcome::completed(TaskOutput::summary(format!("pinned {} records", report.pinned.len())))
    }
}

pub struct ReconcileExecutor {
    pipeline: Arc<StoragePipeline>,
}

impl ReconcileExecutor {
    pub fn new(pipeline: Arc<StoragePipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Executor for ReconcileExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Reconcile
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        let content_id = task.payload_str("contentId");
        let report = self.pipeline.reconcile(content_id).await;

        match content_id {
            // Follow-up for one upload: keep retrying until reachable, then pin
            Some(cid) if !report.unreachable.is_empty() => {
                ExecutionOutcome::Retryable(format!("content {cid} still unreachable"))
            }
            Some(cid) if report.verified > 0 => ExecutionOutcome::Completed(
                Completion::new(TaskOutput::summary(format!("verified {cid}")))
                    .with_follow_up(FollowUp::new(TaskType::Pin, json!({ "contentId": cid }))),
            ),
            _ => ExecutionOutcome::completed(TaskOutput::summary(format!(
                "checked {}, verified {}, unreachable {}",
                report.checked,
                report.verified,
                report.unreachable.len()
            ))),
        }
    }
}

pub struct SignatureSweepExecutor {
    machine: Arc<SignatureStateMachine>,
}

impl SignatureSweepExecutor {
    pub fn new(machine: Arc<SignatureStateMachine>) -> Self {
        Self { machine }
    }
}

#[async_trait]
impl Executor for SignatureSweepExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::SignatureSweep
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        let report = self.machine.sweep().await;
        ExecutionOutcome::completed(TaskOutput::summary(format!(
            "expired {} requests and {} multi-signature requests",
            report.expired_requests.len(),
            report.expired_multis.len()
        )))
    }
}

pub struct ArchiveEventsExecutor {
    log: Arc<EventLog>,
    clock: SharedClock,
}

impl ArchiveEventsExecutor {
    pub fn new(log: Arc<EventLog>, clock: SharedClock) -> Self {
        Self { log, clock }
    }
}

#[async_trait]
impl Executor for ArchiveEventsExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::ArchiveEvents
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        match self.log.sweep(self.clock.now()).await {
            Ok(report) => ExecutionOutcome::completed(TaskOutput::summary(format!(
                "archived {} events, {} retained",
                report.archived, report.retained
            ))),
            Err(e) => ExecutionOutcome::Retryable(format!("event archive failed: {e:#}")),
        }
    }
}
