//! Artifact upload executor.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument};

use super::{Completion, ExecutionOutcome, Executor, FollowUp};
use crate::domain::{Metadata, Task, TaskOutput, TaskType};
use crate::storage::{Artifact, StoragePipeline};

/// Deadline for one upload task, covering every provider attempt
pub const UPLOAD_DEADLINE: Duration = Duration::from_secs(30);

pub struct UploadExecutor {
    pipeline: Arc<StoragePipeline>,
    artifacts_dir: PathBuf,
    deadline: Duration,
}

impl UploadExecutor {
    pub fn new(pipeline: Arc<StoragePipeline>, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            pipeline,
            artifacts_dir: artifacts_dir.into(),
            deadline: UPLOAD_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Relative artifact paths resolve against the artifacts directory
    fn resolve(&self, artifact: &str) -> PathBuf {
        let path = Path::new(artifact);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.artifacts_dir.join(path)
        }
    }
}

#[async_trait]
impl Executor for UploadExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Upload
    }

    fn deadline(&self) -> Duration {
        self.deadline
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        let Some(artifact_ref) = task.payload_str("artifact") else {
            return ExecutionOutcome::Terminal("upload task has no artifact".to_string());
        };

        let path = self.resolve(artifact_ref);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return ExecutionOutcome::Terminal(format!("artifact not found: {}", path.display()));
            }
            Err(e) => {
                return ExecutionOutcome::Retryable(format!("failed to read {}: {}", path.display(), e));
            }
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| artifact_ref.to_string());

        let metadata: Metadata = task
            .payload
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let artifact = Artifact::new(name, bytes).with_metadata(metadata);
        debug!(path = %path.display(), size = artifact.size(), "Uploading artifact");

        let record = match self.pipeline.upload(task.id, &artifact).await {
            Ok(record) => record,
            Err(e) => return ExecutionOutcome::Terminal(e.to_string()),
        };

        let follow_up = if !record.verified {
            Some(FollowUp::new(TaskType::Reconcile, json!({ "contentId": record.content_id })))
        } else if !record.pinned {
            Some(FollowUp::new(TaskType::Pin, json!({ "contentId": record.content_id })))
        } else {
            None
        };

        let mut completion = Completion::new(TaskOutput {
            artifact_ref: Some(artifact_ref.to_string()),
            upload_record: Some(record),
            ..Default::default()
        });
        completion.follow_ups.extend(follow_up);

        ExecutionOutcome::Completed(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::storage::LocalStorageProvider;
    use chrono::Utc;
    use tempfile::TempDir;

    fn executor(dir: &TempDir) -> UploadExecutor {
        let store = Arc::new(LocalStorageProvider::new("local", dir.path().join("store")));
        let pipeline = Arc::new(StoragePipeline::new(store, None, Arc::new(SystemClock)));
        UploadExecutor::new(pipeline, dir.path().join("artifacts"))
    }

    fn upload_task(artifact: &str) -> Task {
        Task::new("evt-1", TaskType::Upload, 5, json!({ "artifact": artifact }), Utc::now())
    }

    #[tokio::test]
    async fn test_missing_file_is_terminal() {
        let dir = TempDir::new().unwrap();
        let outcome = executor(&dir).execute(&upload_task("nope.bin")).await;
        assert!(matches!(outcome, ExecutionOutcome::Terminal(msg) if msg.contains("not found")));
    }

    #[tokio::test]
    async fn test_relative_path_uploads_and_requests_pin() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("artifacts")).unwrap();
        std::fs::write(dir.path().join("artifacts/report.txt"), b"report").unwrap();

        let outcome = executor(&dir).execute(&upload_task("report.txt")).await;
        let ExecutionOutcome::Completed(completion) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };

        let record = completion.output.upload_record.unwrap();
        assert_eq!(record.size, 6);
        assert!(record.verified);
        assert_eq!(completion.output.artifact_ref.as_deref(), Some("report.txt"));
        assert_eq!(completion.follow_ups.len(), 1);
        assert_eq!(completion.follow_ups[0].task_type, TaskType::Pin);
        assert_eq!(completion.follow_ups[0].payload["contentId"], record.content_id);
    }
}
