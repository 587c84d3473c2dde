//! Storage fallback pipeline.
//!
//! ```text
//! primary (max_attempts, exponential backoff)
//!    └─ all failed → secondary (one attempt)
//!                      └─ failed → UploadError::Exhausted + flag artifact
//! success → exists(content_id) → record.verified
//! ```
//!
//! The pipeline is the only writer of upload records. At most one record
//! exists per source task; uploading a task that already has a record returns
//! that record without touching any provider.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::{Artifact, ProviderError, StorageProvider};
use crate::core::clock::SharedClock;
use crate::core::retry::RetryPolicy;
use crate::domain::{ProviderRole, TaskId, UploadRecord};

/// Headroom left between a full upload and the caller's deadline
const DEADLINE_MARGIN: Duration = Duration::from_secs(1);

/// Floor for a fitted per-attempt timeout
const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(100);

/// Every configured provider failed
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    #[error(
        "Upload of {artifact} exhausted all providers (primary: {primary}{})",
        secondary_suffix(.secondary)
    )]
    Exhausted {
        artifact: String,
        primary: ProviderError,
        secondary: Option<ProviderError>,
    },
}

fn secondary_suffix(secondary: &Option<ProviderError>) -> String {
    match secondary {
        Some(e) => format!("; secondary: {e}"),
        None => String::new(),
    }
}

/// An artifact that needs manual follow-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedArtifact {
    pub task_id: TaskId,
    pub artifact: String,
    pub error: String,
    pub flagged_at: DateTime<Utc>,
}

/// Records owned by the pipeline
#[derive(Debug, Clone, Default)]
pub struct UploadLedger {
    records: BTreeMap<TaskId, UploadRecord>,
    flagged: Vec<FlaggedArtifact>,
}

/// Result of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub verified: usize,
    /// Content ids that are still unreachable
    pub unreachable: Vec<String>,
}

/// Result of a pinning pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinReport {
    pub pinned: Vec<String>,
    /// (content id, error)
    pub failed: Vec<(String, String)>,
}

pub struct StoragePipeline {
    primary: Arc<dyn StorageProvider>,
    secondary: Option<Arc<dyn StorageProvider>>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    clock: SharedClock,
    ledger: RwLock<UploadLedger>,
}

impl StoragePipeline {
    pub fn new(
        primary: Arc<dyn StorageProvider>,
        secondary: Option<Arc<dyn StorageProvider>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            primary,
            secondary,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(30),
            clock,
            ledger: RwLock::new(UploadLedger::default()),
        }
    }

    /// Override the primary retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-attempt timeout for provider calls
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Longest an upload can take: every primary attempt, the backoff between
    /// them, the secondary attempt and verification all timing out.
    pub fn worst_case(&self) -> Duration {
        self.worst_case_with(self.attempt_timeout)
    }

    fn provider_calls(&self) -> u32 {
        self.retry.max_attempts.max(1) + u32::from(self.secondary.is_some()) + 1
    }

    fn total_backoff(&self) -> Duration {
        (1..self.retry.max_attempts.max(1))
            .map(|attempt| self.retry.delay_for_attempt(attempt))
            .sum()
    }

    fn worst_case_with(&self, attempt_timeout: Duration) -> Duration {
        attempt_timeout * self.provider_calls() + self.total_backoff()
    }

    /// Shrink the per-attempt timeout so a full upload finishes before
    /// `budget`, the deadline of whoever drives the pipeline.
    pub fn fit_within(mut self, budget: Duration) -> Self {
        if self.worst_case() < budget {
            return self;
        }

        let available = budget
            .saturating_sub(self.total_backoff())
            .saturating_sub(DEADLINE_MARGIN);
        let fitted = (available / self.provider_calls()).max(MIN_ATTEMPT_TIMEOUT);
        if fitted < self.attempt_timeout {
            info!(
                configured_ms = self.attempt_timeout.as_millis() as u64,
                fitted_ms = fitted.as_millis() as u64,
                budget_secs = budget.as_secs(),
                "Per-attempt storage timeout reduced to fit upload deadline"
            );
            self.attempt_timeout = fitted;
        }
        if self.worst_case() >= budget {
            warn!(
                budget_secs = budget.as_secs(),
                backoff_ms = self.total_backoff().as_millis() as u64,
                "Upload deadline too short for the storage retry policy"
            );
        }
        self
    }

    /// Upload an artifact on behalf of a task
    #[instrument(skip(self, artifact), fields(artifact = %artifact.name, size = artifact.size()))]
    pub async fn upload(&self, task_id: TaskId, artifact: &Artifact) -> Result<UploadRecord, UploadError> {
        if let Some(existing) = self.record_for_task(task_id).await {
            debug!(content_id = %existing.content_id, "Upload already recorded for task");
            return Ok(existing);
        }

        let (role, provider, content_id) = match self.upload_with_retry(&self.primary, artifact).await {
            Ok(cid) => (ProviderRole::Primary, &self.primary, cid),
            Err(primary_err) => {
                warn!(
                    provider = self.primary.name(),
                    error = %primary_err,
                    "Primary provider exhausted"
                );

                let Some(secondary) = &self.secondary else {
                    return Err(self.exhausted(task_id, artifact, primary_err, None).await);
                };

                match self.attempt(secondary, artifact).await {
                    Ok(cid) => {
                        info!(provider = secondary.name(), "Uploaded via secondary provider");
                        (ProviderRole::Secondary, secondary, cid)
                    }
                    Err(secondary_err) => {
                        return Err(self
                            .exhausted(task_id, artifact, primary_err, Some(secondary_err))
                            .await);
                    }
                }
            }
        };

        let verified = self.verify(provider, &content_id).await;

        let record = UploadRecord {
            content_id,
            source_task_id: task_id,
            provider: role,
            provider_name: provider.name().to_string(),
            size: artifact.size(),
            uploaded_at: self.clock.now(),
            pinned: false,
            verified,
        };

        let mut ledger = self.ledger.write().await;
        let stored = ledger.records.entry(task_id).or_insert(record).clone();

        info!(
            content_id = %stored.content_id,
            provider = %stored.provider,
            verified = stored.verified,
            "Upload recorded"
        );
        Ok(stored)
    }

    /// One provider call under the attempt timeout
    async fn attempt(&self, provider: &Arc<dyn StorageProvider>, artifact: &Artifact) -> Result<String, ProviderError> {
        match tokio::time::timeout(self.attempt_timeout, provider.put(artifact)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.attempt_timeout.as_secs())),
        }
    }

    async fn upload_with_retry(
        &self,
        provider: &Arc<dyn StorageProvider>,
        artifact: &Artifact,
    ) -> Result<String, ProviderError> {
        let mut attempt = 1;
        loop {
            match self.attempt(provider, artifact).await {
                Ok(cid) => return Ok(cid),
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        provider = provider.name(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upload attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// HEAD-style reachability check; failures count as unverified
    async fn verify(&self, provider: &Arc<dyn StorageProvider>, content_id: &str) -> bool {
        match tokio::time::timeout(self.attempt_timeout, provider.exists(content_id)).await {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                warn!(content_id, provider = provider.name(), "Uploaded content not reachable yet");
                false
            }
            Ok(Err(e)) => {
                warn!(content_id, provider = provider.name(), error = %e, "Verification failed");
                false
            }
            Err(_) => {
                warn!(content_id, provider = provider.name(), "Verification timed out");
                false
            }
        }
    }

    async fn exhausted(
        &self,
        task_id: TaskId,
        artifact: &Artifact,
        primary: ProviderError,
        secondary: Option<ProviderError>,
    ) -> UploadError {
        let err = UploadError::Exhausted {
            artifact: artifact.name.clone(),
            primary,
            secondary,
        };

        warn!(task_id = %task_id, error = %err, "Artifact flagged for manual follow-up");
        self.ledger.write().await.flagged.push(FlaggedArtifact {
            task_id,
            artifact: artifact.name.clone(),
            error: err.to_string(),
            flagged_at: self.clock.now(),
        });
        err
    }

    fn provider_for(&self, role: ProviderRole) -> Option<&Arc<dyn StorageProvider>> {
        match role {
            ProviderRole::Primary => Some(&self.primary),
            ProviderRole::Secondary => self.secondary.as_ref(),
        }
    }

    /// Re-check unverified records (all of them, or those with `content_id`)
    #[instrument(skip(self))]
    pub async fn reconcile(&self, content_id: Option<&str>) -> ReconcileReport {
        let targets: Vec<UploadRecord> = self
            .unverified()
            .await
            .into_iter()
            .filter(|r| content_id.map_or(true, |cid| r.content_id == cid))
            .collect();

        let mut report = ReconcileReport::default();
        let mut newly_verified = Vec::new();

        for record in &targets {
            report.checked += 1;
            let Some(provider) = self.provider_for(record.provider) else {
                report.unreachable.push(record.content_id.clone());
                continue;
            };
            if self.verify(provider, &record.content_id).await {
                newly_verified.push(record.source_task_id);
            } else {
                report.unreachable.push(record.content_id.clone());
            }
        }

        let mut ledger = self.ledger.write().await;
        for task_id in newly_verified {
            if let Some(record) = ledger.records.get_mut(&task_id) {
                record.verified = true;
                report.verified += 1;
            }
        }

        info!(
            checked = report.checked,
            verified = report.verified,
            unreachable = report.unreachable.len(),
            "Reconciliation pass complete"
        );
        report
    }

    /// Pin verified records that are not pinned yet
    #[instrument(skip(self))]
    pub async fn pin_pending(&self, content_id: Option<&str>) -> PinReport {
        let targets: Vec<UploadRecord> = {
            let ledger = self.ledger.read().await;
            ledger
                .records
                .values()
                .filter(|r| r.verified && !r.pinned)
                .filter(|r| content_id.map_or(true, |cid| r.content_id == cid))
                .cloned()
                .collect()
        };

        let mut report = PinReport::default();
        let mut pinned_tasks = Vec::new();

        for record in &targets {
            let result = match self.provider_for(record.provider) {
                Some(provider) => match tokio::time::timeout(self.attempt_timeout, provider.pin(&record.content_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(self.attempt_timeout.as_secs())),
                },
                None => Err(ProviderError::InvalidResponse(format!(
                    "no {} provider configured",
                    record.provider
                ))),
            };

            match result {
                Ok(()) => {
                    pinned_tasks.push(record.source_task_id);
                    report.pinned.push(record.content_id.clone());
                }
                Err(e) => {
                    warn!(content_id = %record.content_id, error = %e, "Pin failed");
                    report.failed.push((record.content_id.clone(), e.to_string()));
                }
            }
        }

        let mut ledger = self.ledger.write().await;
        for task_id in pinned_tasks {
            if let Some(record) = ledger.records.get_mut(&task_id) {
                record.pinned = true;
            }
        }

        info!(pinned = report.pinned.len(), failed = report.failed.len(), "Pinning pass complete");
        report
    }

    pub async fn records(&self) -> Vec<UploadRecord> {
        self.ledger.read().await.records.values().cloned().collect()
    }

    pub async fn record_for_task(&self, task_id: TaskId) -> Option<UploadRecord> {
        self.ledger.read().await.records.get(&task_id).cloned()
    }

    pub async fn unverified(&self) -> Vec<UploadRecord> {
        self.ledger
            .read()
            .await
            .records
            .values()
            .filter(|r| !r.verified)
            .cloned()
            .collect()
    }

    pub async fn flagged(&self) -> Vec<FlaggedArtifact> {
        self.ledger.read().await.flagged.clone()
    }

    /// Replace the ledger with records from a snapshot
    pub async fn restore(&self, records: Vec<UploadRecord>, flagged: Vec<FlaggedArtifact>) {
        let mut ledger = self.ledger.write().await;
        ledger.records = records.into_iter().map(|r| (r.source_task_id, r)).collect();
        ledger.flagged = flagged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::storage::LocalStorageProvider;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_upload_to_local_primary_is_verified() {
        let dir = TempDir::new().unwrap();
        let primary = Arc::new(LocalStorageProvider::new("local", dir.path()));
        let pipeline = StoragePipeline::new(primary, None, Arc::new(SystemClock));

        let task_id = Uuid::new_v4();
        let record = pipeline
            .upload(task_id, &Artifact::new("a.txt", b"abc".to_vec()))
            .await
            .unwrap();

        assert_eq!(record.provider, ProviderRole::Primary);
        assert_eq!(record.provider_name, "local");
        assert_eq!(record.size, 3);
        assert!(record.verified);
        assert!(!record.pinned);

        let report = pipeline.pin_pending(None).await;
        assert_eq!(report.pinned, vec![record.content_id.clone()]);
        assert!(pipeline.record_for_task(task_id).await.unwrap().pinned);
    }

    #[test]
    fn test_fit_within_leaves_room_for_every_attempt() {
        let dir = TempDir::new().unwrap();
        let provider = || -> Arc<dyn StorageProvider> { Arc::new(LocalStorageProvider::new("local", dir.path())) };

        let pipeline = StoragePipeline::new(provider(), Some(provider()), Arc::new(SystemClock));
        // 3 primary + 1 secondary + verification at 30s each, plus 2s and 4s of backoff
        assert_eq!(pipeline.worst_case(), Duration::from_secs(156));

        let budget = Duration::from_secs(30);
        let fitted = pipeline.fit_within(budget);
        assert_eq!(fitted.attempt_timeout(), Duration::from_millis(4600));
        assert!(fitted.worst_case() < budget);

        // Already fits: left alone
        let short = StoragePipeline::new(provider(), None, Arc::new(SystemClock))
            .with_attempt_timeout(Duration::from_secs(1))
            .fit_within(budget);
        assert_eq!(short.attempt_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_exhausted_message_mentions_both_providers() {
        let err = UploadError::Exhausted {
            artifact: "a.bin".into(),
            primary: ProviderError::Status { status: 503, body: "busy".into() },
            secondary: Some(ProviderError::Timeout(30)),
        };
        let msg = err.to_string();
        assert!(msg.contains("a.bin"));
        assert!(msg.contains("HTTP 503"));
        assert!(msg.contains("secondary: Request timed out after 30s"));
    }
}
