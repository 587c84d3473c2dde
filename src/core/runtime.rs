//! Wiring of every component from configuration.
//!
//! A [`Runtime`] owns the orchestrator and its command channel. The CLI uses
//! it one-shot (restore, submit, run until idle, snapshot); `serve` hands the
//! orchestrator to its service loop alongside the watcher and scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::adapter::{Acceptance, AdapterConfig, EventAdapter, EventSubmission};
use super::clock::{SharedClock, SystemClock};
use super::error::OrchestratorError;
use super::event_store::{ArchiveReport, EventLog};
use super::orchestrator::{DrainReport, Orchestrator, OrchestratorCommand, OrchestratorHandle, QueueStatus};
use super::snapshot::{FileStateStore, MemoryStateStore, SnapshotWriter, SqliteStateStore, StateStore};
use crate::config::{ProviderConfig, ResolvedConfig, StateStoreKind};
use crate::domain::{Notification, SignatureRequest, SignatureSubmission, SubmissionReceipt, Task};
use crate::executors::{
    ArchiveEventsExecutor, ExecutorRegistry, PinExecutor, ReconcileExecutor, RegistryNotifyExecutor, SignatureRequestExecutor,
    SignatureSweepExecutor, UploadExecutor, UPLOAD_DEADLINE,
};
use crate::ingest::{ArtifactWatcher, RitualScheduler, WatcherConfig};
use crate::signatures::{ShapeVerifier, SignatureError, SignatureStateMachine, SignatureVerifier, SweepReport};
use crate::sink::{HttpRegistrySink, JsonlRegistrySink, RegistrySink};
use crate::storage::{HttpStorageProvider, LocalStorageProvider, StoragePipeline, StorageProvider};

/// Capacity of the orchestrator command channel
const COMMAND_CAPACITY: usize = 1024;

/// Replaceable collaborators; everything else is built from config
pub struct Components {
    pub clock: SharedClock,
    pub primary: Arc<dyn StorageProvider>,
    pub secondary: Option<Arc<dyn StorageProvider>>,
    pub sink: Arc<dyn RegistrySink>,
    pub store: Arc<dyn StateStore>,
    pub verifier: Arc<dyn SignatureVerifier>,
}

impl Components {
    /// Build the collaborators described by `config`
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let store: Arc<dyn StateStore> = match config.state_store {
            StateStoreKind::Sqlite => Arc::new(SqliteStateStore::open(config.state_path())?),
            StateStoreKind::File => Arc::new(FileStateStore::new(config.state_path())),
            StateStoreKind::Memory => Arc::new(MemoryStateStore::new()),
        };

        let sink: Arc<dyn RegistrySink> = match config.registry.endpoint {
            Some(ref endpoint) => {
                let mut sink = HttpRegistrySink::new(endpoint.clone());
                if let Some(ref token) = config.registry.token {
                    sink = sink.with_token(token.clone());
                }
                if let Some(secs) = config.registry.timeout_secs {
                    sink = sink.with_timeout(Duration::from_secs(secs));
                }
                Arc::new(sink)
            }
            None => Arc::new(JsonlRegistrySink::new(config.completions_path())),
        };

        Ok(Self {
            clock: Arc::new(SystemClock),
            primary: build_provider(&config.storage.primary),
            secondary: config.storage.secondary.as_ref().map(build_provider),
            sink,
            store,
            verifier: Arc::new(ShapeVerifier),
        })
    }
}

fn build_provider(config: &ProviderConfig) -> Arc<dyn StorageProvider> {
    match config {
        ProviderConfig::Http {
            name,
            upload_url,
            gateway_url,
            pin_url,
            token,
            timeout_secs,
        } => {
            let mut provider = HttpStorageProvider::new(name.clone(), upload_url.clone(), gateway_url.clone());
            if let Some(token) = token {
                provider = provider.with_token(token.clone());
            }
            if let Some(pin_url) = pin_url {
                provider = provider.with_pin_url(pin_url.clone());
            }
            if let Some(secs) = timeout_secs {
                provider = provider.with_timeout(Duration::from_secs(*secs));
            }
            Arc::new(provider)
        }
        ProviderConfig::Local { name, root } => Arc::new(LocalStorageProvider::new(name.clone(), root.clone())),
    }
}

/// What one maintenance sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub archive: ArchiveReport,
    pub removed_tasks: usize,
    pub signatures: SweepReport,
}

pub struct Runtime {
    config: ResolvedConfig,
    clock: SharedClock,
    pipeline: Arc<StoragePipeline>,
    signatures: Arc<SignatureStateMachine>,
    event_log: Arc<EventLog>,
    orchestrator: Orchestrator,
    commands: mpsc::Receiver<OrchestratorCommand>,
    handle: OrchestratorHandle,
    adapter: Arc<EventAdapter>,
    snapshots: SnapshotWriter,
}

impl Runtime {
    /// Build a runtime with collaborators from config
    pub fn from_config(config: ResolvedConfig) -> Result<Self> {
        let components = Components::from_config(&config)?;
        Self::assemble(config, components)
    }

    /// Build a runtime around the given collaborators
    pub fn assemble(config: ResolvedConfig, components: Components) -> Result<Self> {
        let Components {
            clock,
            primary,
            secondary,
            sink,
            store,
            verifier,
        } = components;

        let pipeline = Arc::new(
            StoragePipeline::new(primary, secondary, clock.clone())
                .with_retry(config.storage.retry.clone())
                .with_attempt_timeout(Duration::from_secs(config.storage.attempt_timeout_secs))
                .fit_within(UPLOAD_DEADLINE),
        );
        let signatures = Arc::new(SignatureStateMachine::new(config.signatures, clock.clone(), verifier));

        let event_log = Arc::new(
            EventLog::open(config.events_dir())?
                .with_hot_limit(config.event_log.hot_limit)
                .with_retention(chrono::Duration::days(config.event_log.retention_days)),
        );

        let executors = ExecutorRegistry::new()
            .with(Arc::new(UploadExecutor::new(pipeline.clone(), config.artifacts_dir.clone())))
            .with(Arc::new(SignatureRequestExecutor::new(signatures.clone())))
            .with(Arc::new(RegistryNotifyExecutor::new(sink)))
            .with(Arc::new(PinExecutor::new(pipeline.clone())))
            .with(Arc::new(ReconcileExecutor::new(pipeline.clone())))
            .with(Arc::new(SignatureSweepExecutor::new(signatures.clone())))
            .with(Arc::new(ArchiveEventsExecutor::new(event_log.clone(), clock.clone())));

        let orchestrator = Orchestrator::new(config.orchestrator.clone(), Arc::new(executors), clock.clone());

        let (handle, commands) = OrchestratorHandle::channel(COMMAND_CAPACITY);
        let adapter = Arc::new(
            EventAdapter::new(
                event_log.clone(),
                handle.clone(),
                orchestrator.notifications(),
                clock.clone(),
            )
            .with_config(AdapterConfig {
                log_attempts: config.event_log.write_attempts,
                ..AdapterConfig::default()
            }),
        );

        let snapshots = SnapshotWriter::new(store, pipeline.clone(), signatures.clone(), clock.clone());

        Ok(Self {
            config,
            clock,
            pipeline,
            signatures,
            event_log,
            orchestrator,
            commands,
            handle,
            adapter,
            snapshots,
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn adapter(&self) -> Arc<EventAdapter> {
        self.adapter.clone()
    }

    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn pipeline(&self) -> &StoragePipeline {
        &self.pipeline
    }

    pub fn signatures(&self) -> &SignatureStateMachine {
        &self.signatures
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.orchestrator.subscribe()
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.orchestrator.task(id)
    }

    /// Load the latest snapshot into every component; returns re-queued tasks
    #[instrument(skip(self))]
    pub async fn restore(&mut self) -> Result<usize> {
        let Some(snapshot) = self.snapshots.load_latest().await? else {
            info!("No snapshot to restore");
            return Ok(0);
        };

        self.pipeline
            .restore(snapshot.upload_records, snapshot.flagged_artifacts)
            .await;
        self.signatures
            .restore(snapshot.signature_requests, snapshot.multi_signature_requests)
            .await;
        Ok(self.orchestrator.restore(snapshot.tasks))
    }

    /// Accept a submission and plan its tasks (without running them)
    pub async fn submit(&mut self, submission: EventSubmission) -> Result<Acceptance, OrchestratorError> {
        let accepted = self.adapter.submit(submission).await?;
        self.orchestrator.pump(&mut self.commands);
        Ok(accepted)
    }

    /// Run queued work to completion and write a snapshot
    pub async fn run_until_idle(&mut self) -> Result<DrainReport> {
        self.orchestrator.pump(&mut self.commands);
        let report = self.orchestrator.drain().await;
        self.snapshot().await?;
        Ok(report)
    }

    pub async fn snapshot(&self) -> Result<()> {
        self.snapshots
            .write(self.orchestrator.tasks())
            .await
            .context("Failed to write snapshot")
    }

    pub fn status(&self) -> QueueStatus {
        self.orchestrator.status()
    }

    /// Cancel a queued task and persist the change
    pub async fn cancel(&mut self, id: Uuid) -> Result<Task> {
        let task = self.orchestrator.cancel(id)?;
        self.snapshot().await?;
        Ok(task)
    }

    pub async fn pending_signatures(&self) -> Vec<SignatureRequest> {
        self.signatures.pending().await
    }

    /// Submit a signature and persist the resulting state
    pub async fn submit_signature(&self, submission: &SignatureSubmission) -> Result<SubmissionReceipt, SignatureError> {
        let result = self.signatures.submit_receipt(submission).await;
        // Expiry on submit changes state too
        if let Err(e) = self.snapshot().await {
            warn!(error = %e, "Failed to persist signature state");
        }
        result
    }

    /// Archive old events, drop old tasks and expire stale signatures
    #[instrument(skip(self))]
    pub async fn sweep(&mut self) -> Result<SweepSummary> {
        let archive = self.event_log.sweep(self.clock.now()).await?;
        let removed_tasks = self.orchestrator.maintain();
        let signatures = self.signatures.sweep().await;
        self.snapshot().await?;

        Ok(SweepSummary {
            archive,
            removed_tasks,
            signatures,
        })
    }

    /// Run as a service until ctrl-c
    pub async fn serve(self) -> Result<()> {
        let Runtime {
            config,
            mut orchestrator,
            commands,
            handle,
            adapter,
            snapshots,
            ..
        } = self;

        let watch = if config.watcher.enabled {
            std::fs::create_dir_all(&config.artifacts_dir)
                .with_context(|| format!("Failed to create artifacts directory: {}", config.artifacts_dir.display()))?;
            let watcher = ArtifactWatcher::new(WatcherConfig {
                watch_path: config.artifacts_dir.clone(),
                stability_delay_secs: config.watcher.stability_secs,
                patterns: config.watcher.patterns.clone(),
            });
            let initial = watcher.scan_once(&adapter).await?;
            info!(created = initial.created, "Initial artifact scan");
            Some(watcher.watch(adapter.clone())?)
        } else {
            None
        };

        let schedule = RitualScheduler::new(config.rituals.clone()).spawn(adapter.clone());

        let shutdown = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
                let _ = shutdown.shutdown().await;
            }
        });

        orchestrator.run(commands, Some(snapshots)).await;

        schedule.stop();
        if let Some(watch) = watch {
            watch.stop().await?;
        }
        Ok(())
    }
}
