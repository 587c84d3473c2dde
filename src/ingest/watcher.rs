//! Artifact directory watcher.
//!
//! Watches a directory for files matching glob patterns and submits
//! `artifact_created` (or `artifact_changed`) events once they are stable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use glob::Pattern;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};

use crate::core::adapter::{EventAdapter, EventSubmission};
use crate::domain::EventType;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directory to watch
    pub watch_path: PathBuf,

    /// How long a file must be stable before it is submitted (seconds)
    pub stability_delay_secs: u64,

    /// Glob patterns matched against file names
    pub patterns: Vec<String>,
}

impl WatcherConfig {
    pub fn new(watch_path: impl Into<PathBuf>) -> Self {
        Self {
            watch_path: watch_path.into(),
            stability_delay_secs: 2,
            patterns: vec!["*".to_string()],
        }
    }

    /// Check that the watch path exists and the patterns compile
    pub fn validate(&self) -> Result<Vec<Pattern>, WatcherError> {
        if !self.watch_path.exists() {
            return Err(WatcherError::DirectoryNotFound(self.watch_path.clone()));
        }
        Ok(self
            .patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?)
    }
}

/// What happened to a file seen by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    New,
    Changed,
    Unchanged,
}

/// Result of a directory scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub created: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub errors: usize,
}

impl ScanResult {
    pub fn total_scanned(&self) -> usize {
        self.created + self.changed + self.unchanged
    }
}

/// Submits stable artifact files to the event adapter.
///
/// Content hashes are remembered per path, so a file is submitted once per
/// distinct content.
#[derive(Clone)]
pub struct ArtifactWatcher {
    config: WatcherConfig,
    seen: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl ArtifactWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Scan the directory once and submit every matching file
    pub async fn scan_once(&self, adapter: &EventAdapter) -> Result<ScanResult> {
        let patterns = self.config.validate()?;
        let mut result = ScanResult::default();

        let mut entries = tokio::fs::read_dir(&self.config.watch_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !matches_any(&patterns, &path) {
                continue;
            }

            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !metadata.is_file() {
                continue;
            }

            match self.submit_file(adapter, &path, metadata.len()).await {
                Ok(Detection::New) => result.created += 1,
                Ok(Detection::Changed) => result.changed += 1,
                Ok(Detection::Unchanged) => result.unchanged += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to submit artifact");
                    result.errors += 1;
                }
            }
        }

        Ok(result)
    }

    /// Submit one file if its content is new for its path
    async fn submit_file(&self, adapter: &EventAdapter, path: &Path, size: u64) -> Result<Detection> {
        let hash = compute_file_hash(path).await?;

        let detection = {
            let seen = self.seen.lock().await;
            match seen.get(path) {
                None => Detection::New,
                Some(previous) if *previous != hash => Detection::Changed,
                Some(_) => Detection::Unchanged,
            }
        };

        let event_type = match detection {
            Detection::New => EventType::ArtifactCreated,
            Detection::Changed => EventType::ArtifactChanged,
            Detection::Unchanged => {
                tracing::debug!(path = %path.display(), "Artifact unchanged");
                return Ok(detection);
            }
        };

        let submission = EventSubmission::artifact(event_type, path.to_string_lossy())
            .with_metadata("sha256", hash.clone())
            .with_metadata("size", size);
        let accepted = adapter.submit(submission).await?;

        self.seen.lock().await.insert(path.to_path_buf(), hash);
        tracing::info!(path = %path.display(), event_id = %accepted.event.id, ?detection, "Artifact submitted");
        Ok(detection)
    }

    /// Watch the directory until the returned handle is stopped
    pub fn watch(&self, adapter: Arc<EventAdapter>) -> Result<WatchHandle> {
        self.config.validate()?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let watcher = self.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = watcher.run(adapter, stop_rx).await {
                tracing::error!(error = %e, "Watcher error");
            }
        });

        Ok(WatchHandle { stop_tx, task })
    }

    async fn run(&self, adapter: Arc<EventAdapter>, mut stop_rx: mpsc::Receiver<()>) -> Result<()> {
        let patterns = self.config.validate()?;

        // Files being stabilized: path -> (size, last_seen)
        let mut pending: HashMap<PathBuf, (u64, Instant)> = HashMap::new();

        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(Duration::from_secs(1), tx)?;
        debouncer
            .watcher()
            .watch(&self.config.watch_path, RecursiveMode::NonRecursive)?;

        let stability_delay = Duration::from_secs(self.config.stability_delay_secs);
        tracing::info!(path = %self.config.watch_path.display(), "Watching for artifacts");

        loop {
            loop {
                match rx.try_recv() {
                    Ok(Ok(events)) => {
                        for event in events {
                            if !matches_any(&patterns, &event.path) {
                                continue;
                            }
                            if let Ok(metadata) = std::fs::metadata(&event.path) {
                                if metadata.is_file() {
                                    pending.insert(event.path, (metadata.len(), Instant::now()));
                                }
                            }
                        }
                    }
                    Ok(Err(e)) => tracing::warn!(error = ?e, "Watch error"),
                    Err(std::sync::mpsc::TryRecvError::Empty) => break,
                    Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                        tracing::error!("Watcher channel disconnected");
                        return Ok(());
                    }
                }
            }

            let now = Instant::now();
            let mut stable = Vec::new();
            let mut resized = Vec::new();
            for (path, (last_size, last_seen)) in &pending {
                if now.duration_since(*last_seen) < stability_delay {
                    continue;
                }
                match std::fs::metadata(path) {
                    Ok(m) if m.len() == *last_size && m.len() > 0 => stable.push((path.clone(), m.len())),
                    Ok(m) => resized.push((path.clone(), m.len())),
                    Err(_) => resized.push((path.clone(), 0)),
                }
            }

            for (path, size) in resized {
                if size == 0 {
                    pending.remove(&path);
                } else {
                    pending.insert(path, (size, now));
                }
            }

            for (path, size) in stable {
                pending.remove(&path);
                if let Err(e) = self.submit_file(&adapter, &path, size).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to submit artifact");
                }
            }

            tokio::select! {
                _ = stop_rx.recv() => {
                    tracing::info!("Watcher stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

fn matches_any(patterns: &[Pattern], path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| patterns.iter().any(|p| p.matches(name)))
        .unwrap_or(false)
}

/// SHA-256 of a file's content, hex encoded
pub async fn compute_file_hash(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
