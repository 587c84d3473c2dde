//! Append-only event log with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL). The hot file holds the
//! most recent entries; [`EventLog::sweep`] moves overflow and entries past the
//! retention window to a cold archive file. Nothing is ever deleted.
//!
//! ```text
//! log_dir/
//!   events.jsonl    hot, bounded
//!   archive.jsonl   cold, append-only
//!   events.lock     advisory lock shared by all writers
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use tracing::{debug, info};

use crate::domain::Event;

/// Where accepted events are recorded
#[async_trait]
pub trait EventJournal: Send + Sync {
    async fn append(&self, event: &Event) -> Result<()>;
}

/// Outcome of an archive sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub archived: usize,
    pub retained: usize,
}

/// File-based event log using JSONL format
#[derive(Debug, Clone)]
pub struct EventLog {
    events_path: PathBuf,
    archive_path: PathBuf,
    lock_path: PathBuf,

    /// Maximum entries kept in the hot file
    hot_limit: usize,

    /// Age after which entries move to the archive
    retention: Duration,
}

impl EventLog {
    /// Create or open an event log in `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create event log directory: {}", dir.display()))?;

        Ok(Self {
            events_path: dir.join("events.jsonl"),
            archive_path: dir.join("archive.jsonl"),
            lock_path: dir.join("events.lock"),
            hot_limit: 1000,
            retention: Duration::days(7),
        })
    }

    pub fn with_hot_limit(mut self, hot_limit: usize) -> Self {
        self.hot_limit = hot_limit;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Get the path to the hot events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the path to the archive file
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    fn lock(&self) -> Result<File> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file: {}", self.lock_path.display()))?;
        lock.lock_exclusive()
            .context("Failed to acquire file lock on events.jsonl")?;
        Ok(lock)
    }

    fn append_blocking(&self, line: &str) -> Result<()> {
        let _lock = self.lock()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        writeln!(file, "{}", line).context("Failed to write event")?;
        file.flush().context("Failed to flush event")?;

        // Lock is released when _lock is dropped
        Ok(())
    }

    /// Replay all events in the hot file, in append order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        let path = self.events_path.clone();
        tokio::task::spawn_blocking(move || read_events(&path))
            .await
            .context("Event replay task failed")?
    }

    /// Replay all archived events, in archive order
    pub async fn replay_archive(&self) -> Result<Vec<Event>> {
        let path = self.archive_path.clone();
        tokio::task::spawn_blocking(move || read_events(&path))
            .await
            .context("Archive replay task failed")?
    }

    /// Find an event by id in the hot file or the archive
    pub async fn find(&self, event_id: &str) -> Result<Option<Event>> {
        if let Some(event) = self.replay().await?.into_iter().find(|e| e.id == event_id) {
            return Ok(Some(event));
        }
        Ok(self
            .replay_archive()
            .await?
            .into_iter()
            .find(|e| e.id == event_id))
    }

    /// Move overflow and expired entries to the archive
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<ArchiveReport> {
        let log = self.clone();
        tokio::task::spawn_blocking(move || log.sweep_blocking(now))
            .await
            .context("Event log sweep task failed")?
    }

    fn sweep_blocking(&self, now: DateTime<Utc>) -> Result<ArchiveReport> {
        let _lock = self.lock()?;

        let events = read_events(&self.events_path)?;
        let cutoff = now - self.retention;

        let (expired, mut fresh): (Vec<Event>, Vec<Event>) =
            events.into_iter().partition(|e| e.timestamp < cutoff);

        let overflow = fresh.len().saturating_sub(self.hot_limit);
        let mut archive: Vec<Event> = expired;
        archive.extend(fresh.drain(..overflow));

        if archive.is_empty() {
            debug!(retained = fresh.len(), "Nothing to archive");
            return Ok(ArchiveReport {
                archived: 0,
                retained: fresh.len(),
            });
        }

        // Archive first: a crash in between duplicates entries, never loses them
        let mut archive_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.archive_path)
            .with_context(|| format!("Failed to open archive file: {}", self.archive_path.display()))?;
        for event in &archive {
            let json = serde_json::to_string(event).context("Failed to serialize event")?;
            writeln!(archive_file, "{}", json).context("Failed to write archive entry")?;
        }
        archive_file.sync_all().context("Failed to sync archive file")?;

        let dir = self
            .events_path
            .parent()
            .context("Events file has no parent directory")?;
        let mut hot = tempfile::NamedTempFile::new_in(dir).context("Failed to create temp events file")?;
        for event in &fresh {
            let json = serde_json::to_string(event).context("Failed to serialize event")?;
            writeln!(hot, "{}", json).context("Failed to write event")?;
        }
        hot.as_file().sync_all().context("Failed to sync events file")?;
        hot.persist(&self.events_path)
            .with_context(|| format!("Failed to replace events file: {}", self.events_path.display()))?;

        info!(archived = archive.len(), retained = fresh.len(), "Event log swept");
        Ok(ArchiveReport {
            archived: archive.len(),
            retained: fresh.len(),
        })
    }
}

#[async_trait]
impl EventJournal for EventLog {
    async fn append(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event).context("Failed to serialize event")?;
        let log = self.clone();
        tokio::task::spawn_blocking(move || log.append_blocking(&line))
            .await
            .context("Event append task failed")?
    }
}

fn read_events(path: &Path) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).with_context(|| format!("Failed to open events file: {}", path.display()))?;

    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event =
            serde_json::from_str(&line).with_context(|| format!("Failed to parse event: {}", line))?;
        events.push(event);
    }

    Ok(events)
}
