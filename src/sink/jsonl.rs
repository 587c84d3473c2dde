//! Append-only completions file for local observers.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{RegistrySink, SinkError};
use crate::domain::CompletionNotification;

pub struct JsonlRegistrySink {
    path: PathBuf,
}

impl JsonlRegistrySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every delivered notification
    pub fn read_all(&self) -> anyhow::Result<Vec<CompletionNotification>> {
        use anyhow::Context;

        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid notification on line {}", i + 1))
            })
            .collect()
    }
}

#[async_trait]
impl RegistrySink for JsonlRegistrySink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn deliver(&self, notification: &CompletionNotification) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(notification).map_err(|e| SinkError::Io(e.to_string()))?;
        line.push('\n');

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(line.as_bytes())?;
            file.sync_all()
        })
        .await
        .map_err(|e| SinkError::Io(e.to_string()))?
        .map_err(|e| SinkError::Io(e.to_string()))
    }
}
