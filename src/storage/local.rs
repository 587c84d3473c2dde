//! Content-addressed directory store.
//!
//! Layout:
//! ```text
//! root/
//!   objects/<sha256-hex>
//!   pins/<sha256-hex>
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{Artifact, ProviderError, StorageProvider};

pub struct LocalStorageProvider {
    name: String,
    root: PathBuf,
}

impl LocalStorageProvider {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// SHA-256 of the content, hex encoded
    pub fn content_id(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn object_path(&self, content_id: &str) -> Result<PathBuf, ProviderError> {
        validate_content_id(content_id)?;
        Ok(self.root.join("objects").join(content_id))
    }

    fn pin_path(&self, content_id: &str) -> Result<PathBuf, ProviderError> {
        validate_content_id(content_id)?;
        Ok(self.root.join("pins").join(content_id))
    }
}

fn validate_content_id(content_id: &str) -> Result<(), ProviderError> {
    if content_id.is_empty() || !content_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ProviderError::InvalidResponse(format!(
            "not a local content id: {content_id}"
        )));
    }
    Ok(())
}

fn io_error(err: std::io::Error) -> ProviderError {
    ProviderError::Io(err.to_string())
}

#[async_trait]
impl StorageProvider for LocalStorageProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, artifact: &Artifact) -> Result<String, ProviderError> {
        let content_id = Self::content_id(&artifact.bytes);
        let path = self.object_path(&content_id)?;

        if tokio::fs::try_exists(&path).await.map_err(io_error)? {
            return Ok(content_id);
        }

        let dir = self.root.join("objects");
        tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;

        // Write to a temp file in the same directory, then rename into place
        let bytes = artifact.bytes.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            std::io::Write::write_all(&mut tmp, &bytes)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| ProviderError::Io(e.to_string()))?
        .map_err(io_error)?;

        Ok(content_id)
    }

    async fn exists(&self, content_id: &str) -> Result<bool, ProviderError> {
        let path = self.object_path(content_id)?;
        tokio::fs::try_exists(path).await.map_err(io_error)
    }

    async fn pin(&self, content_id: &str) -> Result<(), ProviderError> {
        if !self.exists(content_id).await? {
            return Err(ProviderError::Status {
                status: 404,
                body: format!("unknown content {content_id}"),
            });
        }

        let path = self.pin_path(content_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(path, b"").await.map_err(io_error)
    }
}
