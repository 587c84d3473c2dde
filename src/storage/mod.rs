//! Content storage providers and the fallback upload pipeline.
//!
//! A provider stores bytes and hands back a content identifier. The
//! [`StoragePipeline`] layers retry, fallback and verification on top of two
//! providers.

pub mod http;
pub mod local;
pub mod pipeline;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Metadata;

pub use http::HttpStorageProvider;
pub use local::LocalStorageProvider;
pub use pipeline::{StoragePipeline, UploadError, UploadLedger};

/// An artifact ready for upload
#[derive(Debug, Clone)]
pub struct Artifact {
    /// File name presented to the provider
    pub name: String,

    pub bytes: Vec<u8>,

    pub metadata: Metadata,
}

impl Artifact {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Failure talking to one provider
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// A content store
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Store the artifact; returns its content identifier
    async fn put(&self, artifact: &Artifact) -> Result<String, ProviderError>;

    /// Whether the content is reachable
    async fn exists(&self, content_id: &str) -> Result<bool, ProviderError>;

    /// Request long-term retention
    async fn pin(&self, content_id: &str) -> Result<(), ProviderError>;
}
