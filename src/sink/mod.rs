//! Registry sinks receive completion notifications.

pub mod http;
pub mod jsonl;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::CompletionNotification;

pub use http::HttpRegistrySink;
pub use jsonl::JsonlRegistrySink;

#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("Registry rejected notification with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Registry unreachable: {0}")]
    Unreachable(String),

    #[error("Failed to write notification: {0}")]
    Io(String),
}

#[async_trait]
pub trait RegistrySink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, notification: &CompletionNotification) -> Result<(), SinkError>;
}
