//! Records of successful artifact uploads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// Which configured provider stored the content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    Primary,
    Secondary,
}

impl ProviderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one uploaded artifact.
///
/// At most one record exists per `source_task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    /// Content identifier returned by the provider
    pub content_id: String,

    pub source_task_id: TaskId,

    pub provider: ProviderRole,

    /// Configured name of the provider (e.g. "pinata", "local")
    pub provider_name: String,

    /// Size in bytes
    pub size: u64,

    pub uploaded_at: DateTime<Utc>,

    /// Whether long-term retention has been confirmed
    pub pinned: bool,

    /// Whether the post-upload reachability check succeeded
    pub verified: bool,
}
