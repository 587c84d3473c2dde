//! Signature request records.
//!
//! These are plain data. All transitions go through
//! [`SignatureStateMachine`](crate::signatures::SignatureStateMachine), which
//! is the only writer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a signature request. Every transition out of `Pending` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureState {
    #[default]
    Pending,
    Verified,
    Invalid,
    Expired,
    /// The verifier itself failed; the submission was never judged
    Failed,
}

impl SignatureState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SignatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for one signature over a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRequest {
    pub id: String,

    pub event_ref: String,

    /// Message the signer is asked to sign
    pub message: String,

    /// Address that must produce the signature (lowercased), if constrained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_signer: Option<String>,

    pub state: SignatureState,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    /// Why the request ended up invalid, expired or failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Owning multi-signature request, for member requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl SignatureRequest {
    pub fn new(
        event_ref: impl Into<String>,
        message: impl Into<String>,
        required_signer: Option<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("sig-{}", Uuid::new_v4()),
            event_ref: event_ref.into(),
            message: message.into(),
            required_signer,
            state: SignatureState::Pending,
            created_at,
            expires_at,
            signature: None,
            signer_address: None,
            resolved_at: None,
            reason: None,
            parent_id: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A request that needs `threshold` of `required_signers` to sign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiSignatureRequest {
    pub id: String,

    pub event_ref: String,

    pub message: String,

    /// Lowercased signer addresses
    pub required_signers: BTreeSet<String>,

    pub threshold: usize,

    /// signer → member request id
    pub member_requests: BTreeMap<String, String>,

    pub state: SignatureState,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl MultiSignatureRequest {
    pub fn new(
        event_ref: impl Into<String>,
        message: impl Into<String>,
        required_signers: BTreeSet<String>,
        threshold: usize,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("msig-{}", Uuid::new_v4()),
            event_ref: event_ref.into(),
            message: message.into(),
            required_signers,
            threshold,
            member_requests: BTreeMap::new(),
            state: SignatureState::Pending,
            created_at,
            expires_at,
            resolved_at: None,
        }
    }

    /// Event ref of the member request for one signer
    pub fn member_event_ref(&self, signer: &str) -> String {
        format!("{}#{}", self.event_ref, signer)
    }
}

/// Default threshold for `n` signers: a simple majority, rounded up
pub fn default_threshold(signers: usize) -> usize {
    signers.div_ceil(2).max(1)
}

/// Inbound signature submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureSubmission {
    pub signature_request_id: String,
    pub signature: String,
    pub signer_address: String,
}

/// Outcome reported back to the submitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub status: SignatureState,
    pub request: SignatureRequest,
}
