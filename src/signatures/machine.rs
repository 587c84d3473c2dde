//! Signature request state machine.
//!
//! Invariants:
//! - every transition leaves `pending` and never comes back
//! - at most one non-terminal request per event ref; member requests of a
//!   multi request use `"{event_ref}#{signer}"`
//! - a submission against a terminal request changes nothing
//!
//! Expiry is enforced lazily on submission and eagerly by [`sweep`].
//!
//! [`sweep`]: SignatureStateMachine::sweep

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::shape::{is_valid_address, normalize_address, SignatureVerifier, Verdict};
use crate::core::clock::SharedClock;
use crate::domain::signature::default_threshold;
use crate::domain::{
    MultiSignatureRequest, SignatureRequest, SignatureState, SignatureSubmission, SubmissionReceipt,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Signature request not found: {0}")]
    NotFound(String),

    #[error("Signature request {id} already processed ({state})")]
    AlreadyProcessed { id: String, state: SignatureState },

    #[error("Signature request {0} has expired")]
    Expired(String),

    #[error("Invalid signature for {id}: {reason}")]
    Invalid { id: String, reason: String },

    #[error("Verification of {id} failed: {reason}")]
    VerificationFailed { id: String, reason: String },

    #[error("Event {event_ref} already has an open signature request ({request_id})")]
    AlreadyOpen { event_ref: String, request_id: String },

    #[error("Invalid signature request: {0}")]
    Validation(String),
}

/// Expiry windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignaturePolicy {
    /// Lifetime of a single-signer request, in hours
    pub single_expiry_hours: i64,

    /// Lifetime of a multi-signer request, in hours
    pub multi_expiry_hours: i64,
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self {
            single_expiry_hours: 24,
            multi_expiry_hours: 48,
        }
    }
}

/// Requests expired by one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_requests: Vec<String>,
    pub expired_multis: Vec<String>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired_requests.len() + self.expired_multis.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenClaim {
    Single(String),
    Multi(String),
}

#[derive(Debug, Default)]
struct SignatureBook {
    requests: BTreeMap<String, SignatureRequest>,
    multis: BTreeMap<String, MultiSignatureRequest>,
    /// event ref → open (pending) request
    open_by_event: HashMap<String, OpenClaim>,
}

impl SignatureBook {
    /// Fail with `AlreadyOpen` if a live request holds `event_ref`.
    ///
    /// A claim held by a request whose deadline has passed is expired first.
    fn ensure_unclaimed(&mut self, event_ref: &str, now: DateTime<Utc>) -> Result<(), SignatureError> {
        let Some(claim) = self.open_by_event.get(event_ref).cloned() else {
            return Ok(());
        };

        match claim {
            OpenClaim::Single(id) => {
                if let Some(request) = self.requests.get(&id) {
                    if !request.state.is_terminal() && !request.is_expired_at(now) {
                        return Err(SignatureError::AlreadyOpen {
                            event_ref: event_ref.to_string(),
                            request_id: id,
                        });
                    }
                }
                self.expire_request(&id, now, "expired before a new request replaced it");
            }
            OpenClaim::Multi(id) => {
                if let Some(multi) = self.multis.get(&id) {
                    if !multi.state.is_terminal() && now < multi.expires_at {
                        return Err(SignatureError::AlreadyOpen {
                            event_ref: event_ref.to_string(),
                            request_id: id,
                        });
                    }
                }
                self.expire_multi(&id, now);
            }
        }

        self.open_by_event.remove(event_ref);
        Ok(())
    }

    fn release(&mut self, event_ref: &str) {
        self.open_by_event.remove(event_ref);
    }

    /// pending → expired; returns whether a transition happened
    fn expire_request(&mut self, id: &str, now: DateTime<Utc>, reason: &str) -> bool {
        let Some(request) = self.requests.get_mut(id) else {
            return false;
        };
        if request.state.is_terminal() {
            return false;
        }

        request.state = SignatureState::Expired;
        request.resolved_at = Some(now);
        request.reason = Some(reason.to_string());
        let event_ref = request.event_ref.clone();
        self.release(&event_ref);
        true
    }

    /// Expire a multi request and its pending members.
    ///
    /// Returns the ids of expired member requests, or `None` if the multi
    /// request was already terminal.
    fn expire_multi(&mut self, id: &str, now: DateTime<Utc>) -> Option<Vec<String>> {
        let multi = self.multis.get_mut(id)?;
        if multi.state.is_terminal() {
            return None;
        }

        multi.state = SignatureState::Expired;
        multi.resolved_at = Some(now);
        let event_ref = multi.event_ref.clone();
        let members: Vec<String> = multi.member_requests.values().cloned().collect();
        self.release(&event_ref);

        let expired = members
            .into_iter()
            .filter(|member| self.expire_request(member, now, "multi-signature request expired"))
            .collect();
        Some(expired)
    }

    fn resolve(&mut self, id: &str, state: SignatureState, now: DateTime<Utc>, reason: Option<String>) {
        if let Some(request) = self.requests.get_mut(id) {
            request.state = state;
            request.resolved_at = Some(now);
            request.reason = reason;
            let event_ref = request.event_ref.clone();
            self.release(&event_ref);
        }
    }

    /// Mark the parent verified once enough members are verified
    fn update_parent(&mut self, parent_id: &str, now: DateTime<Utc>) {
        let Some(multi) = self.multis.get(parent_id) else {
            return;
        };
        if multi.state.is_terminal() {
            return;
        }

        let verified = multi
            .member_requests
            .values()
            .filter_map(|id| self.requests.get(id))
            .filter(|r| r.state == SignatureState::Verified)
            .count();

        if verified >= multi.threshold {
            let event_ref = multi.event_ref.clone();
            if let Some(multi) = self.multis.get_mut(parent_id) {
                multi.state = SignatureState::Verified;
                multi.resolved_at = Some(now);
            }
            self.release(&event_ref);
            info!(multi_id = parent_id, verified, "Multi-signature threshold reached");
        }
    }

    fn parent_state(&self, request: &SignatureRequest) -> Option<(String, SignatureState, DateTime<Utc>)> {
        let parent_id = request.parent_id.as_ref()?;
        let multi = self.multis.get(parent_id)?;
        Some((multi.id.clone(), multi.state, multi.expires_at))
    }
}

/// Owner of all signature requests
pub struct SignatureStateMachine {
    policy: SignaturePolicy,
    clock: SharedClock,
    verifier: Arc<dyn SignatureVerifier>,
    book: RwLock<SignatureBook>,
}

impl SignatureStateMachine {
    pub fn new(policy: SignaturePolicy, clock: SharedClock, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            policy,
            clock,
            verifier,
            book: RwLock::new(SignatureBook::default()),
        }
    }

    /// Open a single-signer request
    #[instrument(skip(self, message))]
    pub async fn create(
        &self,
        event_ref: &str,
        message: &str,
        required_signer: Option<&str>,
    ) -> Result<SignatureRequest, SignatureError> {
        if message.trim().is_empty() {
            return Err(SignatureError::Validation("message must not be empty".into()));
        }
        let required_signer = required_signer.map(validated_signer).transpose()?;

        let now = self.clock.now();
        let expires_at = now + Duration::hours(self.policy.single_expiry_hours);

        let mut book = self.book.write().await;
        book.ensure_unclaimed(event_ref, now)?;

        let request = SignatureRequest::new(event_ref, message, required_signer, now, expires_at);
        book.open_by_event
            .insert(event_ref.to_string(), OpenClaim::Single(request.id.clone()));
        book.requests.insert(request.id.clone(), request.clone());

        info!(request_id = %request.id, expires_at = %expires_at, "Signature request opened");
        Ok(request)
    }

    /// Open a multi-signer request with one member request per signer
    #[instrument(skip(self, message, signers))]
    pub async fn create_multi(
        &self,
        event_ref: &str,
        message: &str,
        signers: &[String],
        threshold: Option<usize>,
    ) -> Result<MultiSignatureRequest, SignatureError> {
        if message.trim().is_empty() {
            return Err(SignatureError::Validation("message must not be empty".into()));
        }

        let signers: BTreeSet<String> = signers
            .iter()
            .map(|s| validated_signer(s))
            .collect::<Result<_, _>>()?;
        if signers.is_empty() {
            return Err(SignatureError::Validation("at least one signer is required".into()));
        }

        let threshold = threshold.unwrap_or_else(|| default_threshold(signers.len()));
        if threshold == 0 || threshold > signers.len() {
            return Err(SignatureError::Validation(format!(
                "threshold {threshold} must be between 1 and {}",
                signers.len()
            )));
        }

        let now = self.clock.now();
        let expires_at = now + Duration::hours(self.policy.multi_expiry_hours);

        let mut book = self.book.write().await;
        book.ensure_unclaimed(event_ref, now)?;

        let mut multi = MultiSignatureRequest::new(event_ref, message, signers.clone(), threshold, now, expires_at);
        for signer in &signers {
            let member_ref = multi.member_event_ref(signer);
            book.ensure_unclaimed(&member_ref, now)?;
        }

        for signer in &signers {
            let member_ref = multi.member_event_ref(signer);
            let mut member = SignatureRequest::new(&member_ref, message, Some(signer.clone()), now, expires_at);
            member.parent_id = Some(multi.id.clone());

            multi.member_requests.insert(signer.clone(), member.id.clone());
            book.open_by_event
                .insert(member_ref, OpenClaim::Single(member.id.clone()));
            book.requests.insert(member.id.clone(), member);
        }

        book.open_by_event
            .insert(event_ref.to_string(), OpenClaim::Multi(multi.id.clone()));
        book.multis.insert(multi.id.clone(), multi.clone());

        info!(
            multi_id = %multi.id,
            signers = multi.required_signers.len(),
            threshold,
            "Multi-signature request opened"
        );
        Ok(multi)
    }

    /// Submit a signature for a pending request
    #[instrument(skip(self, submission), fields(request_id = %submission.signature_request_id))]
    pub async fn submit(&self, submission: &SignatureSubmission) -> Result<SignatureRequest, SignatureError> {
        let id = submission.signature_request_id.as_str();
        let now = self.clock.now();
        let mut book = self.book.write().await;

        let request = book
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| SignatureError::NotFound(id.to_string()))?;

        match request.state {
            SignatureState::Pending => {}
            SignatureState::Expired => return Err(SignatureError::Expired(id.to_string())),
            state => {
                return Err(SignatureError::AlreadyProcessed {
                    id: id.to_string(),
                    state,
                })
            }
        }

        if let Some((parent_id, parent_state, parent_expires_at)) = book.parent_state(&request) {
            if parent_state.is_terminal() {
                return Err(SignatureError::AlreadyProcessed {
                    id: parent_id,
                    state: parent_state,
                });
            }
            if now >= parent_expires_at {
                book.expire_multi(&parent_id, now);
                warn!(multi_id = %parent_id, "Submission after multi-signature deadline");
                return Err(SignatureError::Expired(id.to_string()));
            }
        }

        if request.is_expired_at(now) {
            book.expire_request(id, now, "submitted after deadline");
            warn!("Submission after deadline");
            return Err(SignatureError::Expired(id.to_string()));
        }

        let signer = normalize_address(&submission.signer_address);
        if let Some(stored) = book.requests.get_mut(id) {
            stored.signature = Some(submission.signature.clone());
            stored.signer_address = Some(signer.clone());
        }

        let verdict = match self
            .verifier
            .verify(&request.message, &submission.signature, &submission.signer_address)
        {
            Ok(verdict) => verdict,
            Err(e) => {
                book.resolve(id, SignatureState::Failed, now, Some(e.to_string()));
                warn!(error = %e, "Signature verifier failed");
                return Err(SignatureError::VerificationFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let verdict = match (verdict, &request.required_signer) {
            (Verdict::Valid, Some(required)) if *required != signer => {
                Verdict::Invalid(format!("signer {signer} does not match required signer {required}"))
            }
            (verdict, _) => verdict,
        };

        match verdict {
            Verdict::Valid => {
                book.resolve(id, SignatureState::Verified, now, None);
                if let Some(parent_id) = &request.parent_id {
                    book.update_parent(parent_id, now);
                }
                info!(signer = %signer, "Signature verified");
                book.requests
                    .get(id)
                    .cloned()
                    .ok_or_else(|| SignatureError::NotFound(id.to_string()))
            }
            Verdict::Invalid(reason) => {
                book.resolve(id, SignatureState::Invalid, now, Some(reason.clone()));
                debug!(reason = %reason, "Signature rejected");
                Err(SignatureError::Invalid {
                    id: id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Submit and report the outcome in wire form.
    ///
    /// Invalid and expired outcomes become receipts; other errors are returned.
    pub async fn submit_receipt(&self, submission: &SignatureSubmission) -> Result<SubmissionReceipt, SignatureError> {
        match self.submit(submission).await {
            Ok(request) => Ok(SubmissionReceipt {
                status: request.state,
                request,
            }),
            Err(err @ (SignatureError::Invalid { .. } | SignatureError::Expired(_))) => {
                let request = self
                    .get(&submission.signature_request_id)
                    .await
                    .ok_or(err)?;
                Ok(SubmissionReceipt {
                    status: request.state,
                    request,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Expire every pending request past its deadline
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut book = self.book.write().await;
        let mut report = SweepReport::default();

        let stale_multis: Vec<String> = book
            .multis
            .values()
            .filter(|m| !m.state.is_terminal() && now >= m.expires_at)
            .map(|m| m.id.clone())
            .collect();

        for id in stale_multis {
            if let Some(members) = book.expire_multi(&id, now) {
                report.expired_requests.extend(members);
                report.expired_multis.push(id);
            }
        }

        let stale: Vec<String> = book
            .requests
            .values()
            .filter(|r| !r.state.is_terminal() && r.is_expired_at(now))
            .map(|r| r.id.clone())
            .collect();

        for id in stale {
            if book.expire_request(&id, now, "expired without a submission") {
                report.expired_requests.push(id);
            }
        }

        if report.total() > 0 {
            info!(
                requests = report.expired_requests.len(),
                multis = report.expired_multis.len(),
                "Expired stale signature requests"
            );
        }
        report
    }

    pub async fn get(&self, id: &str) -> Option<SignatureRequest> {
        self.book.read().await.requests.get(id).cloned()
    }

    pub async fn get_multi(&self, id: &str) -> Option<MultiSignatureRequest> {
        self.book.read().await.multis.get(id).cloned()
    }

    /// Requests still waiting for a signature.
    ///
    /// Members whose multi request already resolved are left out.
    pub async fn pending(&self) -> Vec<SignatureRequest> {
        let book = self.book.read().await;
        let mut pending: Vec<SignatureRequest> = book
            .requests
            .values()
            .filter(|r| r.state == SignatureState::Pending)
            .filter(|r| {
                book.parent_state(r)
                    .map_or(true, |(_, state, _)| !state.is_terminal())
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    pub async fn all_requests(&self) -> Vec<SignatureRequest> {
        self.book.read().await.requests.values().cloned().collect()
    }

    pub async fn all_multis(&self) -> Vec<MultiSignatureRequest> {
        self.book.read().await.multis.values().cloned().collect()
    }

    /// Replace all state with records from a snapshot
    pub async fn restore(&self, requests: Vec<SignatureRequest>, multis: Vec<MultiSignatureRequest>) {
        let mut book = self.book.write().await;
        *book = SignatureBook::default();

        for request in requests {
            if !request.state.is_terminal() {
                book.open_by_event
                    .insert(request.event_ref.clone(), OpenClaim::Single(request.id.clone()));
            }
            book.requests.insert(request.id.clone(), request);
        }
        for multi in multis {
            if !multi.state.is_terminal() {
                book.open_by_event
                    .insert(multi.event_ref.clone(), OpenClaim::Multi(multi.id.clone()));
            }
            book.multis.insert(multi.id.clone(), multi);
        }
    }
}

fn validated_signer(signer: &str) -> Result<String, SignatureError> {
    if !is_valid_address(signer.trim()) {
        return Err(SignatureError::Validation(format!("malformed signer address: {signer}")));
    }
    Ok(normalize_address(signer))
}
