//! Signature Lifecycle Integration Tests
//!
//! pending → verified | invalid | expired | failed, single and multi-signer.

use std::sync::Arc;

use chrono::Duration;

use ritual::core::clock::ManualClock;
use ritual::domain::{SignatureState, SignatureSubmission};
use ritual::signatures::{
    ShapeVerifier, SignatureError, SignaturePolicy, SignatureStateMachine, SignatureVerifier, Verdict, VerifierError,
};

const ALICE: &str = "0x1111111111111111111111111111111111111111";
const BOB: &str = "0x2222222222222222222222222222222222222222";
const CAROL: &str = "0x3333333333333333333333333333333333333333";

fn signature() -> String {
    format!("0x{}", "ab".repeat(65))
}

fn submission(request_id: &str, signer: &str) -> SignatureSubmission {
    SignatureSubmission {
        signature_request_id: request_id.to_string(),
        signature: signature(),
        signer_address: signer.to_string(),
    }
}

fn machine() -> (SignatureStateMachine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let machine = SignatureStateMachine::new(SignaturePolicy::default(), clock.clone(), Arc::new(ShapeVerifier));
    (machine, clock)
}

#[tokio::test]
async fn test_single_request_verified_once() {
    let (machine, _clock) = machine();
    let request = machine.create("evt-1", "release v1.2", Some(ALICE)).await.unwrap();
    assert_eq!(request.state, SignatureState::Pending);
    assert_eq!(machine.pending().await.len(), 1);

    let verified = machine.submit(&submission(&request.id, ALICE)).await.unwrap();
    assert_eq!(verified.state, SignatureState::Verified);
    assert_eq!(verified.signer_address.as_deref(), Some(ALICE));
    assert!(machine.pending().await.is_empty());

    let before = machine.get(&request.id).await.unwrap();
    let mut replay = submission(&request.id, BOB);
    replay.signature = format!("0x{}", "cd".repeat(65));
    let again = machine.submit(&replay).await;
    assert!(matches!(
        again,
        Err(SignatureError::AlreadyProcessed { state: SignatureState::Verified, .. })
    ));

    // Replay leaves the stored request untouched
    let after = machine.get(&request.id).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.signature, Some(signature()));
    assert_eq!(after.signer_address.as_deref(), Some(ALICE));
}

#[tokio::test]
async fn test_signer_address_is_case_insensitive() {
    let (machine, _clock) = machine();
    let upper = format!("0x{}", "ABCDEF0123".repeat(4));
    let request = machine.create("evt-1", "m", Some(&upper)).await.unwrap();

    let verified = machine
        .submit(&submission(&request.id, &upper.to_lowercase()))
        .await
        .unwrap();
    assert_eq!(verified.state, SignatureState::Verified);
}

#[tokio::test]
async fn test_wrong_signer_is_invalid() {
    let (machine, _clock) = machine();
    let request = machine.create("evt-1", "m", Some(ALICE)).await.unwrap();

    let receipt = machine.submit_receipt(&submission(&request.id, BOB)).await.unwrap();
    assert_eq!(receipt.status, SignatureState::Invalid);
    assert!(receipt.request.reason.unwrap().contains("does not match"));

    // Terminal: a later correct submission is refused without changing the request
    let before = machine.get(&request.id).await.unwrap();
    assert!(matches!(
        machine.submit(&submission(&request.id, ALICE)).await,
        Err(SignatureError::AlreadyProcessed { state: SignatureState::Invalid, .. })
    ));
    assert_eq!(machine.get(&request.id).await.unwrap(), before);
}

#[tokio::test]
async fn test_malformed_signature_is_invalid() {
    let (machine, _clock) = machine();
    let request = machine.create("evt-1", "m", None).await.unwrap();

    let mut bad = submission(&request.id, ALICE);
    bad.signature = "0xdeadbeef".into();
    assert!(matches!(machine.submit(&bad).await, Err(SignatureError::Invalid { .. })));
    assert_eq!(machine.get(&request.id).await.unwrap().state, SignatureState::Invalid);
}

#[tokio::test]
async fn test_submission_after_deadline_expires_request() {
    let (machine, clock) = machine();
    let request = machine.create("evt-1", "m", Some(ALICE)).await.unwrap();

    clock.advance(Duration::hours(24));
    assert!(matches!(
        machine.submit(&submission(&request.id, ALICE)).await,
        Err(SignatureError::Expired(_))
    ));

    let stored = machine.get(&request.id).await.unwrap();
    assert_eq!(stored.state, SignatureState::Expired);
    assert!(stored.signature.is_none());

    // Expired stays expired, and a late retry changes nothing
    clock.advance(Duration::hours(1));
    assert!(matches!(
        machine.submit(&submission(&request.id, ALICE)).await,
        Err(SignatureError::Expired(_))
    ));
    let after = machine.get(&request.id).await.unwrap();
    assert_eq!(after, stored);
    assert!(after.signer_address.is_none());
}

#[tokio::test]
async fn test_sweep_expires_only_stale_requests() {
    let (machine, clock) = machine();
    let old = machine.create("evt-old", "m", None).await.unwrap();
    clock.advance(Duration::hours(20));
    let fresh = machine.create("evt-new", "m", None).await.unwrap();

    clock.advance(Duration::hours(5));
    let report = machine.sweep().await;
    assert_eq!(report.expired_requests, vec![old.id.clone()]);
    assert!(report.expired_multis.is_empty());

    let pending: Vec<String> = machine.pending().await.into_iter().map(|r| r.id).collect();
    assert_eq!(pending, vec![fresh.id]);
    assert_eq!(machine.sweep().await.total(), 0);
}

#[tokio::test]
async fn test_one_open_request_per_event() {
    let (machine, clock) = machine();
    let first = machine.create("evt-1", "m", None).await.unwrap();

    match machine.create("evt-1", "m", None).await {
        Err(SignatureError::AlreadyOpen { request_id, .. }) => assert_eq!(request_id, first.id),
        other => panic!("expected AlreadyOpen, got {other:?}"),
    }

    // Once the first request lapses the event can be asked again
    clock.advance(Duration::hours(25));
    let second = machine.create("evt-1", "m", None).await.unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(machine.get(&first.id).await.unwrap().state, SignatureState::Expired);
}

#[tokio::test]
async fn test_multi_signature_threshold() {
    let (machine, _clock) = machine();
    let signers = vec![ALICE.to_string(), BOB.to_string(), CAROL.to_string()];
    let multi = machine.create_multi("evt-m", "treasury move", &signers, Some(2)).await.unwrap();
    assert_eq!(multi.member_requests.len(), 3);
    assert_eq!(machine.pending().await.len(), 3);

    let alice_req = &multi.member_requests[ALICE];
    let bob_req = &multi.member_requests[BOB];
    let carol_req = &multi.member_requests[CAROL];

    machine.submit(&submission(alice_req, ALICE)).await.unwrap();
    assert_eq!(machine.get_multi(&multi.id).await.unwrap().state, SignatureState::Pending);

    machine.submit(&submission(bob_req, BOB)).await.unwrap();
    assert_eq!(machine.get_multi(&multi.id).await.unwrap().state, SignatureState::Verified);

    // Carol's member is no longer pending and cannot be submitted
    assert!(machine.pending().await.is_empty());
    assert!(matches!(
        machine.submit(&submission(carol_req, CAROL)).await,
        Err(SignatureError::AlreadyProcessed { state: SignatureState::Verified, .. })
    ));
}

#[tokio::test]
async fn test_multi_signature_default_threshold_is_majority() {
    let (machine, _clock) = machine();
    let signers = vec![ALICE.to_string(), BOB.to_string(), CAROL.to_string()];
    let multi = machine.create_multi("evt-m", "m", &signers, None).await.unwrap();
    assert_eq!(multi.threshold, 2);

    assert!(matches!(
        machine.create_multi("evt-n", "m", &signers, Some(4)).await,
        Err(SignatureError::Validation(_))
    ));
}

#[tokio::test]
async fn test_multi_signature_expiry_sweeps_members() {
    let (machine, clock) = machine();
    let signers = vec![ALICE.to_string(), BOB.to_string()];
    let multi = machine.create_multi("evt-m", "m", &signers, Some(2)).await.unwrap();
    machine
        .submit(&submission(&multi.member_requests[ALICE], ALICE))
        .await
        .unwrap();

    clock.advance(Duration::hours(48));
    let report = machine.sweep().await;
    assert_eq!(report.expired_multis, vec![multi.id.clone()]);
    assert_eq!(report.expired_requests, vec![multi.member_requests[BOB].clone()]);

    assert_eq!(machine.get_multi(&multi.id).await.unwrap().state, SignatureState::Expired);
    // The verified member keeps its state
    assert_eq!(
        machine.get(&multi.member_requests[ALICE]).await.unwrap().state,
        SignatureState::Verified
    );
}

struct BrokenVerifier;

impl SignatureVerifier for BrokenVerifier {
    fn verify(&self, _message: &str, _signature: &str, _signer: &str) -> Result<Verdict, VerifierError> {
        Err(VerifierError::Unavailable("key service down".into()))
    }
}

#[tokio::test]
async fn test_verifier_error_fails_request() {
    let machine = SignatureStateMachine::new(
        SignaturePolicy::default(),
        Arc::new(ManualClock::default()),
        Arc::new(BrokenVerifier),
    );
    let request = machine.create("evt-1", "m", None).await.unwrap();

    assert!(matches!(
        machine.submit(&submission(&request.id, ALICE)).await,
        Err(SignatureError::VerificationFailed { .. })
    ));
    let stored = machine.get(&request.id).await.unwrap();
    assert_eq!(stored.state, SignatureState::Failed);
    assert!(stored.reason.unwrap().contains("key service down"));
}

#[tokio::test]
async fn test_unknown_request() {
    let (machine, _clock) = machine();
    assert!(matches!(
        machine.submit(&submission("sig-missing", ALICE)).await,
        Err(SignatureError::NotFound(_))
    ));
}
