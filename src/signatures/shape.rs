//! Signature shape checks.
//!
//! Signatures are opaque: they are checked for form, never recovered or
//! verified cryptographically. The accepted form is Ethereum-style hex:
//!
//! - address: `0x` + 40 hex chars
//! - signature: `0x` + 130 hex chars (65 bytes, r‖s‖v)

use thiserror::Error;

/// Verdict on a well-formed verification call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(String),
}

/// The verifier could not judge the submission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifierError {
    #[error("Verifier unavailable: {0}")]
    Unavailable(String),

    #[error("Verifier error: {0}")]
    Internal(String),
}

/// Pluggable signature check
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, message: &str, signature: &str, signer: &str) -> Result<Verdict, VerifierError>;
}

/// Accepts any signature with the right shape from a well-formed address
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeVerifier;

impl SignatureVerifier for ShapeVerifier {
    fn verify(&self, _message: &str, signature: &str, signer: &str) -> Result<Verdict, VerifierError> {
        if !is_valid_address(signer) {
            return Ok(Verdict::Invalid(format!("malformed signer address: {signer}")));
        }
        if !is_valid_signature(signature) {
            return Ok(Verdict::Invalid("malformed signature".to_string()));
        }
        Ok(Verdict::Valid)
    }
}

fn is_prefixed_hex(value: &str, hex_len: usize) -> bool {
    let Some(digits) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) else {
        return false;
    };
    digits.len() == hex_len && hex::decode(digits).is_ok()
}

pub fn is_valid_address(address: &str) -> bool {
    is_prefixed_hex(address, 40)
}

pub fn is_valid_signature(signature: &str) -> bool {
    is_prefixed_hex(signature, 130)
}

/// Canonical form used for signer comparison
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}
