//! Signature request lifecycle.
//!
//! ```text
//! pending ──valid submission──▶ verified
//!    │──invalid submission────▶ invalid
//!    │──deadline passed───────▶ expired
//!    └──verifier error────────▶ failed
//! ```

pub mod machine;
pub mod shape;

pub use machine::{SignatureError, SignaturePolicy, SignatureStateMachine, SweepReport};
pub use shape::{ShapeVerifier, SignatureVerifier, Verdict, VerifierError};
