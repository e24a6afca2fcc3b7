//! # Trust Protocol
//!
//! The handshakes that take a Component from unknown to booted.
//!
//! ## Components
//! - **Session**: per-peer state machine (Unkeyed → Keyed → Attested → Authorized)
//! - **Handshake**: X25519 key exchange with SHA-256 commitments
//! - **Attestation**: signed challenge and evidence exchange
//! - **Boot**: signed boot authorization and acknowledgement
//! - **Replace**: signed proof that an incoming component belongs to the deployment
//! - **Dispatcher**: magic-to-handler routing for responders
//!
//! Every step takes the session by reference and returns a `Result`; no step
//! retries internally and none advances state on failure.

pub mod attestation;
pub mod boot;
pub mod dispatcher;
pub mod handshake;
pub mod replace;
pub mod session;
