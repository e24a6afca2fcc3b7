//! # Error Types
//!
//! Error handling for the trust protocol.
//!
//! Every protocol step returns a [`Result`]; nothing unwinds across steps. The
//! caller driving the state machine inspects the error to decide whether to
//! retry, escalate, or halt.
//!
//! ## Error Categories
//! - **Integrity**: checksum mismatches, truncated frames, oversized lengths
//! - **Security events**: signature, HMAC and replay failures
//! - **Transport**: bus failures and timeouts (retryable by the caller)
//! - **State**: protocol steps attempted out of order
//! - **Provisioning**: key unwrap, PIN/token checks, configuration
//!
//! ## Example Usage
//! ```rust
//! use trustbus::error::{ProtocolError, Result};
//! use tracing::{error, warn};
//!
//! fn handle(step: Result<()>) {
//!     match step {
//!         Ok(()) => {}
//!         Err(e) if e.is_security_event() => warn!(error = %e, "peer is untrusted"),
//!         Err(e) if e.is_retryable() => warn!(error = %e, "retry later"),
//!         Err(e) => error!(error = %e, "step failed"),
//!     }
//! }
//! ```

use crate::core::packet::Magic;
use crate::protocol::session::SessionState;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Handshake errors
    pub const ERR_KEX_SECRET_NOT_FOUND: &str = "Key exchange secret already consumed";
    pub const ERR_KEX_MATERIAL_LEN: &str = "Key exchange material must be 32 bytes";
    pub const ERR_NON_CONTRIBUTORY: &str = "Peer key material produced a non-contributory secret";

    /// Attestation and boot errors
    pub const ERR_ATTEST_COMMAND_SIG: &str = "Attestation command signature rejected";
    pub const ERR_ATTEST_ACK_SIG: &str = "Attestation response signature rejected";
    pub const ERR_BOOT_COMMAND_SIG: &str = "Boot command signature rejected";
    pub const ERR_BOOT_ACK_SIG: &str = "Boot acknowledgement signature rejected";
    pub const ERR_CHALLENGE_LEN: &str = "Challenge has unexpected length";
    pub const ERR_REPLACE_ACK_SIG: &str = "Replacement acknowledgement signature rejected";

    /// Key storage errors
    pub const ERR_UNWRAP_FAILED: &str = "Wrapped key failed authentication";
    pub const ERR_RANDOM_FAILED: &str = "Random number generator unavailable";
    pub const ERR_SIGNING_FAILED: &str = "Signing failed";

    /// Bus errors
    pub const ERR_NO_DEVICE: &str = "No device at bus address";
    pub const ERR_BUS_CLOSED: &str = "Bus connection closed";
    pub const ERR_BRIDGE_DESYNC: &str = "Bridge stream lost framing, reconnect required";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("Checksum mismatch: packet carried {received:#010x}, computed {computed:#010x}")]
    Checksum { received: u32, computed: u32 },

    #[error("Checksum engine unavailable")]
    ChecksumUnavailable,

    #[error("Declared length {declared} exceeds capacity {capacity}")]
    Length { declared: usize, capacity: usize },

    #[error("Truncated packet: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Signature verification failed: {0}")]
    Signature(String),

    #[error("Message authentication failed")]
    Authentication,

    #[error("Replayed nonce {nonce} (last accepted {last})")]
    Replay { nonce: u32, last: u32 },

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Bus transaction timed out")]
    BusTimeout,

    #[error("Unknown packet magic {0:#04x}")]
    UnknownMagic(u8),

    #[error("Unexpected packet: expected {expected:?}, got {actual:?}")]
    UnexpectedPacket { expected: Magic, actual: Magic },

    #[error("Peer answered with an error packet")]
    PeerError,

    #[error("Invalid session state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("Session failed verification and must be re-keyed")]
    SessionInvalidated,

    #[error("Key exchange commitment mismatch")]
    HashMismatch,

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Nonce space exhausted, re-key required")]
    NonceExhausted,

    #[error("Key unwrap failed: {0}")]
    KeyUnwrap(String),

    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    #[error("Invalid PIN")]
    InvalidPin,

    #[error("Invalid replacement token")]
    InvalidToken,

    #[error("Component {0:#010x} is not provisioned")]
    UnknownComponent(u32),

    #[error("Inbox full: {0} messages waiting")]
    InboxFull(usize),

    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Serialization(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Failures that mean the peer cannot be trusted for this session.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            ProtocolError::Checksum { .. }
                | ProtocolError::Signature(_)
                | ProtocolError::Authentication
                | ProtocolError::Replay { .. }
                | ProtocolError::HashMismatch
                | ProtocolError::InvalidKeyMaterial(_)
        )
    }

    /// Failures the caller may retry without restarting the trust sequence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Bus(_) | ProtocolError::BusTimeout | ProtocolError::Io(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ProtocolError::Authentication.is_security_event());
        assert!(ProtocolError::Replay { nonce: 1, last: 1 }.is_security_event());
        assert!(!ProtocolError::BusTimeout.is_security_event());
        assert!(ProtocolError::BusTimeout.is_retryable());
        assert!(!ProtocolError::Signature("x".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ProtocolError::Checksum {
            received: 0xdeadbeef,
            computed: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch: packet carried 0xdeadbeef, computed 0x00000001"
        );
        assert_eq!(
            ProtocolError::UnknownMagic(0x7).to_string(),
            "Unknown packet magic 0x07"
        );
    }
}
