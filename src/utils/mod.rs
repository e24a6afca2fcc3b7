//! # Utility Modules
//!
//! Supporting utilities for cryptography, key storage, logging, and metrics.
//!
//! ## Components
//! - **Checksum**: pluggable packet checksum engine (CRC-32 by default)
//! - **Crypto**: signatures, key derivation, AES-CTR and HMAC primitives
//! - **Keystore**: provisioned secrets, wrapped keys, and the provisioning record
//! - **Replay Guard**: monotonic nonce acceptance for the secure channel
//! - **Console**: operator-facing `%level: text%` line protocol
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Constant-time comparison of hashes and tags (subtle)
//! - Memory zeroing for sensitive data (zeroize crate)

pub mod checksum;
pub mod console;
pub mod crypto;
pub mod keystore;
pub mod logging;
pub mod metrics;
pub mod replay_guard;

pub use checksum::{ChecksumEngine, Crc32};
pub use replay_guard::ReplayGuard;
