//! Packet integrity checksums.
//!
//! The engine is a seam so a hardware CRC block can stand in for the software
//! implementation. An engine that cannot produce a checksum must say so with
//! [`ProtocolError::ChecksumUnavailable`]; returning a placeholder value would
//! collide with the checksum of a real packet.

use crate::error::{ProtocolError, Result};

/// Computes the checksum stored in every packet header.
pub trait ChecksumEngine {
    /// Checksum over `magic || payload`.
    fn checksum(&self, magic: u8, payload: &[u8]) -> Result<u32>;
}

/// CRC-32 (reflected polynomial 0xEDB88320) in software.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32;

impl ChecksumEngine for Crc32 {
    #[inline]
    fn checksum(&self, magic: u8, payload: &[u8]) -> Result<u32> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[magic]);
        hasher.update(payload);
        Ok(hasher.finalize())
    }
}

/// Engine for a peripheral that failed to initialise.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableEngine;

impl ChecksumEngine for UnavailableEngine {
    fn checksum(&self, _magic: u8, _payload: &[u8]) -> Result<u32> {
        Err(ProtocolError::ChecksumUnavailable)
    }
}
