//! # Bus Transport
//!
//! One blocking request/response exchange per logical message.
//!
//! ## Components
//! - **Bus**: the exchange primitive the AP drives
//! - **Responder**: the Component side, one request in and one reply out
//! - **Loopback**: in-process bus for tests and simulation
//! - **Stream**: TCP bridge carrying bus transactions between processes
//!
//! The protocol never pipelines: a caller holds `&mut` to its bus for the
//! whole exchange, so transactions on one bus cannot interleave.

use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod loopback;
pub mod stream;

pub use loopback::LoopbackBus;
pub use stream::StreamBus;

/// First address scanned when listing components
pub const SCAN_START: u8 = 0x08;
/// One past the last address scanned
pub const SCAN_END: u8 = 0x78;
/// Addresses owned by board peripherals; never probed
pub const RESERVED_ADDRESSES: [u8; 3] = [0x18, 0x28, 0x36];

/// Seven-bit-style device address on the shared bus
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusAddress(u8);

impl BusAddress {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    /// A component answers at the low byte of its id.
    pub const fn from_component_id(id: u32) -> Self {
        Self((id & 0xFF) as u8)
    }

    pub fn is_reserved(self) -> bool {
        RESERVED_ADDRESSES.contains(&self.0)
    }

    /// Addresses probed by a component scan, in order.
    pub fn scan_range() -> impl Iterator<Item = BusAddress> {
        (SCAN_START..SCAN_END)
            .map(BusAddress)
            .filter(|addr| !addr.is_reserved())
    }
}

impl fmt::Debug for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusAddress({:#04x})", self.0)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// AP side of the bus.
pub trait Bus {
    /// Send one request frame to `target` and wait up to `timeout` for its reply.
    fn exchange(&mut self, target: BusAddress, request: &[u8], timeout: Duration) -> Result<Bytes>;
}

impl<B: Bus + ?Sized> Bus for Box<B> {
    fn exchange(&mut self, target: BusAddress, request: &[u8], timeout: Duration) -> Result<Bytes> {
        (**self).exchange(target, request, timeout)
    }
}

/// Device side of the bus: handles one raw request to completion.
///
/// A responder always answers, even if only with an ERROR frame.
pub trait Responder {
    fn respond(&mut self, request: &[u8]) -> Bytes;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_skips_reserved() {
        let addrs: Vec<u8> = BusAddress::scan_range().map(BusAddress::value).collect();
        assert_eq!(addrs.first(), Some(&SCAN_START));
        assert_eq!(addrs.last(), Some(&(SCAN_END - 1)));
        assert_eq!(addrs.len(), (SCAN_END - SCAN_START) as usize - 3);
        for reserved in RESERVED_ADDRESSES {
            assert!(!addrs.contains(&reserved));
        }
    }

    #[test]
    fn test_address_from_component_id() {
        assert_eq!(BusAddress::from_component_id(0x1122_3344).value(), 0x44);
        assert_eq!(format!("{}", BusAddress::new(0x0a)), "0x0a");
    }
}
