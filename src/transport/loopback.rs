//! In-process bus: requests are handed straight to attached responders.

use super::{Bus, BusAddress, Responder};
use crate::error::{constants, ProtocolError, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

/// Maps bus addresses to responders living in the same process.
///
/// Generic over the responder so callers keep typed access to attached devices.
pub struct LoopbackBus<R: Responder> {
    devices: BTreeMap<BusAddress, R>,
}

impl<R: Responder> Default for LoopbackBus<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Responder> LoopbackBus<R> {
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
        }
    }

    /// Attach `device` at `address`, returning whatever was there before.
    pub fn attach(&mut self, address: BusAddress, device: R) -> Option<R> {
        self.devices.insert(address, device)
    }

    pub fn detach(&mut self, address: BusAddress) -> Option<R> {
        self.devices.remove(&address)
    }

    pub fn device(&self, address: BusAddress) -> Option<&R> {
        self.devices.get(&address)
    }

    pub fn device_mut(&mut self, address: BusAddress) -> Option<&mut R> {
        self.devices.get_mut(&address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = BusAddress> + '_ {
        self.devices.keys().copied()
    }
}

impl<R: Responder> Bus for LoopbackBus<R> {
    #[instrument(skip(self, request, _timeout), fields(len = request.len()))]
    fn exchange(&mut self, target: BusAddress, request: &[u8], _timeout: Duration) -> Result<Bytes> {
        let device = self.devices.get_mut(&target).ok_or_else(|| {
            ProtocolError::Bus(format!("{} {}", constants::ERR_NO_DEVICE, target))
        })?;
        let reply = device.respond(request);
        debug!(reply_len = reply.len(), "Loopback exchange complete");
        Ok(reply)
    }
}
