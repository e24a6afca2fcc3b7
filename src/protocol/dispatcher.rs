use crate::core::packet::{Magic, Packet};
use crate::error::{ProtocolError, Result};
use std::collections::HashMap;

type HandlerFn<S> = dyn Fn(&mut S, &Packet) -> Result<Packet> + Send + Sync + 'static;

/// Routes a decoded request to the handler registered for its magic.
///
/// Responders own their dispatcher and the state it mutates, so routing needs
/// no locking; one request is handled to completion before the next.
pub struct Dispatcher<S> {
    handlers: HashMap<Magic, Box<HandlerFn<S>>>,
}

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Dispatcher<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `magic`, replacing any earlier one.
    pub fn register<F>(&mut self, magic: Magic, handler: F)
    where
        F: Fn(&mut S, &Packet) -> Result<Packet> + Send + Sync + 'static,
    {
        self.handlers.insert(magic, Box::new(handler));
    }

    pub fn handles(&self, magic: Magic) -> bool {
        self.handlers.contains_key(&magic)
    }

    pub fn dispatch(&self, state: &mut S, packet: &Packet) -> Result<Packet> {
        let magic = packet.magic();
        self.handlers
            .get(&magic)
            .ok_or(ProtocolError::UnknownMagic(magic as u8))
            .and_then(|handler| handler(state, packet))
    }
}
