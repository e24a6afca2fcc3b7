//! Per-peer session state.
//!
//! A [`Session`] is owned by whoever drives the protocol (the AP holds one per
//! component, a component holds its mirror) and is passed by reference into
//! each protocol step. There is no process-wide session state.
//!
//! ```text
//! Unkeyed --KEX--> Keyed --attest--> Attested --boot--> Authorized
//!    ^                                                      |
//!    +------------------- reset / re-key -------------------+
//! ```
//!
//! A verification failure invalidates the session: the state tag stays put but
//! no further step is allowed until a fresh key exchange.

use crate::error::{ProtocolError, Result};
use crate::utils::crypto::{DirectionKeys, SessionKey, TrafficKeys};
use crate::utils::replay_guard::ReplayGuard;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Unkeyed,
    Keyed,
    Attested,
    Authorized,
}

/// Which end of the bus this session belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    ApplicationProcessor,
    Component,
}

pub struct Session {
    peer: u32,
    role: Role,
    state: SessionState,
    key: Option<SessionKey>,
    traffic: Option<TrafficKeys>,
    send_nonce: u32,
    replay: ReplayGuard,
    invalidated: bool,
}

impl Session {
    /// New unkeyed session with the component identified by `peer`.
    pub fn new(peer: u32, role: Role) -> Self {
        Self {
            peer,
            role,
            state: SessionState::Unkeyed,
            key: None,
            traffic: None,
            send_nonce: 0,
            replay: ReplayGuard::new(),
            invalidated: false,
        }
    }

    pub fn peer(&self) -> u32 {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Last nonce this side sent.
    pub fn send_nonce(&self) -> u32 {
        self.send_nonce
    }

    /// Last nonce this side accepted from the peer.
    pub fn last_received_nonce(&self) -> u32 {
        self.replay.last_accepted()
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    /// Install a freshly agreed key: Keyed, counters at zero, history cleared.
    pub fn establish(&mut self, key: SessionKey) -> Result<()> {
        let traffic = TrafficKeys::derive(&key)?;
        self.key = Some(key);
        self.traffic = Some(traffic);
        self.state = SessionState::Keyed;
        self.send_nonce = 0;
        self.replay.reset();
        self.invalidated = false;
        debug!(peer = self.peer, "Session keyed");
        Ok(())
    }

    /// Fail unless the session is exactly in `expected` and still trusted.
    pub fn require(&self, expected: SessionState) -> Result<()> {
        if self.invalidated {
            return Err(ProtocolError::SessionInvalidated);
        }
        if self.state != expected {
            return Err(ProtocolError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Fail unless a session key exists and the session is still trusted.
    pub fn require_keyed(&self) -> Result<()> {
        if self.invalidated {
            return Err(ProtocolError::SessionInvalidated);
        }
        if self.state < SessionState::Keyed {
            return Err(ProtocolError::InvalidState {
                expected: SessionState::Keyed,
                actual: self.state,
            });
        }
        Ok(())
    }

    pub(crate) fn promote(&mut self, to: SessionState) {
        debug!(peer = self.peer, from = ?self.state, to = ?to, "Session advanced");
        self.state = to;
    }

    /// Mark the session untrusted until the next key exchange.
    pub fn invalidate(&mut self) {
        warn!(peer = self.peer, state = ?self.state, "Session invalidated");
        self.invalidated = true;
    }

    /// Drop all key material and return to Unkeyed.
    pub fn reset(&mut self) {
        self.key = None;
        self.traffic = None;
        self.state = SessionState::Unkeyed;
        self.send_nonce = 0;
        self.replay.reset();
        self.invalidated = false;
        debug!(peer = self.peer, "Session reset");
    }

    /// Advance and return the outbound nonce. The first nonce is 1.
    pub(crate) fn next_nonce(&mut self) -> Result<u32> {
        let next = self
            .send_nonce
            .checked_add(1)
            .ok_or(ProtocolError::NonceExhausted)?;
        self.send_nonce = next;
        Ok(next)
    }

    /// Value both ends derive from this key exchange.
    ///
    /// Every signed handshake message covers it, so signatures made under one
    /// key exchange are worthless under another.
    pub fn transcript_hash(&self) -> Result<&[u8; 32]> {
        Ok(&self.traffic_keys()?.transcript)
    }

    /// Keys for records this side sends.
    pub(crate) fn outbound_keys(&self) -> Result<&DirectionKeys> {
        let traffic = self.traffic_keys()?;
        Ok(match self.role {
            Role::ApplicationProcessor => &traffic.ap_to_component,
            Role::Component => &traffic.component_to_ap,
        })
    }

    /// Keys for records this side receives.
    pub(crate) fn inbound_keys(&self) -> Result<&DirectionKeys> {
        let traffic = self.traffic_keys()?;
        Ok(match self.role {
            Role::ApplicationProcessor => &traffic.component_to_ap,
            Role::Component => &traffic.ap_to_component,
        })
    }

    fn traffic_keys(&self) -> Result<&TrafficKeys> {
        self.traffic.as_ref().ok_or(ProtocolError::InvalidState {
            expected: SessionState::Keyed,
            actual: self.state,
        })
    }

    pub(crate) fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    pub(crate) fn replay_guard_mut(&mut self) -> &mut ReplayGuard {
        &mut self.replay
    }

    #[cfg(test)]
    pub(crate) fn set_send_nonce(&mut self, nonce: u32) {
        self.send_nonce = nonce;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &format_args!("{:#010x}", self.peer))
            .field("role", &self.role)
            .field("state", &self.state)
            .field("send_nonce", &self.send_nonce)
            .field("last_received_nonce", &self.replay.last_accepted())
            .field("invalidated", &self.invalidated)
            .finish()
    }
}
