//! Component-side responder.
//!
//! Blocks on nothing itself: the transport hands it one raw request, it runs
//! that request to completion and returns exactly one reply frame. Any failure,
//! including an undecodable request, is answered with an ERROR packet.

use crate::core::packet::{Magic, Packet, BOOT_MESSAGE_CAPACITY, ERROR_FRAME, SECURE_DATA_CAPACITY};
use crate::error::{ProtocolError, Result};
use crate::protocol::attestation::{answer_attest_command, SealedEvidence};
use crate::protocol::boot::answer_boot_command;
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::component_kex_respond;
use crate::protocol::replace::answer_replace_command;
use crate::protocol::session::{Role, Session, SessionState};
use crate::service::secure;
use crate::transport::{BusAddress, Responder};
use crate::utils::keystore::{ComponentIdentity, ComponentSecrets};
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, info, instrument, warn};

/// Messages from the AP held until [`Component::drain_inbox`].
pub const INBOX_CAPACITY: usize = 32;

/// Everything a component handler may touch.
pub struct ComponentState {
    id: u32,
    identity: ComponentIdentity,
    evidence: SealedEvidence,
    boot_message: Vec<u8>,
    session: Session,
    booted: bool,
    inbox: VecDeque<Vec<u8>>,
    outbox: VecDeque<Vec<u8>>,
}

fn unexpected(expected: Magic, packet: &Packet) -> ProtocolError {
    ProtocolError::UnexpectedPacket {
        expected,
        actual: packet.magic(),
    }
}

fn on_error(state: &mut ComponentState, _packet: &Packet) -> Result<Packet> {
    debug!("AP aborted, resetting session");
    state.session.reset();
    Ok(Packet::Error)
}

fn on_list(state: &mut ComponentState, _packet: &Packet) -> Result<Packet> {
    Ok(Packet::ListAck {
        component_id: state.id,
    })
}

fn on_kex(state: &mut ComponentState, packet: &Packet) -> Result<Packet> {
    let Packet::Kex(request) = packet else {
        return Err(unexpected(Magic::Kex, packet));
    };
    match component_kex_respond(request) {
        Ok((key, reply)) => {
            state.session.establish(key)?;
            state.booted = false;
            Ok(Packet::Kex(reply))
        }
        Err(e) => {
            state.session.reset();
            Err(e)
        }
    }
}

fn on_attest(state: &mut ComponentState, packet: &Packet) -> Result<Packet> {
    let Packet::AttestCommand(command) = packet else {
        return Err(unexpected(Magic::AttestCommand, packet));
    };
    let ack = answer_attest_command(
        &mut state.session,
        &state.identity.ap_attest,
        &state.identity.attest_signer,
        &state.evidence,
        command,
    )?;
    Ok(Packet::AttestAck(ack))
}

fn on_boot(state: &mut ComponentState, packet: &Packet) -> Result<Packet> {
    let Packet::BootCommand(command) = packet else {
        return Err(unexpected(Magic::BootCommand, packet));
    };
    let ack = answer_boot_command(
        &mut state.session,
        &state.identity.ap_boot,
        &state.identity.boot_signer,
        &state.boot_message,
        command,
    )?;
    state.booted = true;
    info!(component = state.id, "Component booted");
    Ok(Packet::BootAck(ack))
}

fn on_replace(state: &mut ComponentState, packet: &Packet) -> Result<Packet> {
    let Packet::ReplaceCommand(command) = packet else {
        return Err(unexpected(Magic::ReplaceCommand, packet));
    };
    let ack = answer_replace_command(state.id, &state.identity.attest_signer, command)?;
    Ok(Packet::ReplaceAck(ack))
}

/// Queue the AP's record and answer with the next outbound message.
///
/// A full inbox refuses new data before the record is opened, so the AP can
/// resend it once the inbox drains. Empty polls are always served.
fn on_secure(state: &mut ComponentState, packet: &Packet) -> Result<Packet> {
    let Packet::Secure(record) = packet else {
        return Err(unexpected(Magic::Secure, packet));
    };
    if !record.data.is_empty() && state.inbox.len() >= INBOX_CAPACITY {
        warn!(component = state.id, "Inbox full, refusing record");
        return Err(ProtocolError::InboxFull(state.inbox.len()));
    }
    let message = secure::open(&mut state.session, record)?;
    if !message.is_empty() {
        state.inbox.push_back(message);
    }
    let reply = state.outbox.pop_front().unwrap_or_default();
    match secure::seal(&mut state.session, &reply) {
        Ok(sealed) => Ok(Packet::Secure(sealed)),
        Err(e) => {
            state.outbox.push_front(reply);
            Err(e)
        }
    }
}

pub struct Component {
    dispatcher: Dispatcher<ComponentState>,
    state: ComponentState,
}

impl Component {
    pub fn new(
        id: u32,
        identity: ComponentIdentity,
        evidence: SealedEvidence,
        boot_message: &[u8],
    ) -> Result<Self> {
        if boot_message.len() > BOOT_MESSAGE_CAPACITY {
            return Err(ProtocolError::Length {
                declared: boot_message.len(),
                capacity: BOOT_MESSAGE_CAPACITY,
            });
        }

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Magic::Error, on_error);
        dispatcher.register(Magic::List, on_list);
        dispatcher.register(Magic::Kex, on_kex);
        dispatcher.register(Magic::AttestCommand, on_attest);
        dispatcher.register(Magic::BootCommand, on_boot);
        dispatcher.register(Magic::ReplaceCommand, on_replace);
        dispatcher.register(Magic::Secure, on_secure);

        Ok(Self {
            dispatcher,
            state: ComponentState {
                id,
                identity,
                evidence,
                boot_message: boot_message.to_vec(),
                session: Session::new(id, Role::Component),
                booted: false,
                inbox: VecDeque::new(),
                outbox: VecDeque::new(),
            },
        })
    }

    pub fn from_secrets(id: u32, secrets: &ComponentSecrets) -> Result<Self> {
        Self::new(
            id,
            secrets.identity()?,
            secrets.sealed_evidence,
            secrets.boot_message.as_bytes(),
        )
    }

    pub fn id(&self) -> u32 {
        self.state.id
    }

    pub fn address(&self) -> BusAddress {
        BusAddress::from_component_id(self.state.id)
    }

    pub fn session(&self) -> &Session {
        &self.state.session
    }

    pub fn state(&self) -> SessionState {
        self.state.session.state()
    }

    pub fn is_booted(&self) -> bool {
        self.state.booted
    }

    /// Queue a message for the AP's next secure exchange.
    pub fn queue_outbound(&mut self, message: &[u8]) -> Result<()> {
        if message.len() > SECURE_DATA_CAPACITY {
            return Err(ProtocolError::Length {
                declared: message.len(),
                capacity: SECURE_DATA_CAPACITY,
            });
        }
        self.state.outbox.push_back(message.to_vec());
        Ok(())
    }

    /// Messages received from the AP, oldest first.
    pub fn drain_inbox(&mut self) -> Vec<Vec<u8>> {
        self.state.inbox.drain(..).collect()
    }

    /// Handle one decoded request.
    pub fn handle(&mut self, packet: &Packet) -> Result<Packet> {
        self.dispatcher.dispatch(&mut self.state, packet)
    }
}

impl Responder for Component {
    #[instrument(skip(self, request), fields(component = self.state.id, len = request.len()))]
    fn respond(&mut self, request: &[u8]) -> Bytes {
        let reply = Packet::from_bytes(request)
            .and_then(|packet| self.handle(&packet))
            .and_then(|reply| reply.to_bytes());

        match reply {
            Ok(frame) => frame,
            Err(e) => {
                if e.is_security_event() {
                    warn!(error = %e, "Rejected request");
                } else {
                    debug!(error = %e, "Request failed");
                }
                Bytes::from_static(&ERROR_FRAME)
            }
        }
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("id", &format_args!("{:#010x}", self.state.id))
            .field("session", &self.state.session)
            .field("booted", &self.state.booted)
            .finish()
    }
}
