//! Application processor driver.
//!
//! Drives each component through KEX → Attest → Boot one exchange at a time,
//! keeps one [`Session`] per component, and reports to the operator console.
//! Console-facing operations end with a `%success%` or `%error%` line.

use crate::config::{BusConfig, TrustConfig};
use crate::core::packet::{Magic, Packet};
use crate::error::{ProtocolError, Result};
use crate::protocol::attestation::{
    build_attest_command, verify_attest_ack, AttestationReport, SealedEvidence,
};
use crate::protocol::boot::{build_boot_command, verify_boot_ack};
use crate::protocol::handshake::{ap_kex_finalize, ap_kex_init};
use crate::protocol::replace::{build_replace_command, verify_replace_ack};
use crate::protocol::session::{Role, Session, SessionState};
use crate::service::secure;
use crate::transport::{Bus, BusAddress};
use crate::utils::console::Console;
use crate::utils::keystore::{ApIdentity, ApSecrets, FlashStore};
use crate::utils::metrics::{Metrics, Step, Timer};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// One request/response over the bus, decoded and classified.
///
/// Transport failures are retried up to `retries` extra times. An ERROR reply
/// becomes [`ProtocolError::PeerError`]. Error counters are left to the caller.
fn transact<B: Bus>(
    bus: &mut B,
    metrics: &Metrics,
    target: BusAddress,
    request: &Packet,
    timeout: Duration,
    retries: u32,
) -> Result<Packet> {
    let frame = request.to_bytes()?;
    let mut attempt = 0;
    let reply = loop {
        match bus.exchange(target, &frame, timeout) {
            Ok(reply) => break reply,
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                debug!(%target, attempt, error = %e, "Retrying exchange");
            }
            Err(e) => return Err(e),
        }
    };
    metrics.exchanged(frame.len(), reply.len());

    match Packet::from_bytes(&reply)? {
        Packet::Error => Err(ProtocolError::PeerError),
        packet => Ok(packet),
    }
}

fn unexpected(expected: Magic, packet: &Packet) -> ProtocolError {
    ProtocolError::UnexpectedPacket {
        expected,
        actual: packet.magic(),
    }
}

pub struct ApplicationProcessor<B: Bus, W: Write> {
    bus: B,
    identity: ApIdentity,
    secrets: ApSecrets,
    flash: FlashStore,
    sessions: BTreeMap<u32, Session>,
    console: Console<W>,
    metrics: Metrics,
    bus_config: BusConfig,
}

impl<B: Bus, W: Write> ApplicationProcessor<B, W> {
    pub fn new(
        bus: B,
        secrets: ApSecrets,
        flash: FlashStore,
        console: Console<W>,
        bus_config: BusConfig,
    ) -> Result<Self> {
        let identity = secrets.identity()?;
        info!(
            components = flash.component_ids().len(),
            "Application processor started"
        );
        Ok(Self {
            bus,
            identity,
            secrets,
            flash,
            sessions: BTreeMap::new(),
            console,
            metrics: Metrics::new(),
            bus_config,
        })
    }

    /// Load secrets and the provisioning record named by `config`.
    pub fn from_config(bus: B, config: &TrustConfig, console: Console<W>) -> Result<Self> {
        config.validate_strict()?;
        let secrets = ApSecrets::from_file(&config.ap.secrets_path)?;
        let flash = match &config.ap.flash_path {
            Some(path) => FlashStore::open(path, &config.ap.component_ids)?,
            None => FlashStore::in_memory(&config.ap.component_ids),
        };
        Self::new(bus, secrets, flash, console, config.bus.clone())
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn console(&self) -> &Console<W> {
        &self.console
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn flash(&self) -> &FlashStore {
        &self.flash
    }

    pub fn session(&self, component_id: u32) -> Option<&Session> {
        self.sessions.get(&component_id)
    }

    fn require_provisioned(&self, component_id: u32) -> Result<()> {
        if self.flash.contains(component_id) {
            Ok(())
        } else {
            Err(ProtocolError::UnknownComponent(component_id))
        }
    }

    /// Print the outcome of a public operation on the console.
    fn report<T>(&mut self, result: Result<T>, success: &str, failure: &str) -> Result<T> {
        match result {
            Ok(value) => {
                self.console.success(success)?;
                Ok(value)
            }
            Err(e) => {
                error!(error = %e, "{failure}");
                self.console.error(&format!("{failure}: {e}"))?;
                Err(e)
            }
        }
    }

    /// Best-effort ERROR to `component_id`; the component resets its session.
    #[instrument(skip(self))]
    pub fn abort(&mut self, component_id: u32) {
        let target = BusAddress::from_component_id(component_id);
        match transact(
            &mut self.bus,
            &self.metrics,
            target,
            &Packet::Error,
            self.bus_config.exchange_timeout,
            0,
        ) {
            Ok(_) | Err(ProtocolError::PeerError) => debug!("Abort delivered"),
            Err(e) => warn!(error = %e, "Abort not delivered"),
        }
    }

    /// Scan the bus and report provisioned and found component ids.
    #[instrument(skip(self))]
    pub fn list_components(&mut self) -> Result<Vec<u32>> {
        let result = self.scan();
        self.report(result, "List", "Failed to list components")
    }

    fn scan(&mut self) -> Result<Vec<u32>> {
        for id in self.flash.component_ids().to_vec() {
            self.console.info(&format!("P>{id:#010x}"))?;
        }

        let mut found = Vec::new();
        for addr in BusAddress::scan_range() {
            match transact(
                &mut self.bus,
                &self.metrics,
                addr,
                &Packet::List,
                self.bus_config.scan_timeout,
                0,
            ) {
                Ok(Packet::ListAck { component_id }) => {
                    self.console.info(&format!("F>{component_id:#010x}"))?;
                    found.push(component_id);
                }
                Ok(other) => debug!(%addr, magic = ?other.magic(), "Ignoring scan reply"),
                Err(_) => {}
            }
        }
        Ok(found)
    }

    /// Run the key exchange with one component, leaving its session Keyed.
    #[instrument(skip(self))]
    pub fn key_exchange(&mut self, component_id: u32) -> Result<()> {
        self.require_provisioned(component_id)?;
        self.metrics.attempt(Step::KeyExchange);

        let result = self.run_key_exchange(component_id);
        match &result {
            Ok(()) => self.metrics.success(Step::KeyExchange),
            Err(e) => {
                self.metrics.failed(Step::KeyExchange);
                self.metrics.record_error(e);
                self.abort(component_id);
            }
        }
        result
    }

    fn run_key_exchange(&mut self, component_id: u32) -> Result<()> {
        let session = self
            .sessions
            .entry(component_id)
            .or_insert_with(|| Session::new(component_id, Role::ApplicationProcessor));
        session.reset();

        let (state, request) = ap_kex_init()?;
        let reply = transact(
            &mut self.bus,
            &self.metrics,
            BusAddress::from_component_id(component_id),
            &Packet::Kex(request),
            self.bus_config.exchange_timeout,
            self.bus_config.retry_attempts,
        )?;
        let Packet::Kex(response) = reply else {
            return Err(unexpected(Magic::Kex, &reply));
        };

        let key = ap_kex_finalize(state, &response)?;
        session.establish(key)
    }

    /// Attest a keyed component and return its sealed evidence.
    #[instrument(skip(self))]
    pub fn attest_component(&mut self, component_id: u32) -> Result<SealedEvidence> {
        self.require_provisioned(component_id)?;
        self.metrics.attempt(Step::Attestation);

        let result = self.run_attestation(component_id);
        match &result {
            Ok(_) => self.metrics.success(Step::Attestation),
            Err(e) => self.step_failed(component_id, Step::Attestation, e),
        }
        result
    }

    fn run_attestation(&mut self, component_id: u32) -> Result<SealedEvidence> {
        let session = self
            .sessions
            .get_mut(&component_id)
            .ok_or(ProtocolError::InvalidState {
                expected: SessionState::Keyed,
                actual: SessionState::Unkeyed,
            })?;

        let (challenge, command) = build_attest_command(session, &self.identity.attest_signer)?;
        let reply = transact(
            &mut self.bus,
            &self.metrics,
            BusAddress::from_component_id(component_id),
            &Packet::AttestCommand(command),
            self.bus_config.exchange_timeout,
            0,
        )?;
        let Packet::AttestAck(ack) = reply else {
            return Err(unexpected(Magic::AttestAck, &reply));
        };

        verify_attest_ack(session, &self.identity.component_attest, &challenge, &ack)
    }

    /// Ask an attested component to authorize boot; returns its boot message.
    #[instrument(skip(self))]
    pub fn authorize_boot(&mut self, component_id: u32) -> Result<Vec<u8>> {
        self.require_provisioned(component_id)?;
        self.metrics.attempt(Step::Boot);

        let result = self.run_boot(component_id);
        match &result {
            Ok(_) => self.metrics.success(Step::Boot),
            Err(e) => self.step_failed(component_id, Step::Boot, e),
        }
        result
    }

    fn run_boot(&mut self, component_id: u32) -> Result<Vec<u8>> {
        let session = self
            .sessions
            .get_mut(&component_id)
            .ok_or(ProtocolError::InvalidState {
                expected: SessionState::Attested,
                actual: SessionState::Unkeyed,
            })?;

        let (challenge, command) = build_boot_command(session, &self.identity.boot_signer)?;
        let reply = transact(
            &mut self.bus,
            &self.metrics,
            BusAddress::from_component_id(component_id),
            &Packet::BootCommand(command),
            self.bus_config.exchange_timeout,
            0,
        )?;
        let Packet::BootAck(ack) = reply else {
            return Err(unexpected(Magic::BootAck, &reply));
        };

        verify_boot_ack(session, &self.identity.component_boot, &challenge, &ack)
    }

    /// A failed attest or boot step: the session is no longer trusted.
    ///
    /// Precondition failures are raised before anything is sent and leave the
    /// session alone.
    fn step_failed(&mut self, component_id: u32, step: Step, err: &ProtocolError) {
        self.metrics.failed(step);
        self.metrics.record_error(err);
        if matches!(
            err,
            ProtocolError::InvalidState { .. } | ProtocolError::SessionInvalidated
        ) {
            return;
        }
        if let Some(session) = self.sessions.get_mut(&component_id) {
            if !session.is_invalidated() {
                session.invalidate();
            }
        }
        self.abort(component_id);
    }

    /// Full trust sequence for one component.
    fn boot_component(&mut self, component_id: u32) -> Result<Vec<u8>> {
        self.key_exchange(component_id)?;
        self.attest_component(component_id)?;
        self.authorize_boot(component_id)
    }

    /// Boot every provisioned component in order, then the AP itself.
    ///
    /// The first component that fails stops the boot.
    #[instrument(skip(self))]
    pub fn boot_all(&mut self) -> Result<()> {
        let _timer = Timer::start("boot_all");
        let result = self.run_boot_all();
        self.report(result, "Boot", "Failed to boot")
    }

    fn run_boot_all(&mut self) -> Result<()> {
        let mut messages = Vec::new();
        for component_id in self.flash.component_ids().to_vec() {
            match self.boot_component(component_id) {
                Ok(message) => messages.push((component_id, message)),
                Err(e) => {
                    self.console
                        .error(&format!("Could not boot component {component_id:#010x}"))?;
                    return Err(e);
                }
            }
        }

        for (component_id, message) in messages {
            self.console.info(&format!(
                "{component_id:#010x}>{}",
                String::from_utf8_lossy(&message)
            ))?;
        }
        let ap_message = self.secrets.boot_message.clone();
        self.console.info(&format!("AP>{ap_message}"))?;
        info!("All components booted");
        Ok(())
    }

    /// Check `pin`, attest `component_id`, and print its decrypted report.
    #[instrument(skip(self, pin))]
    pub fn attest_report(&mut self, pin: &str, component_id: u32) -> Result<AttestationReport> {
        let result = self.run_attest_report(pin, component_id);
        self.report(result, "Attest", "Failed to attest")
    }

    fn run_attest_report(&mut self, pin: &str, component_id: u32) -> Result<AttestationReport> {
        let key = self.secrets.unwrap_attest_key(pin)?;
        self.console.debug("Pin Accepted!")?;

        self.require_provisioned(component_id)?;
        self.key_exchange(component_id)?;
        let evidence = self.attest_component(component_id)?;
        let report = AttestationReport::open(&key, &evidence)?;

        self.console.info(&format!("C>{component_id:#010x}"))?;
        self.console.info(&format!("LOC>{}", report.location))?;
        self.console.info(&format!("DATE>{}", report.date))?;
        self.console.info(&format!("CUST>{}", report.customer))?;
        Ok(report)
    }

    /// Swap a provisioned component for a new one.
    ///
    /// Gated by the replacement token, and the incoming component must prove it
    /// holds the deployment's component key before the record changes.
    #[instrument(skip(self, token))]
    pub fn replace_component(&mut self, token: &str, incoming: u32, outgoing: u32) -> Result<()> {
        let result = self.run_replace(token, incoming, outgoing);
        self.report(result, "Replace", "Failed to replace")
    }

    fn run_replace(&mut self, token: &str, incoming: u32, outgoing: u32) -> Result<()> {
        self.secrets.check_token(token)?;
        self.console.debug("Token Accepted!")?;

        self.require_provisioned(outgoing)?;
        if self.flash.contains(incoming) {
            return Err(ProtocolError::ConfigError(format!(
                "Component {incoming:#010x} is already provisioned"
            )));
        }

        let verified = self.verify_incoming(incoming);
        if let Err(e) = &verified {
            self.metrics.record_error(e);
        }
        verified?;

        self.flash.replace(outgoing, incoming)?;
        self.sessions.remove(&outgoing);
        self.console
            .debug(&format!("Replaced {outgoing:#010x} with {incoming:#010x}"))?;
        Ok(())
    }

    fn verify_incoming(&mut self, incoming: u32) -> Result<()> {
        let (challenge, command) = build_replace_command()?;
        let reply = transact(
            &mut self.bus,
            &self.metrics,
            BusAddress::from_component_id(incoming),
            &Packet::ReplaceCommand(command),
            self.bus_config.exchange_timeout,
            0,
        )?;
        let Packet::ReplaceAck(ack) = reply else {
            return Err(unexpected(Magic::ReplaceAck, &reply));
        };
        verify_replace_ack(incoming, &self.identity.component_attest, &challenge, &ack)
    }

    /// Send `message` over the secure channel and return the component's reply.
    #[instrument(skip(self, message), fields(len = message.len()))]
    pub fn secure_send(&mut self, component_id: u32, message: &[u8]) -> Result<Vec<u8>> {
        self.require_provisioned(component_id)?;
        let result = self.run_secure(component_id, message);
        if let Err(e) = &result {
            self.metrics.record_error(e);
        }
        result
    }

    /// Poll the component's outbound queue with an empty record.
    pub fn secure_receive(&mut self, component_id: u32) -> Result<Vec<u8>> {
        self.secure_send(component_id, &[])
    }

    fn run_secure(&mut self, component_id: u32, message: &[u8]) -> Result<Vec<u8>> {
        let session = self
            .sessions
            .get_mut(&component_id)
            .ok_or(ProtocolError::InvalidState {
                expected: SessionState::Keyed,
                actual: SessionState::Unkeyed,
            })?;

        let record = secure::seal(session, message)?;
        let reply = transact(
            &mut self.bus,
            &self.metrics,
            BusAddress::from_component_id(component_id),
            &Packet::Secure(record),
            self.bus_config.exchange_timeout,
            0,
        )?;
        self.metrics.secure_message_sent();

        let Packet::Secure(reply) = reply else {
            return Err(unexpected(Magic::Secure, &reply));
        };
        let plaintext = secure::open(session, &reply)?;
        self.metrics.secure_message_received();
        Ok(plaintext)
    }
}
