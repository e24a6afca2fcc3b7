//! Attestation: the AP proves the command is its own, the Component answers
//! with signed identity evidence bound to the AP's challenge.
//!
//! ```text
//! AP                                            Component
//!  | ATTEST_COMMAND{c, sign(AP, L1 || T || c)}      |
//!  |----------------------------------------------->| verify, then
//!  | ATTEST_ACK{e, sign(C, L2 || T || c || e)}      | sign evidence
//!  |<-----------------------------------------------|
//!  verify -> Attested
//! ```
//!
//! `T` is the session's transcript hash. A relay that ran its own key
//! exchange with each side holds two different sessions, so the signatures it
//! forwards never verify.
//!
//! Both sides check the session state before touching the verifier. A failed
//! signature invalidates the session until the next key exchange.

use crate::core::packet::{
    AttestAckPayload, AttestCommandPayload, ATTEST_CHALLENGE_CAPACITY, ATTEST_EVIDENCE_CAPACITY,
};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::session::{Session, SessionState};
use crate::utils::crypto::{aes128_ctr, random_bytes, signed_message, MessageSigner, MessageVerifier};
use tracing::{debug, instrument, warn};

pub const ATTEST_COMMAND_LABEL: &[u8] = b"trustbus/attest-command";
pub const ATTEST_ACK_LABEL: &[u8] = b"trustbus/attest-ack";

/// Size of each field in the attestation report.
pub const REPORT_FIELD_LEN: usize = 64;

pub type AttestChallenge = [u8; ATTEST_CHALLENGE_CAPACITY];
pub type SealedEvidence = [u8; ATTEST_EVIDENCE_CAPACITY];

/// AP: fresh challenge and the signed command carrying it.
#[instrument(skip(signer), fields(peer = session.peer()))]
pub fn build_attest_command(
    session: &Session,
    signer: &dyn MessageSigner,
) -> Result<(AttestChallenge, AttestCommandPayload)> {
    session.require(SessionState::Keyed)?;
    let transcript = session.transcript_hash()?;

    let challenge: AttestChallenge = random_bytes()?;
    let sig = signer.sign_message(&signed_message(
        ATTEST_COMMAND_LABEL,
        &[transcript, &challenge],
    ))?;
    let payload = AttestCommandPayload::new(&challenge, sig)?;

    debug!("Attestation command built");
    Ok((challenge, payload))
}

/// Component: verify the AP's command and sign `evidence` against its challenge.
#[instrument(skip_all, fields(peer = session.peer()))]
pub fn answer_attest_command(
    session: &mut Session,
    ap_verifier: &dyn MessageVerifier,
    signer: &dyn MessageSigner,
    evidence: &SealedEvidence,
    command: &AttestCommandPayload,
) -> Result<AttestAckPayload> {
    session.require(SessionState::Keyed)?;
    let transcript = *session.transcript_hash()?;

    let challenge = command.data.as_slice();
    if challenge.len() != ATTEST_CHALLENGE_CAPACITY {
        session.invalidate();
        return Err(ProtocolError::MalformedPayload(
            constants::ERR_CHALLENGE_LEN.into(),
        ));
    }

    let msg = signed_message(ATTEST_COMMAND_LABEL, &[&transcript, challenge]);
    if !ap_verifier.verify_message(&msg, &command.sig) {
        warn!("Attestation command signature rejected");
        session.invalidate();
        return Err(ProtocolError::Signature(
            constants::ERR_ATTEST_COMMAND_SIG.into(),
        ));
    }

    let sig = signer.sign_message(&signed_message(
        ATTEST_ACK_LABEL,
        &[&transcript, challenge, evidence],
    ))?;
    let ack = AttestAckPayload::new(evidence, sig)?;

    session.promote(SessionState::Attested);
    Ok(ack)
}

/// AP: verify the Component's answer to `challenge` and return its evidence.
#[instrument(skip_all, fields(peer = session.peer()))]
pub fn verify_attest_ack(
    session: &mut Session,
    component_verifier: &dyn MessageVerifier,
    challenge: &AttestChallenge,
    ack: &AttestAckPayload,
) -> Result<SealedEvidence> {
    session.require(SessionState::Keyed)?;
    let transcript = *session.transcript_hash()?;

    let evidence: SealedEvidence = match ack.data.as_slice().try_into() {
        Ok(evidence) => evidence,
        Err(_) => {
            session.invalidate();
            return Err(ProtocolError::MalformedPayload(format!(
                "attestation evidence must be {ATTEST_EVIDENCE_CAPACITY} bytes, got {}",
                ack.data.len()
            )));
        }
    };

    let msg = signed_message(ATTEST_ACK_LABEL, &[&transcript, challenge, &evidence]);
    if !component_verifier.verify_message(&msg, &ack.sig) {
        warn!("Attestation response signature rejected");
        session.invalidate();
        return Err(ProtocolError::Signature(constants::ERR_ATTEST_ACK_SIG.into()));
    }

    session.promote(SessionState::Attested);
    Ok(evidence)
}

/// Provisioned identity evidence, sealed with the deployment's attestation key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationReport {
    pub location: String,
    pub date: String,
    pub customer: String,
}

impl AttestationReport {
    pub fn new(location: &str, date: &str, customer: &str) -> Result<Self> {
        for field in [location, date, customer] {
            if field.len() > REPORT_FIELD_LEN {
                return Err(ProtocolError::Length {
                    declared: field.len(),
                    capacity: REPORT_FIELD_LEN,
                });
            }
        }
        Ok(Self {
            location: location.to_owned(),
            date: date.to_owned(),
            customer: customer.to_owned(),
        })
    }

    /// Zero-padded fields, encrypted in place.
    pub fn seal(&self, key: &[u8; 16]) -> SealedEvidence {
        let mut out = [0u8; ATTEST_EVIDENCE_CAPACITY];
        for (slot, field) in out
            .chunks_exact_mut(REPORT_FIELD_LEN)
            .zip([&self.location, &self.date, &self.customer])
        {
            slot[..field.len()].copy_from_slice(field.as_bytes());
        }
        aes128_ctr(key, &[0u8; 16], &mut out);
        out
    }

    pub fn open(key: &[u8; 16], sealed: &SealedEvidence) -> Result<Self> {
        let mut plain = *sealed;
        aes128_ctr(key, &[0u8; 16], &mut plain);

        let field = |index: usize| -> Result<String> {
            let slot = &plain[index * REPORT_FIELD_LEN..(index + 1) * REPORT_FIELD_LEN];
            let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
            String::from_utf8(slot[..end].to_vec())
                .map_err(|_| ProtocolError::MalformedPayload("report field is not UTF-8".into()))
        };
        Ok(Self {
            location: field(0)?,
            date: field(1)?,
            customer: field(2)?,
        })
    }
}
