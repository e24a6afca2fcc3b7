//! Boot authorization: signed command and acknowledgement gating boot.
//!
//! Mirrors attestation with its own keys, labels and a 32-byte challenge, and
//! signs over the same transcript hash. A session must be Attested on both ends
//! before either side signs or verifies anything; a successful exchange leaves
//! both ends Authorized.

use crate::core::packet::{
    BootAckPayload, BootCommandPayload, BOOT_CHALLENGE_CAPACITY, BOOT_MESSAGE_CAPACITY,
};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::session::{Session, SessionState};
use crate::utils::crypto::{random_bytes, signed_message, MessageSigner, MessageVerifier};
use tracing::{debug, instrument, warn};

pub const BOOT_COMMAND_LABEL: &[u8] = b"trustbus/boot-command";
pub const BOOT_ACK_LABEL: &[u8] = b"trustbus/boot-ack";

pub type BootChallenge = [u8; BOOT_CHALLENGE_CAPACITY];

#[instrument(skip(signer), fields(peer = session.peer()))]
pub fn build_boot_command(
    session: &Session,
    signer: &dyn MessageSigner,
) -> Result<(BootChallenge, BootCommandPayload)> {
    session.require(SessionState::Attested)?;
    let transcript = session.transcript_hash()?;

    let challenge: BootChallenge = random_bytes()?;
    let sig = signer.sign_message(&signed_message(
        BOOT_COMMAND_LABEL,
        &[transcript, &challenge],
    ))?;
    let payload = BootCommandPayload::new(&challenge, sig)?;

    debug!("Boot command built");
    Ok((challenge, payload))
}

/// Component: check the AP's authorization and acknowledge with `boot_message`.
///
/// An unattested session is refused before the signature is looked at.
#[instrument(skip_all, fields(peer = session.peer()))]
pub fn answer_boot_command(
    session: &mut Session,
    ap_verifier: &dyn MessageVerifier,
    signer: &dyn MessageSigner,
    boot_message: &[u8],
    command: &BootCommandPayload,
) -> Result<BootAckPayload> {
    session.require(SessionState::Attested)?;
    let transcript = *session.transcript_hash()?;

    if boot_message.len() > BOOT_MESSAGE_CAPACITY {
        return Err(ProtocolError::Length {
            declared: boot_message.len(),
            capacity: BOOT_MESSAGE_CAPACITY,
        });
    }

    let challenge = command.data.as_slice();
    if challenge.len() != BOOT_CHALLENGE_CAPACITY {
        session.invalidate();
        return Err(ProtocolError::MalformedPayload(
            constants::ERR_CHALLENGE_LEN.into(),
        ));
    }

    let msg = signed_message(BOOT_COMMAND_LABEL, &[&transcript, challenge]);
    if !ap_verifier.verify_message(&msg, &command.sig) {
        warn!("Boot command signature rejected");
        session.invalidate();
        return Err(ProtocolError::Signature(
            constants::ERR_BOOT_COMMAND_SIG.into(),
        ));
    }

    let sig = signer.sign_message(&signed_message(
        BOOT_ACK_LABEL,
        &[&transcript, challenge, boot_message],
    ))?;
    let ack = BootAckPayload::new(boot_message, sig)?;

    session.promote(SessionState::Authorized);
    Ok(ack)
}

/// AP: verify the acknowledgement and return the Component's boot message.
#[instrument(skip_all, fields(peer = session.peer()))]
pub fn verify_boot_ack(
    session: &mut Session,
    component_verifier: &dyn MessageVerifier,
    challenge: &BootChallenge,
    ack: &BootAckPayload,
) -> Result<Vec<u8>> {
    session.require(SessionState::Attested)?;
    let transcript = *session.transcript_hash()?;

    let boot_message = ack.data.as_slice();
    let msg = signed_message(BOOT_ACK_LABEL, &[&transcript, challenge, boot_message]);
    if !component_verifier.verify_message(&msg, &ack.sig) {
        warn!("Boot acknowledgement signature rejected");
        session.invalidate();
        return Err(ProtocolError::Signature(constants::ERR_BOOT_ACK_SIG.into()));
    }

    session.promote(SessionState::Authorized);
    Ok(boot_message.to_vec())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::packet::SIG_LEN;
    use crate::protocol::session::Role;
    use crate::utils::crypto::SessionKey;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;
    use std::cell::Cell;

    struct CountingVerifier<'a> {
        inner: &'a dyn MessageVerifier,
        calls: Cell<usize>,
    }

    impl MessageVerifier for CountingVerifier<'_> {
        fn verify_message(&self, msg: &[u8], sig: &[u8; SIG_LEN]) -> bool {
            self.calls.set(self.calls.get() + 1);
            self.inner.verify_message(msg, sig)
        }
    }

    fn session(role: Role, state: SessionState) -> Session {
        let mut session = Session::new(7, role);
        session.establish(SessionKey::from_bytes([8u8; 32])).unwrap();
        if state > SessionState::Keyed {
            session.promote(state);
        }
        session
    }

    #[test]
    fn test_boot_roundtrip() {
        let ap_key = SigningKey::generate(&mut OsRng);
        let comp_key = SigningKey::generate(&mut OsRng);
        let mut ap = session(Role::ApplicationProcessor, SessionState::Attested);
        let mut comp = session(Role::Component, SessionState::Attested);

        let (challenge, cmd) = build_boot_command(&ap, &ap_key).unwrap();
        let ack = answer_boot_command(
            &mut comp,
            &ap_key.verifying_key(),
            &comp_key,
            b"component ready",
            &cmd,
        )
        .unwrap();
        let msg = verify_boot_ack(&mut ap, &comp_key.verifying_key(), &challenge, &ack).unwrap();

        assert_eq!(msg, b"component ready");
        assert_eq!(ap.state(), SessionState::Authorized);
        assert_eq!(comp.state(), SessionState::Authorized);
    }

    #[test]
    fn test_keyed_session_rejected_before_verify() {
        let ap_key = SigningKey::generate(&mut OsRng);
        let comp_key = SigningKey::generate(&mut OsRng);
        let ap = session(Role::ApplicationProcessor, SessionState::Attested);
        let mut comp = session(Role::Component, SessionState::Keyed);

        let (_, cmd) = build_boot_command(&ap, &ap_key).unwrap();
        let vk = ap_key.verifying_key();
        let verifier = CountingVerifier {
            inner: &vk,
            calls: Cell::new(0),
        };

        let err = answer_boot_command(&mut comp, &verifier, &comp_key, b"boot", &cmd).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidState {
                expected: SessionState::Attested,
                actual: SessionState::Keyed
            }
        ));
        assert_eq!(verifier.calls.get(), 0);
    }

    #[test]
    fn test_attestation_signature_not_accepted_as_boot() {
        let ap_key = SigningKey::generate(&mut OsRng);
        let comp_key = SigningKey::generate(&mut OsRng);
        let mut comp = session(Role::Component, SessionState::Attested);

        let challenge = [1u8; BOOT_CHALLENGE_CAPACITY];
        let transcript = *comp.transcript_hash().unwrap();
        let sig = ap_key
            .sign_message(&signed_message(
                crate::protocol::attestation::ATTEST_COMMAND_LABEL,
                &[&transcript, &challenge],
            ))
            .unwrap();
        let cmd = BootCommandPayload::new(&challenge, sig).unwrap();

        assert!(matches!(
            answer_boot_command(&mut comp, &ap_key.verifying_key(), &comp_key, b"x", &cmd),
            Err(ProtocolError::Signature(_))
        ));
        assert!(comp.is_invalidated());
    }

    #[test]
    fn test_command_bound_to_key_exchange() {
        let ap_key = SigningKey::generate(&mut OsRng);
        let comp_key = SigningKey::generate(&mut OsRng);
        let mut relayed = Session::new(7, Role::ApplicationProcessor);
        relayed.establish(SessionKey::from_bytes([1u8; 32])).unwrap();
        relayed.promote(SessionState::Attested);
        let mut comp = session(Role::Component, SessionState::Attested);

        let (_, cmd) = build_boot_command(&relayed, &ap_key).unwrap();
        assert!(matches!(
            answer_boot_command(&mut comp, &ap_key.verifying_key(), &comp_key, b"x", &cmd),
            Err(ProtocolError::Signature(_))
        ));
        assert_eq!(comp.state(), SessionState::Attested);
    }

    #[test]
    fn test_forged_ack_keeps_attested() {
        let ap_key = SigningKey::generate(&mut OsRng);
        let impostor = SigningKey::generate(&mut OsRng);
        let comp_key = SigningKey::generate(&mut OsRng);
        let mut ap = session(Role::ApplicationProcessor, SessionState::Attested);
        let mut comp = session(Role::Component, SessionState::Attested);

        let (challenge, cmd) = build_boot_command(&ap, &ap_key).unwrap();
        let ack =
            answer_boot_command(&mut comp, &ap_key.verifying_key(), &impostor, b"boot", &cmd)
                .unwrap();

        assert!(verify_boot_ack(&mut ap, &comp_key.verifying_key(), &challenge, &ack).is_err());
        assert_eq!(ap.state(), SessionState::Attested);
        assert!(ap.is_invalidated());
    }
}
