#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge cases: out-of-order steps, forged signatures, replays, bad frames

mod common;

use bytes::Bytes;
use common::*;
use ed25519_dalek::{Signer, SigningKey};
use trustbus::core::packet::{
    BootCommandPayload, Packet, SecurePayload, ERROR_FRAME, SECURE_DATA_CAPACITY,
};
use trustbus::protocol::attestation::build_attest_command;
use trustbus::protocol::boot::BOOT_COMMAND_LABEL;
use trustbus::protocol::handshake::{ap_kex_finalize, ap_kex_init, component_kex_respond};
use trustbus::service::secure;
use trustbus::transport::Responder;
use trustbus::utils::crypto::signed_message;
use trustbus::{BusAddress, Component, LoopbackBus, ProtocolError, Role, Session, SessionState};

/// Run KEX against `component` directly and return the AP's session.
fn keyed_pair(component: &mut Component) -> Session {
    let (state, request) = ap_kex_init().unwrap();
    let Packet::Kex(response) = component.handle(&Packet::Kex(request)).unwrap() else {
        panic!("expected KEX reply");
    };
    let mut session = Session::new(component.id(), Role::ApplicationProcessor);
    session.establish(ap_kex_finalize(state, &response).unwrap()).unwrap();
    session
}

// ============================================================================
// STATE ORDERING
// ============================================================================

#[test]
fn test_attest_before_kex_rejected() {
    let mut ap = system(&[COMPONENT_A]);
    assert!(matches!(
        ap.attest_component(COMPONENT_A),
        Err(ProtocolError::InvalidState {
            expected: SessionState::Keyed,
            ..
        })
    ));
    assert_eq!(ap.metrics().snapshot().bytes_sent, 0);
}

#[test]
fn test_boot_before_attest_rejected_by_ap() {
    let mut ap = system(&[COMPONENT_A]);
    ap.key_exchange(COMPONENT_A).unwrap();

    assert!(matches!(
        ap.authorize_boot(COMPONENT_A),
        Err(ProtocolError::InvalidState {
            expected: SessionState::Attested,
            actual: SessionState::Keyed,
        })
    ));
    // A precondition failure costs nothing: the session can still attest.
    let session = ap.session(COMPONENT_A).unwrap();
    assert!(!session.is_invalidated());
    ap.attest_component(COMPONENT_A).unwrap();
}

#[test]
fn test_component_refuses_boot_while_keyed() {
    let deployment = deployment();
    let mut component = Component::from_secrets(COMPONENT_A, &deployment.component).unwrap();
    let ap_session = keyed_pair(&mut component);

    // Correctly signed by the AP, but the component has not been attested.
    let ap_boot = SigningKey::from_bytes(&deployment.ap.boot_signing_seed);
    let challenge = [0x42; 32];
    let transcript = ap_session.transcript_hash().unwrap();
    let sig = ap_boot.sign(&signed_message(
        BOOT_COMMAND_LABEL,
        &[transcript, &challenge],
    ));
    let command = BootCommandPayload::new(&challenge, sig.to_bytes()).unwrap();
    let frame = Packet::BootCommand(command).to_bytes().unwrap();

    assert_eq!(&component.respond(&frame)[..], &ERROR_FRAME);
    assert_eq!(component.state(), SessionState::Keyed);
    assert!(!component.session().is_invalidated());
    assert!(!component.is_booted());
}

#[test]
fn test_unprovisioned_component_rejected() {
    let mut ap = system(&[COMPONENT_A]);
    assert!(matches!(
        ap.key_exchange(0x2222_2222),
        Err(ProtocolError::UnknownComponent(0x2222_2222))
    ));
}

// ============================================================================
// SIGNATURE FAILURES
// ============================================================================

#[test]
fn test_corrupted_attest_signature_leaves_component_keyed() {
    let deployment = deployment();
    let mut component = Component::from_secrets(COMPONENT_A, &deployment.component).unwrap();
    let ap_session = keyed_pair(&mut component);

    let ap_attest = SigningKey::from_bytes(&deployment.ap.attest_signing_seed);
    let (_, mut command) = build_attest_command(&ap_session, &ap_attest).unwrap();
    assert_eq!(command.data.len(), 7);
    command.sig[10] ^= 0x80;

    assert!(matches!(
        component.handle(&Packet::AttestCommand(command)),
        Err(ProtocolError::Signature(_))
    ));
    assert_eq!(component.state(), SessionState::Keyed);
    assert!(component.session().is_invalidated());
}

#[test]
fn test_component_from_other_deployment_refuses_ap() {
    let other = deployment();
    let mut bus = LoopbackBus::new();
    bus.attach(
        BusAddress::from_component_id(COMPONENT_A),
        Component::from_secrets(COMPONENT_A, &other.component).unwrap(),
    );
    let mut ap = ap_over(bus, deployment(), &[COMPONENT_A]);

    // Key exchange is unauthenticated and succeeds.
    ap.key_exchange(COMPONENT_A).unwrap();

    assert!(matches!(
        ap.attest_component(COMPONENT_A),
        Err(ProtocolError::PeerError)
    ));
    let session = ap.session(COMPONENT_A).unwrap();
    assert_eq!(session.state(), SessionState::Keyed);
    assert!(session.is_invalidated());

    // Nothing further is attempted until a new key exchange.
    assert!(matches!(
        ap.authorize_boot(COMPONENT_A),
        Err(ProtocolError::SessionInvalidated)
    ));
    assert!(matches!(
        ap.secure_send(COMPONENT_A, b"hi"),
        Err(ProtocolError::SessionInvalidated)
    ));
    // The abort reset the component.
    assert_eq!(component(&mut ap, COMPONENT_A).state(), SessionState::Unkeyed);

    ap.key_exchange(COMPONENT_A).unwrap();
    assert!(!ap.session(COMPONENT_A).unwrap().is_invalidated());
}

/// Keys the AP and the genuine component separately, then forwards everything else.
struct Relay {
    inner: Component,
}

impl Responder for Relay {
    fn respond(&mut self, request: &[u8]) -> Bytes {
        if let Ok(Packet::Kex(from_ap)) = Packet::from_bytes(request) {
            let (state, to_component) = ap_kex_init().unwrap();
            let Packet::Kex(reply) = self.inner.handle(&Packet::Kex(to_component)).unwrap() else {
                panic!("expected KEX reply");
            };
            ap_kex_finalize(state, &reply).unwrap();
            let (_, to_ap) = component_kex_respond(&from_ap).unwrap();
            return Packet::Kex(to_ap).to_bytes().unwrap();
        }
        self.inner.respond(request)
    }
}

#[test]
fn test_relayed_handshake_cannot_attest() {
    let deployment = deployment();
    let mut bus = LoopbackBus::new();
    bus.attach(
        BusAddress::from_component_id(COMPONENT_A),
        Relay {
            inner: Component::from_secrets(COMPONENT_A, &deployment.component).unwrap(),
        },
    );
    let mut ap = ap_over(bus, deployment, &[COMPONENT_A]);

    ap.key_exchange(COMPONENT_A).unwrap();
    assert_eq!(component(&mut ap, COMPONENT_A).inner.state(), SessionState::Keyed);
    let ap_transcript = *ap.session(COMPONENT_A).unwrap().transcript_hash().unwrap();
    let relayed = component(&mut ap, COMPONENT_A).inner.session();
    assert_ne!(&ap_transcript, relayed.transcript_hash().unwrap());

    // The component cannot verify a command signed under the relay's key exchange.
    assert!(matches!(
        ap.attest_component(COMPONENT_A),
        Err(ProtocolError::PeerError)
    ));
    assert_ne!(ap.session(COMPONENT_A).unwrap().state(), SessionState::Attested);

    assert!(ap.boot_all().is_err());
    assert!(!component(&mut ap, COMPONENT_A).inner.is_booted());
}

#[test]
fn test_ap_rejects_forged_evidence() {
    let deployment = deployment();
    let mut impostor = deployment.component.clone();
    impostor.attest_signing_seed = [0x5A; 32];

    let mut bus = LoopbackBus::new();
    bus.attach(
        BusAddress::from_component_id(COMPONENT_A),
        Component::from_secrets(COMPONENT_A, &impostor).unwrap(),
    );
    let mut ap = ap_over(bus, deployment, &[COMPONENT_A]);

    let err = ap.boot_all().unwrap_err();
    assert!(matches!(err, ProtocolError::Signature(_)));
    assert!(ap.session(COMPONENT_A).unwrap().is_invalidated());
    assert_eq!(ap.metrics().snapshot().attest.failed, 1);
    assert_eq!(ap.metrics().snapshot().security_events, 1);
    assert!(!component(&mut ap, COMPONENT_A).is_booted());
    assert_eq!(component(&mut ap, COMPONENT_A).state(), SessionState::Unkeyed);
}

// ============================================================================
// SECURE CHANNEL
// ============================================================================

#[test]
fn test_replayed_record_dropped() {
    let deployment = deployment();
    let mut component = Component::from_secrets(COMPONENT_A, &deployment.component).unwrap();
    let mut ap = keyed_pair(&mut component);

    let record = secure::seal(&mut ap, b"once").unwrap();
    let frame = Packet::Secure(record).to_bytes().unwrap();

    assert_ne!(&component.respond(&frame)[..], &ERROR_FRAME);
    assert_eq!(&component.respond(&frame)[..], &ERROR_FRAME);
    assert_eq!(component.drain_inbox(), vec![b"once".to_vec()]);

    // A replay is discarded without ending the session.
    assert!(!component.session().is_invalidated());
    let next = secure::seal(&mut ap, b"twice").unwrap();
    assert_ne!(&component.respond(&Packet::Secure(next).to_bytes().unwrap())[..], &ERROR_FRAME);
}

#[test]
fn test_tampered_record_ends_session() {
    let deployment = deployment();
    let mut component = Component::from_secrets(COMPONENT_A, &deployment.component).unwrap();
    let mut ap = keyed_pair(&mut component);

    let record = secure::seal(&mut ap, b"payload").unwrap();
    let mut data = record.data.as_slice().to_vec();
    data[0] ^= 0x01;
    let tampered = SecurePayload {
        data: trustbus::core::packet::BoundedBytes::new(&data).unwrap(),
        ..record
    };

    assert!(matches!(
        component.handle(&Packet::Secure(tampered)),
        Err(ProtocolError::Authentication)
    ));
    assert!(component.session().is_invalidated());
    assert!(component.drain_inbox().is_empty());

    // Even the genuine record is refused now.
    assert!(matches!(
        component.handle(&Packet::Secure(record)),
        Err(ProtocolError::SessionInvalidated)
    ));
}

#[test]
fn test_oversized_secure_message() {
    let mut ap = system(&[COMPONENT_A]);
    ap.key_exchange(COMPONENT_A).unwrap();
    assert!(matches!(
        ap.secure_send(COMPONENT_A, &[0u8; SECURE_DATA_CAPACITY + 1]),
        Err(ProtocolError::Length { .. })
    ));
    ap.secure_send(COMPONENT_A, &[0u8; SECURE_DATA_CAPACITY]).unwrap();
}

// ============================================================================
// FRAMES
// ============================================================================

#[test]
fn test_component_answers_bad_frames_with_error() {
    let deployment = deployment();
    let mut component = Component::from_secrets(COMPONENT_A, &deployment.component).unwrap();

    let mut list = Packet::List.to_bytes().unwrap().to_vec();
    list[1] ^= 0xFF;

    for frame in [&[][..], &[0x77][..], &[0x4B, 1, 2][..], &list[..]] {
        assert_eq!(&component.respond(frame)[..], &ERROR_FRAME, "frame {frame:02x?}");
    }
    assert_eq!(component.state(), SessionState::Unkeyed);
}

#[test]
fn test_trailing_bytes_ignored() {
    let mut frame = Packet::ListAck {
        component_id: COMPONENT_A,
    }
    .to_bytes()
    .unwrap()
    .to_vec();
    frame.extend_from_slice(&[0xEE; 16]);
    assert_eq!(
        Packet::from_bytes(&frame).unwrap(),
        Packet::ListAck {
            component_id: COMPONENT_A
        }
    );
}
