#![no_main]

use ed25519_dalek::SigningKey;
use libfuzzer_sys::fuzz_target;
use trustbus::transport::Responder;
use trustbus::utils::keystore::ComponentIdentity;
use trustbus::{Component, Packet};

fuzz_target!(|data: &[u8]| {
    let ap = SigningKey::from_bytes(&[7; 32]);
    let identity = ComponentIdentity {
        attest_signer: SigningKey::from_bytes(&[1; 32]),
        boot_signer: SigningKey::from_bytes(&[2; 32]),
        ap_attest: ap.verifying_key(),
        ap_boot: ap.verifying_key(),
    };
    let Ok(mut component) = Component::new(0x1111_1124, identity, [0; 192], b"fuzz") else {
        return;
    };

    // Feed the input as a sequence of requests split on a separator byte.
    for request in data.split(|b| *b == 0xFF) {
        let reply = component.respond(request);
        assert!(Packet::from_bytes(&reply).is_ok(), "component replied with an invalid frame");
    }
});
