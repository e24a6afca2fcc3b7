//! Two-message key exchange using X25519 (`x25519-dalek`).
//!
//! ```text
//! AP                                   Component
//!  | KEX{material = Ma, hash = H(Ma)}      |
//!  |-------------------------------------->|  K = derive(Mb, Ma)
//!  | KEX{material = Mb, hash = H(Mb)}      |
//!  |<--------------------------------------|
//!  K = derive(Ma, Mb), check H(Mb)
//! ```
//!
//! The commitment only catches corruption. The exchange is unauthenticated on
//! its own and must be followed by attestation before the peer is trusted.
//!
//! Handshake state lives in [`ApKexState`], owned by the caller and consumed by
//! [`ap_kex_finalize`], so a retried exchange never reuses an ephemeral secret.

use crate::core::packet::{BoundedBytes, KexPayload, KEX_MATERIAL_LEN};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{ct_eq, derive_session_key, sha256, SessionKey};
use rand_core::OsRng;
use tracing::{debug, instrument, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

/// AP-side handshake state between sending and receiving KEX.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct ApKexState {
    secret: Option<EphemeralSecret>,
    material: [u8; KEX_MATERIAL_LEN],
}

impl ApKexState {
    /// The AP's public contribution.
    pub fn material(&self) -> &[u8; KEX_MATERIAL_LEN] {
        &self.material
    }
}

/// SHA-256 commitment over key material.
pub fn commitment(material: &[u8]) -> [u8; 32] {
    sha256(material)
}

fn kex_payload(material: [u8; KEX_MATERIAL_LEN]) -> Result<KexPayload> {
    Ok(KexPayload {
        material: BoundedBytes::new(&material)?,
        hash: commitment(&material),
    })
}

/// Structural check: the material must fill its field exactly.
fn peer_material(payload: &KexPayload) -> Result<[u8; KEX_MATERIAL_LEN]> {
    payload
        .material
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::MalformedPayload(constants::ERR_KEX_MATERIAL_LEN.into()))
}

fn agree(
    secret: EphemeralSecret,
    peer: [u8; KEX_MATERIAL_LEN],
    ap_material: &[u8],
    component_material: &[u8],
) -> Result<SessionKey> {
    let shared = secret.diffie_hellman(&PublicKey::from(peer));
    if !shared.was_contributory() {
        warn!("Peer key material is a low-order point");
        return Err(ProtocolError::InvalidKeyMaterial(
            constants::ERR_NON_CONTRIBUTORY.into(),
        ));
    }
    derive_session_key(shared.as_bytes(), ap_material, component_material)
}

/// AP step 1: fresh ephemeral key and the KEX request carrying it.
#[instrument]
pub fn ap_kex_init() -> Result<(ApKexState, KexPayload)> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let material = PublicKey::from(&secret).to_bytes();
    let payload = kex_payload(material)?;

    debug!("AP initiating key exchange");
    Ok((
        ApKexState {
            secret: Some(secret),
            material,
        },
        payload,
    ))
}

/// Component step: derive the session key and build the KEX reply.
///
/// Only structure is checked here; there is no peer secret to verify yet.
#[instrument(skip(request))]
pub fn component_kex_respond(request: &KexPayload) -> Result<(SessionKey, KexPayload)> {
    let ap_material = peer_material(request)?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let material = PublicKey::from(&secret).to_bytes();
    let key = agree(secret, ap_material, &ap_material, &material)?;

    debug!("Component answered key exchange");
    Ok((key, kex_payload(material)?))
}

/// AP step 2: check the reply's commitment and derive the session key.
#[instrument(skip(state, response))]
pub fn ap_kex_finalize(mut state: ApKexState, response: &KexPayload) -> Result<SessionKey> {
    let component_material = peer_material(response)?;

    if !ct_eq(&commitment(&component_material), &response.hash) {
        warn!("Key exchange commitment mismatch");
        return Err(ProtocolError::HashMismatch);
    }

    let secret = state.secret.take().ok_or_else(|| {
        ProtocolError::InvalidKeyMaterial(constants::ERR_KEX_SECRET_NOT_FOUND.into())
    })?;
    let key = agree(secret, component_material, &state.material, &component_material)?;

    debug!("AP derived session key");
    Ok(key)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_key() {
        let (state, request) = ap_kex_init().unwrap();
        assert_eq!(request.material.as_slice(), state.material());
        assert_eq!(request.hash, commitment(state.material()));

        let (component_key, response) = component_kex_respond(&request).unwrap();
        let ap_key = ap_kex_finalize(state, &response).unwrap();
        assert_eq!(ap_key, component_key);
    }

    #[test]
    fn test_independent_runs_differ() {
        let (s1, r1) = ap_kex_init().unwrap();
        let (s2, r2) = ap_kex_init().unwrap();
        assert_ne!(r1.material, r2.material);

        let (_, resp1) = component_kex_respond(&r1).unwrap();
        let (_, resp2) = component_kex_respond(&r2).unwrap();
        let k1 = ap_kex_finalize(s1, &resp1).unwrap();
        let k2 = ap_kex_finalize(s2, &resp2).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_corrupted_commitment_rejected() {
        let (state, request) = ap_kex_init().unwrap();
        let (_, mut response) = component_kex_respond(&request).unwrap();
        response.hash[0] ^= 0x80;
        assert!(matches!(
            ap_kex_finalize(state, &response),
            Err(ProtocolError::HashMismatch)
        ));
    }

    #[test]
    fn test_short_material_rejected() {
        let (_, mut request) = ap_kex_init().unwrap();
        request.material = BoundedBytes::new(&request.material.as_slice()[..31]).unwrap();
        assert!(matches!(
            component_kex_respond(&request),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_low_order_material_rejected() {
        let zero = [0u8; KEX_MATERIAL_LEN];
        let request = KexPayload {
            material: BoundedBytes::new(&zero).unwrap(),
            hash: commitment(&zero),
        };
        assert!(matches!(
            component_kex_respond(&request),
            Err(ProtocolError::InvalidKeyMaterial(_))
        ));
    }
}
