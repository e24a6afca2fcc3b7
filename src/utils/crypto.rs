//! Cryptographic primitives used by the protocol.
//!
//! The protocol consumes capabilities, not concrete keys: anything that can
//! sign or verify a message can stand in for a provisioned identity. Ed25519
//! (`ed25519-dalek`) is the deployed scheme.
//!
//! ## Primitives
//! - Signatures: Ed25519, 64-byte detached signatures
//! - Hashing: SHA-256 (KEX commitments, PIN and token checks)
//! - Key schedule: HKDF-SHA256 from the X25519 shared secret
//! - Secure channel: AES-128-CTR with HMAC-SHA256, one key pair per direction
//! - Randomness: OS RNG through `getrandom`

use crate::core::packet::{HMAC_LEN, SIG_LEN};
use crate::error::{constants, ProtocolError, Result};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

pub const SESSION_KEY_LEN: usize = 32;
pub const CIPHER_KEY_LEN: usize = 16;

const SESSION_KEY_INFO: &[u8] = b"trustbus/session-key/v2";
const AP_TO_COMPONENT_INFO: &[u8] = b"trustbus/traffic/ap->component";
const COMPONENT_TO_AP_INFO: &[u8] = b"trustbus/traffic/component->ap";
const TRANSCRIPT_INFO: &[u8] = b"trustbus/transcript";

/// Produces detached signatures with a long-term identity key.
pub trait MessageSigner {
    fn sign_message(&self, msg: &[u8]) -> Result<[u8; SIG_LEN]>;
}

/// Checks detached signatures against a peer's public identity.
pub trait MessageVerifier {
    fn verify_message(&self, msg: &[u8], sig: &[u8; SIG_LEN]) -> bool;
}

impl MessageSigner for SigningKey {
    fn sign_message(&self, msg: &[u8]) -> Result<[u8; SIG_LEN]> {
        self.try_sign(msg)
            .map(|sig| sig.to_bytes())
            .map_err(|_| ProtocolError::Crypto(constants::ERR_SIGNING_FAILED.into()))
    }
}

impl MessageVerifier for VerifyingKey {
    fn verify_message(&self, msg: &[u8], sig: &[u8; SIG_LEN]) -> bool {
        let sig = Signature::from_bytes(sig);
        self.verify_strict(msg, &sig).is_ok()
    }
}

/// Context label followed by the signed fields.
pub fn signed_message(label: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let total = label.len() + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(label);
    for part in parts {
        msg.extend_from_slice(part);
    }
    msg
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 over `secret` fed `rounds` times into one hasher.
pub fn stretch(secret: &[u8], rounds: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for _ in 0..rounds {
        hasher.update(secret);
    }
    hasher.finalize().into()
}

pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Fill a fixed-size array from the OS RNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    getrandom::fill(&mut out)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_RANDOM_FAILED.into()))?;
    Ok(out)
}

pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; HMAC_LEN]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ProtocolError::Crypto(format!("HMAC key: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time tag check.
pub fn verify_hmac(key: &[u8], parts: &[&[u8]], tag: &[u8; HMAC_LEN]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

/// AES-128-CTR keystream applied in place; encryption and decryption are the same call.
pub fn aes128_ctr(key: &[u8; CIPHER_KEY_LEN], iv: &[u8; 16], buf: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(buf);
}

/// Symmetric key shared by one AP/Component pair for one key-exchange epoch.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        ct_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derive the session key from the X25519 output.
///
/// Both materials enter in AP-then-Component order, so the two sides agree
/// regardless of who calls.
pub fn derive_session_key(
    shared_secret: &[u8; 32],
    ap_material: &[u8],
    component_material: &[u8],
) -> Result<SessionKey> {
    let mut salt = Vec::with_capacity(ap_material.len() + component_material.len());
    salt.extend_from_slice(ap_material);
    salt.extend_from_slice(component_material);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut okm = [0u8; SESSION_KEY_LEN];
    hk.expand(SESSION_KEY_INFO, &mut okm)
        .map_err(|e| ProtocolError::Crypto(format!("HKDF expand: {e}")))?;
    Ok(SessionKey(okm))
}

/// Encryption and MAC key for one direction of traffic.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    pub cipher: [u8; CIPHER_KEY_LEN],
    pub mac: [u8; HMAC_LEN],
}

/// Per-direction keys expanded from a [`SessionKey`], plus the transcript
/// binding that ties signed handshake steps to this key exchange.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TrafficKeys {
    pub ap_to_component: DirectionKeys,
    pub component_to_ap: DirectionKeys,
    pub transcript: [u8; 32],
}

impl TrafficKeys {
    pub fn derive(key: &SessionKey) -> Result<Self> {
        let hk = Hkdf::<Sha256>::from_prk(key.as_bytes())
            .map_err(|e| ProtocolError::Crypto(format!("HKDF PRK: {e}")))?;
        let mut transcript = [0u8; 32];
        hk.expand(TRANSCRIPT_INFO, &mut transcript)
            .map_err(|e| ProtocolError::Crypto(format!("HKDF expand: {e}")))?;
        Ok(Self {
            ap_to_component: expand_direction(&hk, AP_TO_COMPONENT_INFO)?,
            component_to_ap: expand_direction(&hk, COMPONENT_TO_AP_INFO)?,
            transcript,
        })
    }
}

fn expand_direction(hk: &Hkdf<Sha256>, info: &[u8]) -> Result<DirectionKeys> {
    let mut okm = [0u8; CIPHER_KEY_LEN + HMAC_LEN];
    hk.expand(info, &mut okm)
        .map_err(|e| ProtocolError::Crypto(format!("HKDF expand: {e}")))?;
    let mut keys = DirectionKeys {
        cipher: [0u8; CIPHER_KEY_LEN],
        mac: [0u8; HMAC_LEN],
    };
    keys.cipher.copy_from_slice(&okm[..CIPHER_KEY_LEN]);
    keys.mac.copy_from_slice(&okm[CIPHER_KEY_LEN..]);
    okm.zeroize();
    Ok(keys)
}
