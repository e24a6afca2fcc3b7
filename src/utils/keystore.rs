//! Provisioned secrets and the persistent provisioning record.
//!
//! ## Components
//! - **ApSecrets / ComponentSecrets**: long-term keys and hashes, stored as TOML
//!   with hex-encoded byte fields
//! - **WrappedKey**: attestation key sealed under a PIN-derived wrapper key
//!   (ChaCha20-Poly1305)
//! - **Deployment**: generates a matching set of AP and Component secrets
//! - **FlashStore**: the AP's provisioning record, persisted with `bincode`
//!
//! The PIN is checked against `stretch(pin, PIN_ROUNDS)`; the wrapper key is
//! `stretch(pin, WRAP_ROUNDS)`, so the stored hash never reveals the wrapper.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::attestation::{AttestationReport, SealedEvidence};
use crate::utils::crypto::{ct_eq, random_bytes, sha256, stretch};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const PIN_ROUNDS: u32 = 25_000;
pub const WRAP_ROUNDS: u32 = PIN_ROUNDS - 1;

pub const ATTEST_KEY_LEN: usize = 16;
const WRAP_NONCE_LEN: usize = 12;

/// Marks an initialised provisioning record
pub const FLASH_MAGIC: u16 = 0xDACC;

/// Hex (de)serialization for fixed-size byte arrays.
mod hex_array {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(text.trim()).map_err(D::Error::custom)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {N} bytes, got {len}")))
    }
}

mod hex_vec {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text.trim()).map_err(D::Error::custom)
    }
}

fn signing_key(seed: &[u8; 32]) -> SigningKey {
    SigningKey::from_bytes(seed)
}

fn verifying_key(bytes: &[u8; 32]) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(bytes)
        .map_err(|e| ProtocolError::InvalidKeyMaterial(format!("public key: {e}")))
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| ProtocolError::ConfigError(format!("{}: {e}", path.display())))
}

fn to_toml<T: Serialize>(value: &T) -> Result<String> {
    toml::to_string_pretty(value)
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize secrets: {e}")))
}

/// Attestation key sealed under a PIN-derived wrapper key.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct WrappedKey {
    #[serde(with = "hex_array")]
    nonce: [u8; WRAP_NONCE_LEN],
    #[serde(with = "hex_vec")]
    ciphertext: Vec<u8>,
}

impl WrappedKey {
    pub fn wrap(key: &[u8; ATTEST_KEY_LEN], wrapper: &[u8; 32]) -> Result<Self> {
        let nonce: [u8; WRAP_NONCE_LEN] = random_bytes()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(wrapper));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), key.as_slice())
            .map_err(|_| ProtocolError::Crypto("key wrap failed".into()))?;
        Ok(Self { nonce, ciphertext })
    }

    /// Recover the key; a wrong wrapper or tampered blob fails authentication.
    pub fn unwrap_with(&self, wrapper: &[u8; 32]) -> Result<Zeroizing<[u8; ATTEST_KEY_LEN]>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(wrapper));
        let plain = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
                .map_err(|_| ProtocolError::KeyUnwrap(constants::ERR_UNWRAP_FAILED.into()))?,
        );
        let mut key = Zeroizing::new([0u8; ATTEST_KEY_LEN]);
        if plain.len() != ATTEST_KEY_LEN {
            return Err(ProtocolError::KeyUnwrap(format!(
                "unwrapped key is {} bytes",
                plain.len()
            )));
        }
        key.copy_from_slice(&plain);
        Ok(key)
    }
}

/// Runtime keys of the application processor.
pub struct ApIdentity {
    pub attest_signer: SigningKey,
    pub boot_signer: SigningKey,
    pub component_attest: VerifyingKey,
    pub component_boot: VerifyingKey,
}

/// Runtime keys of a component.
pub struct ComponentIdentity {
    pub attest_signer: SigningKey,
    pub boot_signer: SigningKey,
    pub ap_attest: VerifyingKey,
    pub ap_boot: VerifyingKey,
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ApSecrets {
    #[serde(with = "hex_array")]
    pub attest_signing_seed: [u8; 32],
    #[serde(with = "hex_array")]
    pub boot_signing_seed: [u8; 32],
    #[serde(with = "hex_array")]
    pub component_attest_public: [u8; 32],
    #[serde(with = "hex_array")]
    pub component_boot_public: [u8; 32],
    #[serde(with = "hex_array")]
    pub pin_hash: [u8; 32],
    #[serde(with = "hex_array")]
    pub token_hash: [u8; 32],
    pub wrapped_attest_key: WrappedKey,
    pub boot_message: String,
}

impl ApSecrets {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_toml(path.as_ref())
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse AP secrets: {e}")))
    }

    pub fn to_toml(&self) -> Result<String> {
        to_toml(self)
    }

    pub fn identity(&self) -> Result<ApIdentity> {
        Ok(ApIdentity {
            attest_signer: signing_key(&self.attest_signing_seed),
            boot_signer: signing_key(&self.boot_signing_seed),
            component_attest: verifying_key(&self.component_attest_public)?,
            component_boot: verifying_key(&self.component_boot_public)?,
        })
    }

    #[instrument(skip_all)]
    pub fn check_pin(&self, pin: &str) -> Result<()> {
        if ct_eq(&stretch(pin.as_bytes(), PIN_ROUNDS), &self.pin_hash) {
            debug!("Pin accepted");
            Ok(())
        } else {
            warn!("Invalid PIN");
            Err(ProtocolError::InvalidPin)
        }
    }

    #[instrument(skip_all)]
    pub fn check_token(&self, token: &str) -> Result<()> {
        if ct_eq(&sha256(token.as_bytes()), &self.token_hash) {
            debug!("Token accepted");
            Ok(())
        } else {
            warn!("Invalid replacement token");
            Err(ProtocolError::InvalidToken)
        }
    }

    /// Check `pin` and recover the attestation key it protects.
    pub fn unwrap_attest_key(&self, pin: &str) -> Result<Zeroizing<[u8; ATTEST_KEY_LEN]>> {
        self.check_pin(pin)?;
        let wrapper = Zeroizing::new(stretch(pin.as_bytes(), WRAP_ROUNDS));
        self.wrapped_attest_key.unwrap_with(&wrapper)
    }
}

impl std::fmt::Debug for ApSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApSecrets")
            .field("boot_message", &self.boot_message)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ComponentSecrets {
    #[serde(with = "hex_array")]
    pub attest_signing_seed: [u8; 32],
    #[serde(with = "hex_array")]
    pub boot_signing_seed: [u8; 32],
    #[serde(with = "hex_array")]
    pub ap_attest_public: [u8; 32],
    #[serde(with = "hex_array")]
    pub ap_boot_public: [u8; 32],
    #[serde(with = "hex_array")]
    pub sealed_evidence: SealedEvidence,
    pub boot_message: String,
}

impl ComponentSecrets {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_toml(path.as_ref())
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            ProtocolError::ConfigError(format!("Failed to parse component secrets: {e}"))
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        to_toml(self)
    }

    pub fn identity(&self) -> Result<ComponentIdentity> {
        Ok(ComponentIdentity {
            attest_signer: signing_key(&self.attest_signing_seed),
            boot_signer: signing_key(&self.boot_signing_seed),
            ap_attest: verifying_key(&self.ap_attest_public)?,
            ap_boot: verifying_key(&self.ap_boot_public)?,
        })
    }
}

impl std::fmt::Debug for ComponentSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentSecrets")
            .field("boot_message", &self.boot_message)
            .finish_non_exhaustive()
    }
}

/// Inputs to [`Deployment::generate`].
#[derive(Debug, Clone)]
pub struct DeploymentParams<'a> {
    pub pin: &'a str,
    pub token: &'a str,
    pub report: &'a AttestationReport,
    pub ap_boot_message: &'a str,
    pub component_boot_message: &'a str,
}

/// A matched pair of AP and Component secrets.
pub struct Deployment {
    pub ap: ApSecrets,
    pub component: ComponentSecrets,
}

impl Deployment {
    #[instrument(skip_all)]
    pub fn generate(params: &DeploymentParams<'_>) -> Result<Self> {
        let ap_attest = SigningKey::generate(&mut OsRng);
        let ap_boot = SigningKey::generate(&mut OsRng);
        let comp_attest = SigningKey::generate(&mut OsRng);
        let comp_boot = SigningKey::generate(&mut OsRng);

        let attest_key = Zeroizing::new(random_bytes::<ATTEST_KEY_LEN>()?);
        let wrapper = Zeroizing::new(stretch(params.pin.as_bytes(), WRAP_ROUNDS));

        let ap = ApSecrets {
            attest_signing_seed: ap_attest.to_bytes(),
            boot_signing_seed: ap_boot.to_bytes(),
            component_attest_public: comp_attest.verifying_key().to_bytes(),
            component_boot_public: comp_boot.verifying_key().to_bytes(),
            pin_hash: stretch(params.pin.as_bytes(), PIN_ROUNDS),
            token_hash: sha256(params.token.as_bytes()),
            wrapped_attest_key: WrappedKey::wrap(&attest_key, &wrapper)?,
            boot_message: params.ap_boot_message.to_owned(),
        };
        let component = ComponentSecrets {
            attest_signing_seed: comp_attest.to_bytes(),
            boot_signing_seed: comp_boot.to_bytes(),
            ap_attest_public: ap_attest.verifying_key().to_bytes(),
            ap_boot_public: ap_boot.verifying_key().to_bytes(),
            sealed_evidence: params.report.seal(&attest_key),
            boot_message: params.component_boot_message.to_owned(),
        };

        info!("Generated deployment secrets");
        Ok(Self { ap, component })
    }
}

/// What the AP believes is installed on its bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRecord {
    pub magic: u16,
    pub component_ids: Vec<u32>,
}

impl ProvisioningRecord {
    pub fn new(component_ids: &[u32]) -> Self {
        Self {
            magic: FLASH_MAGIC,
            component_ids: component_ids.to_vec(),
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.magic == FLASH_MAGIC
    }
}

/// Provisioning record backed by a file, or by memory alone.
#[derive(Debug)]
pub struct FlashStore {
    path: Option<PathBuf>,
    record: ProvisioningRecord,
}

impl FlashStore {
    pub fn in_memory(component_ids: &[u32]) -> Self {
        Self {
            path: None,
            record: ProvisioningRecord::new(component_ids),
        }
    }

    /// Load the record at `path`, writing `defaults` on first boot.
    ///
    /// A missing file, an undecodable file and a record without the magic all
    /// count as first boot.
    #[instrument(skip(defaults), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P, defaults: &[u32]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existing = match fs::read(&path) {
            Ok(bytes) => bincode::deserialize::<ProvisioningRecord>(&bytes)
                .ok()
                .filter(ProvisioningRecord::is_initialised),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            Some(record) => Ok(Self {
                path: Some(path),
                record,
            }),
            None => {
                debug!("First boot, setting flash");
                let store = Self {
                    path: Some(path),
                    record: ProvisioningRecord::new(defaults),
                };
                store.persist()?;
                Ok(store)
            }
        }
    }

    pub fn record(&self) -> &ProvisioningRecord {
        &self.record
    }

    pub fn component_ids(&self) -> &[u32] {
        &self.record.component_ids
    }

    pub fn contains(&self, component_id: u32) -> bool {
        self.record.component_ids.contains(&component_id)
    }

    /// Swap `outgoing` for `incoming` and persist.
    pub fn replace(&mut self, outgoing: u32, incoming: u32) -> Result<()> {
        let slot = self
            .record
            .component_ids
            .iter_mut()
            .find(|id| **id == outgoing)
            .ok_or(ProtocolError::UnknownComponent(outgoing))?;
        *slot = incoming;
        self.persist()?;
        debug!(outgoing, incoming, "Component replaced");
        Ok(())
    }

    pub fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let bytes = bincode::serialize(&self.record)?;
            fs::write(path, bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn deployment() -> Deployment {
        let report = AttestationReport::new("Lab", "2024-05-01", "ACME").unwrap();
        Deployment::generate(&DeploymentParams {
            pin: "123456",
            token: "0123456789abcdef",
            report: &report,
            ap_boot_message: "AP boot",
            component_boot_message: "Component boot",
        })
        .unwrap()
    }

    #[test]
    fn test_pin_unwraps_attestation_key() {
        let d = deployment();
        let key = d.ap.unwrap_attest_key("123456").unwrap();
        let report = AttestationReport::open(&key, &d.component.sealed_evidence).unwrap();
        assert_eq!(report.customer, "ACME");

        assert!(matches!(
            d.ap.unwrap_attest_key("654321"),
            Err(ProtocolError::InvalidPin)
        ));
    }

    #[test]
    fn test_wrap_rejects_wrong_wrapper() {
        let wrapped = WrappedKey::wrap(&[1u8; ATTEST_KEY_LEN], &[2u8; 32]).unwrap();
        assert_eq!(*wrapped.unwrap_with(&[2u8; 32]).unwrap(), [1u8; ATTEST_KEY_LEN]);
        assert!(matches!(
            wrapped.unwrap_with(&[3u8; 32]),
            Err(ProtocolError::KeyUnwrap(_))
        ));
    }

    #[test]
    fn test_token_check() {
        let d = deployment();
        assert!(d.ap.check_token("0123456789abcdef").is_ok());
        assert!(matches!(
            d.ap.check_token("0123456789abcdee"),
            Err(ProtocolError::InvalidToken)
        ));
    }

    #[test]
    fn test_identities_match() {
        let d = deployment();
        let ap = d.ap.identity().unwrap();
        let comp = d.component.identity().unwrap();
        assert_eq!(ap.component_attest, comp.attest_signer.verifying_key());
        assert_eq!(comp.ap_boot, ap.boot_signer.verifying_key());
    }

    #[test]
    fn test_secrets_toml_roundtrip() {
        let d = deployment();
        let text = d.component.to_toml().unwrap();
        let back = ComponentSecrets::from_toml(&text).unwrap();
        assert_eq!(back.sealed_evidence, d.component.sealed_evidence);
        assert_eq!(back.ap_attest_public, d.component.ap_attest_public);
    }

    #[test]
    fn test_flash_first_boot_and_replace() {
        let dir = std::env::temp_dir().join(format!("trustbus-flash-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("flash.bin");
        let _ = fs::remove_file(&path);

        let mut store = FlashStore::open(&path, &[0x11, 0x22]).unwrap();
        assert_eq!(store.component_ids(), &[0x11, 0x22]);
        store.replace(0x22, 0x33).unwrap();
        assert!(matches!(
            store.replace(0x99, 0x44),
            Err(ProtocolError::UnknownComponent(0x99))
        ));

        let reopened = FlashStore::open(&path, &[0xAA]).unwrap();
        assert_eq!(reopened.component_ids(), &[0x11, 0x33]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_flash_bad_magic_reinitialises() {
        let dir = std::env::temp_dir().join(format!("trustbus-magic-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("flash.bin");
        let stale = ProvisioningRecord {
            magic: 0x1234,
            component_ids: vec![0x55],
        };
        fs::write(&path, bincode::serialize(&stale).unwrap()).unwrap();

        let store = FlashStore::open(&path, &[0x66]).unwrap();
        assert_eq!(store.component_ids(), &[0x66]);
        fs::remove_dir_all(&dir).unwrap();
    }
}
