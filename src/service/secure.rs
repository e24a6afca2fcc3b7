//! Secure channel records over an established session.
//!
//! ```text
//! nonce = ++send_nonce
//! data  = AES-128-CTR(k_enc, iv = nonce_be || 0^12, plaintext)
//! hmac  = HMAC-SHA256(k_mac, nonce_le || data)
//! ```
//!
//! Receiving authenticates first, then checks the nonce window, then decrypts.
//! The window only moves once the record has been fully accepted.

use crate::core::packet::{BoundedBytes, SecurePayload, SECURE_DATA_CAPACITY};
use crate::error::{ProtocolError, Result};
use crate::protocol::session::Session;
use crate::utils::crypto::{aes128_ctr, hmac_sha256, verify_hmac};
use tracing::{debug, instrument, warn};

fn iv_for(nonce: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&nonce.to_be_bytes());
    iv
}

/// Encrypt and authenticate `plaintext` under the session's outbound keys.
#[instrument(skip(session, plaintext), fields(peer = session.peer(), len = plaintext.len()))]
pub fn seal(session: &mut Session, plaintext: &[u8]) -> Result<SecurePayload> {
    session.require_keyed()?;
    if plaintext.len() > SECURE_DATA_CAPACITY {
        return Err(ProtocolError::Length {
            declared: plaintext.len(),
            capacity: SECURE_DATA_CAPACITY,
        });
    }

    let nonce = session.next_nonce()?;
    let keys = session.outbound_keys()?;

    let mut data = plaintext.to_vec();
    aes128_ctr(&keys.cipher, &iv_for(nonce), &mut data);
    let hmac = hmac_sha256(&keys.mac, &[&nonce.to_le_bytes(), &data])?;

    debug!(nonce, "Sealed secure record");
    Ok(SecurePayload {
        nonce,
        data: BoundedBytes::new(&data)?,
        hmac,
    })
}

/// Authenticate, replay-check and decrypt a record from the peer.
///
/// A bad tag marks the session untrusted; a stale nonce is only discarded.
#[instrument(skip(session, record), fields(peer = session.peer(), nonce = record.nonce))]
pub fn open(session: &mut Session, record: &SecurePayload) -> Result<Vec<u8>> {
    session.require_keyed()?;
    let keys = session.inbound_keys()?;

    let nonce_le = record.nonce.to_le_bytes();
    let data = record.data.as_slice();
    if !verify_hmac(&keys.mac, &[&nonce_le, data], &record.hmac) {
        warn!("Secure record failed authentication");
        session.invalidate();
        return Err(ProtocolError::Authentication);
    }

    session.replay_guard().check(record.nonce)?;

    let mut plaintext = data.to_vec();
    aes128_ctr(&keys.cipher, &iv_for(record.nonce), &mut plaintext);

    session.replay_guard_mut().commit(record.nonce);
    Ok(plaintext)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::session::Role;
    use crate::utils::crypto::SessionKey;

    fn pair() -> (Session, Session) {
        let key = SessionKey::from_bytes([0x33; 32]);
        let mut ap = Session::new(9, Role::ApplicationProcessor);
        let mut component = Session::new(9, Role::Component);
        ap.establish(key.clone()).unwrap();
        component.establish(key).unwrap();
        (ap, component)
    }

    #[test]
    fn test_seal_open() {
        let (mut ap, mut comp) = pair();
        let record = seal(&mut ap, b"hello component").unwrap();
        assert_eq!(record.nonce, 1);
        assert_ne!(record.data.as_slice(), b"hello component");
        assert_eq!(open(&mut comp, &record).unwrap(), b"hello component");
        assert_eq!(comp.last_received_nonce(), 1);
    }

    #[test]
    fn test_duplicate_nonce_rejected() {
        let (mut ap, mut comp) = pair();
        let first = seal(&mut ap, b"one").unwrap();
        open(&mut comp, &first).unwrap();
        assert!(matches!(
            open(&mut comp, &first),
            Err(ProtocolError::Replay { nonce: 1, last: 1 })
        ));

        let second = seal(&mut ap, b"two").unwrap();
        assert_eq!(second.nonce, 2);
        assert_eq!(open(&mut comp, &second).unwrap(), b"two");
    }

    #[test]
    fn test_tampered_record_not_decrypted() {
        let (mut ap, mut comp) = pair();
        let mut record = seal(&mut ap, b"payload").unwrap();
        record.nonce += 1;
        assert!(matches!(
            open(&mut comp, &record),
            Err(ProtocolError::Authentication)
        ));
        assert_eq!(comp.last_received_nonce(), 0);
        assert!(comp.is_invalidated());
    }

    #[test]
    fn test_own_records_rejected() {
        let (mut ap, _) = pair();
        let record = seal(&mut ap, b"reflected").unwrap();
        assert!(matches!(
            open(&mut ap, &record),
            Err(ProtocolError::Authentication)
        ));
    }

    #[test]
    fn test_both_directions() {
        let (mut ap, mut comp) = pair();
        let up = seal(&mut comp, b"status ok").unwrap();
        let down = seal(&mut ap, b"ack").unwrap();
        assert_eq!(open(&mut ap, &up).unwrap(), b"status ok");
        assert_eq!(open(&mut comp, &down).unwrap(), b"ack");
    }

    #[test]
    fn test_oversized_plaintext() {
        let (mut ap, _) = pair();
        let big = vec![0u8; SECURE_DATA_CAPACITY + 1];
        assert!(matches!(
            seal(&mut ap, &big),
            Err(ProtocolError::Length { .. })
        ));
        assert_eq!(ap.send_nonce(), 0);
    }

    #[test]
    fn test_requires_key() {
        let mut ap = Session::new(9, Role::ApplicationProcessor);
        assert!(seal(&mut ap, b"x").is_err());
    }
}
