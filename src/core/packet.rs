//! Bus packet layout.
//!
//! Every packet is a 5-byte header followed by a fixed-size payload whose shape
//! is selected by the magic byte:
//!
//! ```text
//! [magic(1)] [checksum(4, LE)] [payload(N)]
//! ```
//!
//! The checksum covers `magic || payload`, padding included. Decoding validates
//! the magic first, then the checksum, and only then reads payload fields.
//! Packets are fixed-size per kind; the largest (SECURE) is [`MAX_PACKET_LEN`].
//!
//! This is wire version 2 (full 32-bit checksum). The older packed header with
//! a 24-bit checksum is a different protocol version and is not accepted here.

use crate::error::{ProtocolError, Result};
use crate::utils::checksum::{ChecksumEngine, Crc32};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire layout version spoken by this crate
pub const WIRE_VERSION: u8 = 2;

/// magic (1) + checksum (4)
pub const HEADER_LEN: usize = 5;

pub const SIG_LEN: usize = 64;
pub const HASH_LEN: usize = 32;
pub const HMAC_LEN: usize = 32;
pub const KEX_MATERIAL_LEN: usize = 32;
pub const COMPONENT_ID_LEN: usize = 4;

pub const ATTEST_CHALLENGE_CAPACITY: usize = 7;
pub const ATTEST_EVIDENCE_CAPACITY: usize = 192;
pub const BOOT_CHALLENGE_CAPACITY: usize = 32;
pub const BOOT_MESSAGE_CAPACITY: usize = 64;
pub const REPLACE_CHALLENGE_LEN: usize = 32;
pub const SECURE_DATA_CAPACITY: usize = 255;

/// Marker carried inside every SECURE payload
pub const SECURE_INNER_MAGIC: u8 = 0xDD;

/// Largest frame on the bus (SECURE)
pub const MAX_PACKET_LEN: usize = HEADER_LEN + Magic::Secure.payload_len();

/// Encoded ERROR packet: magic 0x00 and CRC-32 of that single byte
pub const ERROR_FRAME: [u8; HEADER_LEN] = [0x00, 0x8D, 0xEF, 0x02, 0xD2];

/// Packet kind discriminant as it appears on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Magic {
    Error = 0x00,
    Kex = 0x4B,
    List = 0x4C,
    ListAck = 0x4D,
    AttestCommand = 0xAA,
    BootCommand = 0xBB,
    ReplaceCommand = 0xCC,
    Secure = 0xEE,
    AttestAck = 0xFA,
    BootAck = 0xFB,
    ReplaceAck = 0xFC,
}

impl Magic {
    /// Fixed payload size in bytes for this packet kind.
    pub const fn payload_len(self) -> usize {
        match self {
            Magic::Error => 0,
            Magic::Kex => 1 + KEX_MATERIAL_LEN + HASH_LEN,
            Magic::List => 1,
            Magic::ListAck => 1 + COMPONENT_ID_LEN,
            Magic::AttestCommand => 1 + ATTEST_CHALLENGE_CAPACITY + SIG_LEN,
            Magic::AttestAck => 1 + ATTEST_EVIDENCE_CAPACITY + SIG_LEN,
            Magic::BootCommand => 1 + BOOT_CHALLENGE_CAPACITY + SIG_LEN,
            Magic::BootAck => 1 + BOOT_MESSAGE_CAPACITY + SIG_LEN,
            Magic::ReplaceCommand => 1 + REPLACE_CHALLENGE_LEN,
            Magic::ReplaceAck => 1 + COMPONENT_ID_LEN + SIG_LEN,
            Magic::Secure => 1 + 1 + 4 + SECURE_DATA_CAPACITY + HMAC_LEN,
        }
    }

    /// Header plus payload.
    pub const fn frame_len(self) -> usize {
        HEADER_LEN + self.payload_len()
    }
}

impl TryFrom<u8> for Magic {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x00 => Magic::Error,
            0x4B => Magic::Kex,
            0x4C => Magic::List,
            0x4D => Magic::ListAck,
            0xAA => Magic::AttestCommand,
            0xBB => Magic::BootCommand,
            0xCC => Magic::ReplaceCommand,
            0xEE => Magic::Secure,
            0xFA => Magic::AttestAck,
            0xFB => Magic::BootAck,
            0xFC => Magic::ReplaceAck,
            other => return Err(ProtocolError::UnknownMagic(other)),
        })
    }
}

/// Fixed-capacity byte field with a one-byte length prefix.
///
/// Only the first `len` bytes are meaningful; the rest is zero padding and is
/// never exposed.
#[derive(Clone, Copy)]
pub struct BoundedBytes<const N: usize> {
    len: u8,
    buf: [u8; N],
}

impl<const N: usize> BoundedBytes<N> {
    /// Copy `data` into a new field, rejecting anything longer than `N`.
    pub fn new(data: &[u8]) -> Result<Self> {
        if data.len() > N || data.len() > u8::MAX as usize {
            return Err(ProtocolError::Length {
                declared: data.len(),
                capacity: N,
            });
        }
        let mut buf = [0u8; N];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            len: data.len() as u8,
            buf,
        })
    }

    pub fn empty() -> Self {
        Self {
            len: 0,
            buf: [0u8; N],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity() -> usize {
        N
    }

    /// Encoded size: length byte plus full capacity.
    pub const fn wire_len() -> usize {
        1 + N
    }

    fn write_to(&self, out: &mut [u8]) {
        out[0] = self.len;
        out[1..1 + N].copy_from_slice(&self.buf);
    }

    fn read_from(src: &[u8]) -> Result<Self> {
        Self::read_split(src[0], &src[1..1 + N])
    }

    /// Build from a length byte and its backing array, ignoring the padding.
    fn read_split(len: u8, body: &[u8]) -> Result<Self> {
        let declared = len as usize;
        if declared > N {
            return Err(ProtocolError::Length {
                declared,
                capacity: N,
            });
        }
        Self::new(&body[..declared])
    }
}

impl<const N: usize> PartialEq for BoundedBytes<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<const N: usize> Eq for BoundedBytes<N> {}

impl<const N: usize> fmt::Debug for BoundedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoundedBytes<{N}>({})", hex::encode(self.as_slice()))
    }
}

/// Key-exchange contribution and its SHA-256 commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KexPayload {
    pub material: BoundedBytes<KEX_MATERIAL_LEN>,
    pub hash: [u8; HASH_LEN],
}

/// Data plus a detached Ed25519 signature; shared by every signed kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedPayload<const N: usize> {
    pub data: BoundedBytes<N>,
    pub sig: [u8; SIG_LEN],
}

impl<const N: usize> SignedPayload<N> {
    pub fn new(data: &[u8], sig: [u8; SIG_LEN]) -> Result<Self> {
        Ok(Self {
            data: BoundedBytes::new(data)?,
            sig,
        })
    }

    fn write_to(&self, out: &mut [u8]) {
        self.data.write_to(out);
        let at = BoundedBytes::<N>::wire_len();
        out[at..at + SIG_LEN].copy_from_slice(&self.sig);
    }

    fn read_from(src: &[u8]) -> Result<Self> {
        let data = BoundedBytes::<N>::read_from(src)?;
        let at = BoundedBytes::<N>::wire_len();
        let mut sig = [0u8; SIG_LEN];
        sig.copy_from_slice(&src[at..at + SIG_LEN]);
        Ok(Self { data, sig })
    }
}

pub type AttestCommandPayload = SignedPayload<ATTEST_CHALLENGE_CAPACITY>;
pub type AttestAckPayload = SignedPayload<ATTEST_EVIDENCE_CAPACITY>;
pub type BootCommandPayload = SignedPayload<BOOT_CHALLENGE_CAPACITY>;
pub type BootAckPayload = SignedPayload<BOOT_MESSAGE_CAPACITY>;
/// Incoming component id (little-endian) signed together with the challenge.
pub type ReplaceAckPayload = SignedPayload<COMPONENT_ID_LEN>;

/// Authenticated, encrypted record for post-handshake traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecurePayload {
    pub nonce: u32,
    pub data: BoundedBytes<SECURE_DATA_CAPACITY>,
    pub hmac: [u8; HMAC_LEN],
}

/// Every packet kind on the bus, tagged by its magic byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Packet {
    Error,
    Kex(KexPayload),
    List,
    ListAck { component_id: u32 },
    AttestCommand(AttestCommandPayload),
    AttestAck(AttestAckPayload),
    BootCommand(BootCommandPayload),
    BootAck(BootAckPayload),
    ReplaceCommand(BoundedBytes<REPLACE_CHALLENGE_LEN>),
    ReplaceAck(ReplaceAckPayload),
    Secure(SecurePayload),
}

impl Packet {
    pub fn magic(&self) -> Magic {
        match self {
            Packet::Error => Magic::Error,
            Packet::Kex(_) => Magic::Kex,
            Packet::List => Magic::List,
            Packet::ListAck { .. } => Magic::ListAck,
            Packet::AttestCommand(_) => Magic::AttestCommand,
            Packet::AttestAck(_) => Magic::AttestAck,
            Packet::BootCommand(_) => Magic::BootCommand,
            Packet::BootAck(_) => Magic::BootAck,
            Packet::ReplaceCommand(_) => Magic::ReplaceCommand,
            Packet::ReplaceAck(_) => Magic::ReplaceAck,
            Packet::Secure(_) => Magic::Secure,
        }
    }

    /// Size of this packet on the wire.
    pub fn frame_len(&self) -> usize {
        self.magic().frame_len()
    }

    /// Encode with the default CRC-32 engine.
    pub fn to_bytes(&self) -> Result<Bytes> {
        self.to_bytes_with(&Crc32)
    }

    pub fn to_bytes_with(&self, engine: &dyn ChecksumEngine) -> Result<Bytes> {
        let mut frame = [0u8; MAX_PACKET_LEN];
        let len = self.encode_into(&mut frame, engine)?;
        Ok(Bytes::copy_from_slice(&frame[..len]))
    }

    /// Write the full frame into `out` and return the number of bytes used.
    pub fn encode_into(&self, out: &mut [u8], engine: &dyn ChecksumEngine) -> Result<usize> {
        let magic = self.magic();
        let frame_len = magic.frame_len();
        if out.len() < frame_len {
            return Err(ProtocolError::Truncated {
                needed: frame_len,
                got: out.len(),
            });
        }

        let frame = &mut out[..frame_len];
        frame.fill(0);
        frame[0] = magic as u8;
        self.write_payload(&mut frame[HEADER_LEN..]);

        let checksum = engine.checksum(magic as u8, &frame[HEADER_LEN..])?;
        frame[1..HEADER_LEN].copy_from_slice(&checksum.to_le_bytes());
        Ok(frame_len)
    }

    /// Decode with the default CRC-32 engine.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Self::from_bytes_with(buf, &Crc32)
    }

    /// Validate and decode one frame.
    ///
    /// Bytes after the frame are ignored; bus transfers use fixed-size buffers.
    pub fn from_bytes_with(buf: &[u8], engine: &dyn ChecksumEngine) -> Result<Self> {
        let first = *buf.first().ok_or(ProtocolError::Truncated {
            needed: HEADER_LEN,
            got: 0,
        })?;
        let magic = Magic::try_from(first)?;

        let frame_len = magic.frame_len();
        if buf.len() < frame_len {
            return Err(ProtocolError::Truncated {
                needed: frame_len,
                got: buf.len(),
            });
        }

        let mut received = [0u8; 4];
        received.copy_from_slice(&buf[1..HEADER_LEN]);
        let received = u32::from_le_bytes(received);
        let body = &buf[HEADER_LEN..frame_len];
        let computed = engine.checksum(first, body)?;
        if received != computed {
            return Err(ProtocolError::Checksum { received, computed });
        }

        Self::read_payload(magic, body)
    }

    fn write_payload(&self, out: &mut [u8]) {
        match self {
            Packet::Error => {}
            Packet::List => out[0] = 0,
            Packet::ListAck { component_id } => {
                out[0] = COMPONENT_ID_LEN as u8;
                out[1..1 + COMPONENT_ID_LEN].copy_from_slice(&component_id.to_le_bytes());
            }
            Packet::Kex(kex) => {
                kex.material.write_to(out);
                let at = BoundedBytes::<KEX_MATERIAL_LEN>::wire_len();
                out[at..at + HASH_LEN].copy_from_slice(&kex.hash);
            }
            Packet::AttestCommand(p) => p.write_to(out),
            Packet::AttestAck(p) => p.write_to(out),
            Packet::BootCommand(p) => p.write_to(out),
            Packet::BootAck(p) => p.write_to(out),
            Packet::ReplaceCommand(challenge) => challenge.write_to(out),
            Packet::ReplaceAck(p) => p.write_to(out),
            Packet::Secure(secure) => {
                out[0] = SECURE_INNER_MAGIC;
                out[1] = secure.data.len() as u8;
                out[2..6].copy_from_slice(&secure.nonce.to_le_bytes());
                out[6..6 + SECURE_DATA_CAPACITY].copy_from_slice(&secure.data.buf);
                let at = 6 + SECURE_DATA_CAPACITY;
                out[at..at + HMAC_LEN].copy_from_slice(&secure.hmac);
            }
        }
    }

    fn read_payload(magic: Magic, body: &[u8]) -> Result<Self> {
        Ok(match magic {
            Magic::Error => Packet::Error,
            Magic::List => {
                if body[0] != 0 {
                    return Err(ProtocolError::Length {
                        declared: body[0] as usize,
                        capacity: 0,
                    });
                }
                Packet::List
            }
            Magic::ListAck => {
                let declared = body[0] as usize;
                if declared > COMPONENT_ID_LEN {
                    return Err(ProtocolError::Length {
                        declared,
                        capacity: COMPONENT_ID_LEN,
                    });
                }
                if declared != COMPONENT_ID_LEN {
                    return Err(ProtocolError::MalformedPayload(format!(
                        "component id is {declared} bytes"
                    )));
                }
                let mut id = [0u8; COMPONENT_ID_LEN];
                id.copy_from_slice(&body[1..1 + COMPONENT_ID_LEN]);
                Packet::ListAck {
                    component_id: u32::from_le_bytes(id),
                }
            }
            Magic::Kex => {
                let material = BoundedBytes::read_from(body)?;
                let at = BoundedBytes::<KEX_MATERIAL_LEN>::wire_len();
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(&body[at..at + HASH_LEN]);
                Packet::Kex(KexPayload { material, hash })
            }
            Magic::AttestCommand => Packet::AttestCommand(SignedPayload::read_from(body)?),
            Magic::AttestAck => Packet::AttestAck(SignedPayload::read_from(body)?),
            Magic::BootCommand => Packet::BootCommand(SignedPayload::read_from(body)?),
            Magic::BootAck => Packet::BootAck(SignedPayload::read_from(body)?),
            Magic::ReplaceCommand => Packet::ReplaceCommand(BoundedBytes::read_from(body)?),
            Magic::ReplaceAck => Packet::ReplaceAck(SignedPayload::read_from(body)?),
            Magic::Secure => {
                if body[0] != SECURE_INNER_MAGIC {
                    return Err(ProtocolError::MalformedPayload(format!(
                        "secure record marker {:#04x}",
                        body[0]
                    )));
                }
                let mut nonce = [0u8; 4];
                nonce.copy_from_slice(&body[2..6]);
                let data = BoundedBytes::read_split(body[1], &body[6..6 + SECURE_DATA_CAPACITY])?;
                let at = 6 + SECURE_DATA_CAPACITY;
                let mut hmac = [0u8; HMAC_LEN];
                hmac.copy_from_slice(&body[at..at + HMAC_LEN]);
                Packet::Secure(SecurePayload {
                    nonce: u32::from_le_bytes(nonce),
                    data,
                    hmac,
                })
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet::Error,
            Packet::List,
            Packet::ListAck {
                component_id: 0x1122_3344,
            },
            Packet::Kex(KexPayload {
                material: BoundedBytes::new(&[7u8; 32]).unwrap(),
                hash: [9u8; 32],
            }),
            Packet::AttestCommand(SignedPayload::new(&[1, 2, 3, 4, 5, 6, 7], [3u8; 64]).unwrap()),
            Packet::AttestAck(SignedPayload::new(&[0x55; 192], [4u8; 64]).unwrap()),
            Packet::BootCommand(SignedPayload::new(&[0x66; 32], [5u8; 64]).unwrap()),
            Packet::BootAck(SignedPayload::new(b"component ready", [6u8; 64]).unwrap()),
            Packet::ReplaceCommand(BoundedBytes::new(&[0x77; 32]).unwrap()),
            Packet::ReplaceAck(SignedPayload::new(&0x1111_1130u32.to_le_bytes(), [7u8; 64]).unwrap()),
            Packet::Secure(SecurePayload {
                nonce: 42,
                data: BoundedBytes::new(b"ciphertext").unwrap(),
                hmac: [8u8; 32],
            }),
        ]
    }

    #[test]
    fn test_frame_sizes() {
        assert_eq!(Magic::Secure.frame_len(), 298);
        assert_eq!(MAX_PACKET_LEN, 298);
        assert_eq!(Magic::Kex.payload_len(), 65);
        assert_eq!(Magic::AttestAck.payload_len(), 257);
        assert_eq!(Magic::Error.frame_len(), HEADER_LEN);
        for packet in sample_packets() {
            assert!(packet.frame_len() <= MAX_PACKET_LEN);
            assert_eq!(packet.to_bytes().unwrap().len(), packet.frame_len());
        }
    }

    #[test]
    fn test_roundtrip_every_kind() {
        for packet in sample_packets() {
            let bytes = packet.to_bytes().unwrap();
            assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn test_checksum_covers_magic() {
        // A checksum computed over the payload alone must not validate.
        let bytes = Packet::BootCommand(SignedPayload::new(&[1u8; 32], [2u8; 64]).unwrap())
            .to_bytes()
            .unwrap();
        let mut forged = bytes.to_vec();
        let payload_only = crc32fast::hash(&forged[HEADER_LEN..]);
        forged[1..HEADER_LEN].copy_from_slice(&payload_only.to_le_bytes());
        assert!(matches!(
            Packet::from_bytes(&forged),
            Err(ProtocolError::Checksum { .. })
        ));
    }

    #[test]
    fn test_checksum_is_little_endian_crc() {
        let bytes = Packet::Error.to_bytes().unwrap();
        let expected = crc32fast::hash(&[0x00]);
        assert_eq!(&bytes[1..5], &expected.to_le_bytes());
    }

    #[test]
    fn test_unknown_magic_rejected_before_parsing() {
        let mut buf = [0u8; MAX_PACKET_LEN];
        buf[0] = 0x13;
        assert!(matches!(
            Packet::from_bytes(&buf),
            Err(ProtocolError::UnknownMagic(0x13))
        ));
    }

    #[test]
    fn test_truncated_frames() {
        assert!(matches!(
            Packet::from_bytes(&[]),
            Err(ProtocolError::Truncated { got: 0, .. })
        ));
        let bytes = Packet::List.to_bytes().unwrap();
        assert!(matches!(
            Packet::from_bytes(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut buf = [0xA5u8; MAX_PACKET_LEN];
        let len = Packet::List.encode_into(&mut buf, &Crc32).unwrap();
        assert_eq!(len, Magic::List.frame_len());
        assert_eq!(Packet::from_bytes(&buf).unwrap(), Packet::List);
    }

    #[test]
    fn test_oversized_length_rejected() {
        // Hostile length with a valid checksum still fails the capacity check.
        let mut frame = vec![0u8; Magic::AttestCommand.frame_len()];
        frame[0] = Magic::AttestCommand as u8;
        frame[HEADER_LEN] = 8;
        let crc = Crc32.checksum(frame[0], &frame[HEADER_LEN..]).unwrap();
        frame[1..5].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            Packet::from_bytes(&frame),
            Err(ProtocolError::Length {
                declared: 8,
                capacity: 7
            })
        ));
    }

    #[test]
    fn test_padding_not_interpreted() {
        let packet = Packet::BootAck(SignedPayload::new(b"ok", [1u8; 64]).unwrap());
        let mut frame = packet.to_bytes().unwrap().to_vec();
        // Scribble in the padding and re-seal the checksum.
        frame[HEADER_LEN + 10] = 0xFF;
        let crc = Crc32.checksum(frame[0], &frame[HEADER_LEN..]).unwrap();
        frame[1..5].copy_from_slice(&crc.to_le_bytes());
        match Packet::from_bytes(&frame).unwrap() {
            Packet::BootAck(ack) => assert_eq!(ack.data.as_slice(), b"ok"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_secure_marker_checked() {
        let packet = Packet::Secure(SecurePayload {
            nonce: 1,
            data: BoundedBytes::empty(),
            hmac: [0u8; 32],
        });
        let mut frame = packet.to_bytes().unwrap().to_vec();
        frame[HEADER_LEN] = 0x00;
        let crc = Crc32.checksum(frame[0], &frame[HEADER_LEN..]).unwrap();
        frame[1..5].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            Packet::from_bytes(&frame),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_bounded_bytes_capacity() {
        assert!(BoundedBytes::<7>::new(&[0u8; 7]).is_ok());
        assert!(matches!(
            BoundedBytes::<7>::new(&[0u8; 8]),
            Err(ProtocolError::Length {
                declared: 8,
                capacity: 7
            })
        ));
        assert_eq!(BoundedBytes::<255>::capacity(), 255);
    }

    #[test]
    fn test_error_frame_constant() {
        assert_eq!(&Packet::Error.to_bytes().unwrap()[..], &ERROR_FRAME);
        assert_eq!(Packet::from_bytes(&ERROR_FRAME).unwrap(), Packet::Error);
    }
}
