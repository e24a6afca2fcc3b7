//! Stream framing for bus packets.
//!
//! Packets carry no length field: the magic byte implies the frame size. These
//! codecs cut frames out of a byte stream (a bus bridge or a test harness) using
//! the `tokio_util::codec` traits, driven synchronously over a `BytesMut`.
//!
//! - [`FrameCodec`] yields raw frames without validating them
//! - [`PacketCodec`] yields validated [`Packet`]s
//! - [`BridgeCodec`] prefixes each request with a sequence byte and the
//!   target bus address
//! - [`BridgeReplyCodec`] prefixes each reply with the sequence byte it answers

use crate::core::packet::{Magic, Packet};
use crate::error::{ProtocolError, Result};
use crate::transport::BusAddress;
use crate::utils::checksum::Crc32;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Length of the frame starting at `src[0]`, if the magic is known.
fn frame_len(src: &BytesMut) -> Result<Option<usize>> {
    match src.first() {
        None => Ok(None),
        Some(&byte) => Ok(Some(Magic::try_from(byte)?.frame_len())),
    }
}

/// Cuts raw frames; validation is left to the receiver.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let Some(len) = frame_len(src)? else {
            return Ok(None);
        };
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

/// Frames and validates packets with the CRC-32 engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match FrameCodec.decode(src)? {
            Some(frame) => Packet::from_bytes_with(&frame, &Crc32).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(packet.frame_len());
        dst.extend_from_slice(&packet.to_bytes_with(&Crc32)?);
        Ok(())
    }
}

/// Request frame on a bus bridge: sequence, target address, raw packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRequest {
    pub seq: u8,
    pub target: BusAddress,
    pub frame: Bytes,
}

/// Reply frame on a bus bridge, tagged with the request's sequence byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReply {
    pub seq: u8,
    pub frame: Bytes,
}

/// Split `prefix` bytes plus one packet frame off `src`, if all of it is there.
fn prefixed_frame(src: &mut BytesMut, prefix: usize) -> Result<Option<(BytesMut, Bytes)>> {
    let Some(&magic) = src.get(prefix) else {
        return Ok(None);
    };
    let len = Magic::try_from(magic)?.frame_len();
    if src.len() < prefix + len {
        src.reserve(prefix + len - src.len());
        return Ok(None);
    }
    let head = src.split_to(prefix);
    Ok(Some((head, src.split_to(len).freeze())))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeCodec;

impl Decoder for BridgeCodec {
    type Item = BridgeRequest;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BridgeRequest>> {
        let Some((mut head, frame)) = prefixed_frame(src, 2)? else {
            return Ok(None);
        };
        let seq = head.get_u8();
        let target = BusAddress::new(head.get_u8());
        Ok(Some(BridgeRequest { seq, target, frame }))
    }
}

impl Encoder<BridgeRequest> for BridgeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, request: BridgeRequest, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(2 + request.frame.len());
        dst.put_u8(request.seq);
        dst.put_u8(request.target.value());
        dst.extend_from_slice(&request.frame);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeReplyCodec;

impl Decoder for BridgeReplyCodec {
    type Item = BridgeReply;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BridgeReply>> {
        let Some((mut head, frame)) = prefixed_frame(src, 1)? else {
            return Ok(None);
        };
        Ok(Some(BridgeReply {
            seq: head.get_u8(),
            frame,
        }))
    }
}

impl Encoder<BridgeReply> for BridgeReplyCodec {
    type Error = ProtocolError;

    fn encode(&mut self, reply: BridgeReply, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(1 + reply.frame.len());
        dst.put_u8(reply.seq);
        dst.extend_from_slice(&reply.frame);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frames_wait_for_more() {
        let bytes = Packet::ListAck {
            component_id: 0xdead_beef,
        }
        .to_bytes()
        .unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..3]);
        assert!(PacketCodec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[3..]);
        assert_eq!(
            PacketCodec.decode(&mut buf).unwrap(),
            Some(Packet::ListAck {
                component_id: 0xdead_beef
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        PacketCodec.encode(Packet::List, &mut buf).unwrap();
        PacketCodec.encode(Packet::Error, &mut buf).unwrap();
        assert_eq!(PacketCodec.decode(&mut buf).unwrap(), Some(Packet::List));
        assert_eq!(PacketCodec.decode(&mut buf).unwrap(), Some(Packet::Error));
        assert_eq!(PacketCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_magic_is_framing_error() {
        let mut buf = BytesMut::from(&[0x42u8, 0, 0, 0, 0][..]);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(ProtocolError::UnknownMagic(0x42))
        ));
    }

    #[test]
    fn test_bridge_roundtrip() {
        let request = BridgeRequest {
            seq: 7,
            target: BusAddress::new(0x24),
            frame: Packet::List.to_bytes().unwrap(),
        };
        let mut buf = BytesMut::new();
        BridgeCodec.encode(request.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..2], &[7, 0x24]);
        assert_eq!(BridgeCodec.decode(&mut buf).unwrap(), Some(request));
    }

    #[test]
    fn test_bridge_replies_split_by_sequence() {
        let mut buf = BytesMut::new();
        for (seq, id) in [(1u8, 0x10u32), (2, 0x20)] {
            let frame = Packet::ListAck { component_id: id }.to_bytes().unwrap();
            BridgeReplyCodec
                .encode(BridgeReply { seq, frame }, &mut buf)
                .unwrap();
        }
        let first = BridgeReplyCodec.decode(&mut buf).unwrap().unwrap();
        let second = BridgeReplyCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(
            Packet::from_bytes(&second.frame).unwrap(),
            Packet::ListAck { component_id: 0x20 }
        );
        assert!(BridgeReplyCodec.decode(&mut buf).unwrap().is_none());
    }
}
