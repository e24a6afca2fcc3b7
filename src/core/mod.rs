//! # Core Protocol Components
//!
//! Packet layout, integrity checking, and stream framing.
//!
//! ## Components
//! - **Packet**: tagged union over every packet kind, fixed-size encode/decode
//! - **Codec**: `tokio_util` codecs for framing packets over byte streams
//!
//! ## Wire Format
//! ```text
//! [Magic(1)] [Checksum(4, LE)] [Payload(fixed per magic)]
//! ```
//!
//! ## Security
//! - Magic validated before any payload byte is read
//! - CRC-32 over magic and payload checked before fields are interpreted
//! - Every length field bounded by its fixed capacity

pub mod codec;
pub mod packet;
