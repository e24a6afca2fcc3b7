//! TCP bridge for bus transactions.
//!
//! The AP side sends `[seq][target address][request frame]` and reads back
//! `[seq][reply frame]`. The bridge side forwards each request to a local
//! [`Bus`] (usually a [`LoopbackBus`](super::LoopbackBus) of components) and
//! echoes the sequence byte with the reply. Frame boundaries come from the
//! magic byte, see [`crate::core::codec`].
//!
//! A reply that arrives after its exchange timed out is still on the socket
//! when the next exchange reads; its stale sequence byte is how it gets
//! dropped instead of being taken as the next answer.

use super::{Bus, BusAddress};
use crate::core::codec::{BridgeCodec, BridgeReply, BridgeReplyCodec, BridgeRequest};
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, instrument, warn};

const READ_CHUNK: usize = 512;

/// Read from `stream` until `codec` yields an item or the deadline passes.
fn read_item<D>(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    codec: &mut D,
    deadline: Option<Instant>,
) -> Result<Option<D::Item>>
where
    D: Decoder<Error = ProtocolError>,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(item) = codec.decode(buf)? {
            return Ok(Some(item));
        }

        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::BusTimeout);
            }
            stream.set_read_timeout(Some(remaining))?;
        }

        match stream.read(&mut chunk) {
            Ok(0) if buf.is_empty() => return Ok(None),
            Ok(0) => return Err(ProtocolError::Bus(constants::ERR_BUS_CLOSED.into())),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(ProtocolError::BusTimeout)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// AP end of a TCP bus bridge.
pub struct StreamBus {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    next_seq: u8,
    desynced: bool,
}

impl StreamBus {
    #[instrument(skip(addr))]
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        info!(peer = ?stream.peer_addr().ok(), "Connected to bus bridge");
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            next_seq: 0,
            desynced: false,
        })
    }
}

impl Bus for StreamBus {
    #[instrument(skip(self, request), fields(len = request.len()))]
    fn exchange(&mut self, target: BusAddress, request: &[u8], timeout: Duration) -> Result<Bytes> {
        if self.desynced {
            return Err(ProtocolError::Bus(constants::ERR_BRIDGE_DESYNC.into()));
        }
        let deadline = Instant::now() + timeout;
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(1);

        self.write_buf.clear();
        BridgeCodec.encode(
            BridgeRequest {
                seq,
                target,
                frame: Bytes::copy_from_slice(request),
            },
            &mut self.write_buf,
        )?;
        self.stream.write_all(&self.write_buf)?;
        self.stream.flush()?;

        loop {
            let reply = read_item(
                &mut self.stream,
                &mut self.read_buf,
                &mut BridgeReplyCodec,
                Some(deadline),
            );
            match reply {
                Ok(Some(BridgeReply { seq: got, frame })) if got == seq => {
                    debug!(seq, reply_len = frame.len(), "Bridge exchange complete");
                    return Ok(frame);
                }
                Ok(Some(stale)) => {
                    debug!(seq = stale.seq, expected = seq, "Dropping late bridge reply");
                }
                Ok(None) => return Err(ProtocolError::Bus(constants::ERR_BUS_CLOSED.into())),
                Err(ProtocolError::BusTimeout) => {
                    // Partial bytes belong to the late reply; keep them for the next read.
                    warn!(seq, "Bridge exchange timed out");
                    return Err(ProtocolError::BusTimeout);
                }
                Err(e) => {
                    error!(error = %e, "Bridge exchange failed");
                    self.desynced = true;
                    return Err(e);
                }
            }
        }
    }
}

/// Serve bridged requests from one connection until the peer hangs up.
///
/// Transport failures on the local bus are answered with an ERROR frame. A
/// request that cannot be framed ends the connection.
#[instrument(skip(stream, bus), fields(peer = ?stream.peer_addr().ok()))]
pub fn serve_connection<B: Bus>(mut stream: TcpStream, bus: &mut B, timeout: Duration) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut read_buf = BytesMut::with_capacity(READ_CHUNK);
    let mut write_buf = BytesMut::with_capacity(READ_CHUNK);
    let error_frame = Packet::Error.to_bytes()?;

    loop {
        let request = match read_item(&mut stream, &mut read_buf, &mut BridgeCodec, None) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("Bridge peer disconnected");
                return Ok(());
            }
            Err(e) => {
                // Framing is lost once the magic is unreadable.
                warn!(error = %e, "Unreadable bridge request");
                return Err(e);
            }
        };

        let frame = bus
            .exchange(request.target, &request.frame, timeout)
            .unwrap_or_else(|e| {
                warn!(target = %request.target, error = %e, "Local bus exchange failed");
                error_frame.clone()
            });
        write_buf.clear();
        BridgeReplyCodec.encode(
            BridgeReply {
                seq: request.seq,
                frame,
            },
            &mut write_buf,
        )?;
        stream.write_all(&write_buf)?;
    }
}

/// Accept bridge connections one at a time and serve each to completion.
pub fn serve<B: Bus>(listener: &TcpListener, bus: &mut B, timeout: Duration) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Bus bridge listening");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = serve_connection(stream, bus, timeout) {
                    warn!(error = %e, "Bridge connection ended with error");
                }
            }
            Err(e) => error!(error = %e, "Failed to accept bridge connection"),
        }
    }
    Ok(())
}
