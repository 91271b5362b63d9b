//! Transport primitives.
//!
//! Goals:
//! - Provide a reliable (TCP) and unreliable (UDP) channel addressed by peer.
//! - Keep transport framing separate from protocol payloads: frames carry a
//!   lane tag naming which protocol call the payload belongs to, nothing more.
//! - Keep serialization explicit and versionable.
//!
//! The connection preamble (`Hello`/`Welcome`/`UdpHello`) is how a client
//! learns the peer id the transport assigned to it and how the server learns
//! where to aim datagrams. It carries no protocol authority; authentication
//! happens above, in the session handshake and envelope tokens.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};

use crate::codec::take;

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame; anything larger is a framing error.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Identifies a connected peer. Assigned by the transport; the server's own
/// id is carried in configuration, not assumed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PeerId(pub i32);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Names which protocol call a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lane {
    /// Session token delivery, server -> client, reliable.
    Handshake = 0,
    /// Authenticated call envelopes, reliable.
    Rpc = 1,
    /// State snapshots, unreliable, loss-tolerant.
    Replication = 2,
}

impl Lane {
    pub fn from_u8(v: u8) -> Option<Lane> {
        match v {
            0 => Some(Lane::Handshake),
            1 => Some(Lane::Rpc),
            2 => Some(Lane::Replication),
            _ => None,
        }
    }

    /// Whether frames on this lane ride the ordered reliable channel.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Lane::Replication)
    }
}

/// Transport-level message envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client announces itself and its protocol version.
    Hello { protocol: u32 },
    /// Server assigns the client its peer id.
    Welcome { peer_id: PeerId },
    /// Client announces its UDP port for the unreliable channel.
    UdpHello { port: u16 },
    /// A protocol payload tagged with its lane.
    Call { lane: Lane, payload: Bytes },
}

const FRAME_HELLO: u8 = 0;
const FRAME_WELCOME: u8 = 1;
const FRAME_UDP_HELLO: u8 = 2;
const FRAME_CALL: u8 = 3;

impl Frame {
    pub fn call(lane: Lane, payload: impl Into<Bytes>) -> Frame {
        Frame::Call {
            lane,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Frame::Hello { protocol } => {
                buf.put_u8(FRAME_HELLO);
                buf.put_u32_le(*protocol);
            }
            Frame::Welcome { peer_id } => {
                buf.put_u8(FRAME_WELCOME);
                buf.put_i32_le(peer_id.0);
            }
            Frame::UdpHello { port } => {
                buf.put_u8(FRAME_UDP_HELLO);
                buf.put_u16_le(*port);
            }
            Frame::Call { lane, payload } => {
                buf.put_u8(FRAME_CALL);
                buf.put_u8(*lane as u8);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, TransportError> {
        let mut input = bytes;
        let kind = take(&mut input, 1)
            .map_err(|_| TransportError::MalformedFrame("empty frame"))?[0];
        let frame = match kind {
            FRAME_HELLO => Frame::Hello {
                protocol: read_u32(&mut input)?,
            },
            FRAME_WELCOME => Frame::Welcome {
                peer_id: PeerId(read_u32(&mut input)? as i32),
            },
            FRAME_UDP_HELLO => {
                let mut raw = take(&mut input, 2)
                    .map_err(|_| TransportError::MalformedFrame("short udp hello"))?;
                Frame::UdpHello {
                    port: raw.get_u16_le(),
                }
            }
            FRAME_CALL => {
                let lane = take(&mut input, 1)
                    .map_err(|_| TransportError::MalformedFrame("missing lane"))?[0];
                let lane =
                    Lane::from_u8(lane).ok_or(TransportError::MalformedFrame("unknown lane"))?;
                let payload = Bytes::copy_from_slice(input);
                input = &[];
                Frame::Call { lane, payload }
            }
            _ => return Err(TransportError::MalformedFrame("unknown frame kind")),
        };
        if !input.is_empty() {
            return Err(TransportError::MalformedFrame("trailing bytes"));
        }
        Ok(frame)
    }
}

fn read_u32(input: &mut &[u8]) -> Result<u32, TransportError> {
    let mut raw =
        take(input, 4).map_err(|_| TransportError::MalformedFrame("short integer field"))?;
    Ok(raw.get_u32_le())
}

/// An inbound protocol payload, tagged with the peer that sent it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender: PeerId,
    pub lane: Lane,
    pub payload: Bytes,
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    ProtocolMismatch { ours: u32, theirs: u32 },
    #[error("peer channel closed")]
    ChannelClosed,
}

/// Writes one length-prefixed frame to a reliable stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), TransportError> {
    let payload = frame.encode();
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.extend_from_slice(&payload);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Reads one length-prefixed frame from a reliable stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, TransportError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Frame::decode(&payload)
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        write_frame(&mut self.stream, frame).await
    }

    pub async fn recv(&mut self) -> Result<Frame, TransportError> {
        read_frame(&mut self.stream).await
    }

    /// Splits into independently owned read/write halves so reading and
    /// writing can run on separate tasks.
    pub fn into_split(
        self,
    ) -> (
        tokio::net::tcp::OwnedReadHalf,
        tokio::net::tcp::OwnedWriteHalf,
    ) {
        self.stream.into_split()
    }
}

/// Unreliable channel over UDP, connected to a single peer.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;
        Ok(Self { socket })
    }

    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.socket.send(&frame.encode()).await?;
        Ok(())
    }

    pub async fn recv(&self) -> Result<Frame, TransportError> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.socket.recv(&mut buf).await?;
        Frame::decode(&buf[..n])
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Option<Frame>, TransportError> {
        let mut buf = vec![0u8; 64 * 1024];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => Ok(Some(Frame::decode(&buf[..n])?)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> Result<(ReliableConn, SocketAddr), TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

/// Outbound half of a peer's transport as the protocol components see it:
/// addressed sends of already-encoded payloads, plus the current peer set.
///
/// The server's hub implements this over its connection table; the client's
/// implementation knows only the server. Test doubles record sends.
pub trait PeerSender {
    /// Queues a payload for delivery to one peer on the given lane.
    fn send(&mut self, peer: PeerId, lane: Lane, payload: &[u8]) -> Result<(), TransportError>;

    /// Peers currently reachable from this endpoint, in stable order.
    fn peers(&self) -> Vec<PeerId>;
}
