//! Packet Data Types
//!
//! This module defines the packets exchanged between the remote peer and the proxy.
//! Every packet starts with the same fixed header, followed by an opcode-specific
//! payload.
//!
//! ## Wire Format
//!
//! All multi-byte fields are big-endian (network byte order).
//!
//! ```text
//! ┌────────┬──────────┬──────────┬─────────────┬──────────────────────┐
//! │ opcode │  msg_id  │ sock_id  │ payload_len │ payload ...          │
//! │   u8   │   u16    │   u16    │    u16      │ payload_len bytes    │
//! └────────┴──────────┴──────────┴─────────────┴──────────────────────┘
//! ```
//!
//! Acknowledgements (`ACK`, `ACKDATA`) carry one extra header byte right after the
//! common header: the opcode of the packet being acknowledged. `payload_len` never
//! counts that byte, so an ACK for a CLOSE is 8 bytes long with `payload_len == 0`.
//!
//! ## Payloads
//!
//! - `OPEN`: `family:u8 type:u8 protocol:u8 handle:u16`
//! - `CONNECT`: `family:u8 port:u16` then `addr[4]` (IPv4) or
//!   `addr[16] flow:u32 scope:u32` (IPv6)
//! - `CLOSE`: empty
//! - `SHUTDOWN`: `how:u8`
//! - `TRANSMIT`: raw bytes
//! - `ACK`: one status byte for OPEN/CONNECT, nothing for CLOSE
//! - `ACKDATA`: raw bytes

use crate::protocol::parser::PacketError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

/// Size of the common packet header in bytes.
pub const HEADER_SIZE: usize = 7;

/// Size of an acknowledgement header (common header + original opcode).
pub const ACK_HEADER_SIZE: usize = HEADER_SIZE + 1;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Address family values used in OPEN and CONNECT payloads.
pub mod family {
    pub const IP: u8 = 1;
    pub const IP6: u8 = 2;
}

/// Socket type values used in OPEN payloads.
pub mod socket_type {
    pub const STREAM: u8 = 1;
    pub const DGRAM: u8 = 2;
}

/// Transport protocol values used in OPEN payloads.
pub mod ip_proto {
    pub const TCP: u8 = 1;
    pub const UDP: u8 = 2;
}

/// Shutdown directions carried by SHUTDOWN payloads.
pub mod shutdown_how {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const BOTH: u8 = 2;
}

/// Packet opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Open = 1,
    Connect = 2,
    Close = 3,
    Shutdown = 4,
    Transmit = 5,
    Ack = 6,
    AckData = 7,
}

impl Opcode {
    /// Decodes an opcode byte, returning `None` for values outside the protocol.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Opcode::Open),
            2 => Some(Opcode::Connect),
            3 => Some(Opcode::Close),
            4 => Some(Opcode::Shutdown),
            5 => Some(Opcode::Transmit),
            6 => Some(Opcode::Ack),
            7 => Some(Opcode::AckData),
            _ => None,
        }
    }

    /// The wire value of this opcode.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Number of header bytes that precede the payload for this opcode.
    #[inline]
    pub fn header_size(self) -> usize {
        match self {
            Opcode::Ack | Opcode::AckData => ACK_HEADER_SIZE,
            _ => HEADER_SIZE,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Open => "OPEN",
            Opcode::Connect => "CONNECT",
            Opcode::Close => "CLOSE",
            Opcode::Shutdown => "SHUTDOWN",
            Opcode::Transmit => "TRANSMIT",
            Opcode::Ack => "ACK",
            Opcode::AckData => "ACKDATA",
        };
        f.write_str(name)
    }
}

/// The fixed header shared by every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: Opcode,
    pub msg_id: u16,
    pub sock_id: u16,
    pub payload_len: u16,
}

impl Header {
    /// Total number of bytes of the packet this header describes.
    #[inline]
    pub fn frame_len(&self) -> usize {
        self.opcode.header_size() + usize::from(self.payload_len)
    }
}

/// Status codes reported in OPEN acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenStatus {
    Success = 0,
    AlreadyExists = 1,
    InvalidArgument = 2,
    Error = 3,
}

impl OpenStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpenStatus::Success),
            1 => Some(OpenStatus::AlreadyExists),
            2 => Some(OpenStatus::InvalidArgument),
            3 => Some(OpenStatus::Error),
            _ => None,
        }
    }
}

/// Status codes reported in CONNECT acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectStatus {
    Success = 0,
    Error = 1,
    ConnectionRefused = 2,
    NetworkUnreachable = 3,
    TimedOut = 4,
}

impl ConnectStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnectStatus::Success),
            1 => Some(ConnectStatus::Error),
            2 => Some(ConnectStatus::ConnectionRefused),
            3 => Some(ConnectStatus::NetworkUnreachable),
            4 => Some(ConnectStatus::TimedOut),
            _ => None,
        }
    }
}

/// The status carried by an acknowledgement.
///
/// Each acknowledged opcode has its own status space; CLOSE acks carry none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    None,
    Open(OpenStatus),
    Connect(ConnectStatus),
}

impl AckStatus {
    /// The status byte written on the wire, if any.
    pub fn code(&self) -> Option<u8> {
        match self {
            AckStatus::None => None,
            AckStatus::Open(status) => Some(*status as u8),
            AckStatus::Connect(status) => Some(*status as u8),
        }
    }

    /// Returns true for a status that reports success (or carries no status).
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            AckStatus::None
                | AckStatus::Open(OpenStatus::Success)
                | AckStatus::Connect(ConnectStatus::Success)
        )
    }
}

/// OPEN payload. Enumerations are kept raw so that unsupported values can be
/// acknowledged with `InvalidArgument` instead of being dropped as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRequest {
    pub family: u8,
    pub socket_type: u8,
    pub protocol: u8,
    /// Handle proposed by the peer for the new socket.
    pub handle: u16,
}

impl OpenRequest {
    pub const LEN: usize = 5;
}

/// CONNECT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    V4(SocketAddrV4),
    /// IPv6 destination, including flow label and scope id.
    V6(SocketAddrV6),
    /// A family the proxy does not understand; the address bytes are kept opaque.
    Unsupported { family: u8, port: u16, address: Bytes },
}

impl ConnectTarget {
    pub const V4_LEN: usize = 1 + 2 + 4;
    pub const V6_LEN: usize = 1 + 2 + 16 + 4 + 4;

    /// The host socket address to connect to, if the family is supported.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            ConnectTarget::V4(addr) => Some(SocketAddr::V4(*addr)),
            ConnectTarget::V6(addr) => Some(SocketAddr::V6(*addr)),
            ConnectTarget::Unsupported { .. } => None,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            ConnectTarget::V4(_) => Self::V4_LEN,
            ConnectTarget::V6(_) => Self::V6_LEN,
            ConnectTarget::Unsupported { address, .. } => 3 + address.len(),
        }
    }
}

impl From<SocketAddr> for ConnectTarget {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => ConnectTarget::V4(v4),
            SocketAddr::V6(v6) => ConnectTarget::V6(v6),
        }
    }
}

/// Opcode-specific packet contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Open(OpenRequest),
    Connect(ConnectTarget),
    Close,
    Shutdown { how: u8 },
    Transmit(Bytes),
    Ack { orig_opcode: Opcode, status: AckStatus },
    AckData { orig_opcode: Opcode, data: Bytes },
}

impl Body {
    pub fn opcode(&self) -> Opcode {
        match self {
            Body::Open(_) => Opcode::Open,
            Body::Connect(_) => Opcode::Connect,
            Body::Close => Opcode::Close,
            Body::Shutdown { .. } => Opcode::Shutdown,
            Body::Transmit(_) => Opcode::Transmit,
            Body::Ack { .. } => Opcode::Ack,
            Body::AckData { .. } => Opcode::AckData,
        }
    }

    /// Payload length as counted by the header's `payload_len` field.
    pub fn payload_len(&self) -> usize {
        match self {
            Body::Open(_) => OpenRequest::LEN,
            Body::Connect(target) => target.encoded_len(),
            Body::Close => 0,
            Body::Shutdown { .. } => 1,
            Body::Transmit(data) => data.len(),
            Body::Ack { status, .. } => usize::from(status.code().is_some()),
            Body::AckData { data, .. } => data.len(),
        }
    }
}

/// A complete protocol packet.
///
/// The header's opcode and payload length are derived from the body, so a
/// `Packet` can never disagree with itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub msg_id: u16,
    pub sock_id: u16,
    pub body: Body,
}

impl Packet {
    pub fn new(msg_id: u16, sock_id: u16, body: Body) -> Self {
        Self {
            msg_id,
            sock_id,
            body,
        }
    }

    /// Creates an OPEN request. The socket id in the header mirrors the handle.
    pub fn open(msg_id: u16, request: OpenRequest) -> Self {
        Packet::new(msg_id, request.handle, Body::Open(request))
    }

    /// Creates a CONNECT request.
    pub fn connect(msg_id: u16, sock_id: u16, target: impl Into<ConnectTarget>) -> Self {
        Packet::new(msg_id, sock_id, Body::Connect(target.into()))
    }

    /// Creates a TRANSMIT packet wrapping `data` verbatim.
    pub fn transmit(msg_id: u16, sock_id: u16, data: impl Into<Bytes>) -> Self {
        Packet::new(msg_id, sock_id, Body::Transmit(data.into()))
    }

    /// Creates a header-only CLOSE packet.
    pub fn close(msg_id: u16, sock_id: u16) -> Self {
        Packet::new(msg_id, sock_id, Body::Close)
    }

    /// Builds the acknowledgement for `original`.
    ///
    /// The ack echoes the original opcode, message id and socket id.
    pub fn ack(original: &Header, status: AckStatus) -> Self {
        Packet::new(
            original.msg_id,
            original.sock_id,
            Body::Ack {
                orig_opcode: original.opcode,
                status,
            },
        )
    }

    /// Replaces the socket id, e.g. to report the handle an OPEN created.
    pub fn with_sock_id(mut self, sock_id: u16) -> Self {
        self.sock_id = sock_id;
        self
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.body.opcode()
    }

    /// The header this packet is encoded with.
    ///
    /// A payload too large for the 16-bit length field saturates here;
    /// [`Packet::encode_into`] rejects such packets.
    pub fn header(&self) -> Header {
        Header {
            opcode: self.opcode(),
            msg_id: self.msg_id,
            sock_id: self.sock_id,
            payload_len: u16::try_from(self.body.payload_len()).unwrap_or(u16::MAX),
        }
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        self.opcode().header_size() + self.body.payload_len()
    }

    /// Encodes the packet into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Appends the wire representation of the packet to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        let payload_len = self.body.payload_len();
        if payload_len > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD,
            });
        }

        let header = self.header();
        buf.reserve(self.encoded_len());
        buf.put_u8(header.opcode.as_u8());
        buf.put_u16(header.msg_id);
        buf.put_u16(header.sock_id);
        buf.put_u16(header.payload_len);

        match &self.body {
            Body::Open(request) => {
                buf.put_u8(request.family);
                buf.put_u8(request.socket_type);
                buf.put_u8(request.protocol);
                buf.put_u16(request.handle);
            }
            Body::Connect(ConnectTarget::V4(addr)) => {
                buf.put_u8(family::IP);
                buf.put_u16(addr.port());
                buf.put_slice(&addr.ip().octets());
            }
            Body::Connect(ConnectTarget::V6(addr)) => {
                buf.put_u8(family::IP6);
                buf.put_u16(addr.port());
                buf.put_slice(&addr.ip().octets());
                buf.put_u32(addr.flowinfo());
                buf.put_u32(addr.scope_id());
            }
            Body::Connect(ConnectTarget::Unsupported {
                family,
                port,
                address,
            }) => {
                buf.put_u8(*family);
                buf.put_u16(*port);
                buf.put_slice(address);
            }
            Body::Close => {}
            Body::Shutdown { how } => buf.put_u8(*how),
            Body::Transmit(data) => buf.put_slice(data),
            Body::Ack {
                orig_opcode,
                status,
            } => {
                buf.put_u8(orig_opcode.as_u8());
                if let Some(code) = status.code() {
                    buf.put_u8(code);
                }
            }
            Body::AckData { orig_opcode, data } => {
                buf.put_u8(orig_opcode.as_u8());
                buf.put_slice(data);
            }
        }

        Ok(())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} msg={} sock={}",
            self.opcode(),
            self.msg_id,
            self.sock_id
        )?;
        match &self.body {
            Body::Open(request) => write!(
                f,
                " family={} type={} proto={} handle={}",
                request.family, request.socket_type, request.protocol, request.handle
            ),
            Body::Connect(target) => match target.socket_addr() {
                Some(addr) => write!(f, " addr={}", addr),
                None => write!(f, " addr=(unsupported family)"),
            },
            Body::Close => Ok(()),
            Body::Shutdown { how } => write!(f, " how={}", how),
            Body::Transmit(data) => write!(f, " ({} bytes)", data.len()),
            Body::Ack {
                orig_opcode,
                status,
            } => match status.code() {
                Some(code) => write!(f, " for={} status={}", orig_opcode, code),
                None => write!(f, " for={}", orig_opcode),
            },
            Body::AckData { orig_opcode, data } => {
                write!(f, " for={} ({} bytes)", orig_opcode, data.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_close_encodes_header_only() {
        let bytes = Packet::close(9, 5).encode().unwrap();
        assert_eq!(&bytes[..], &[3, 0, 9, 0, 5, 0, 0]);
    }

    #[test]
    fn test_open_encode() {
        let packet = Packet::open(
            0x0102,
            OpenRequest {
                family: family::IP,
                socket_type: socket_type::STREAM,
                protocol: ip_proto::TCP,
                handle: 5,
            },
        );
        let bytes = packet.encode().unwrap();
        assert_eq!(&bytes[..], &[1, 1, 2, 0, 5, 0, 5, 1, 1, 1, 0, 5]);
    }

    #[test]
    fn test_connect_v4_encode() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 80);
        let bytes = Packet::connect(1, 5, ConnectTarget::V4(addr)).encode().unwrap();
        assert_eq!(
            &bytes[..],
            &[2, 0, 1, 0, 5, 0, 7, family::IP, 0, 80, 127, 0, 0, 1]
        );
    }

    #[test]
    fn test_connect_v6_payload_len() {
        let addr = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 7, 3);
        let packet = Packet::connect(1, 2, ConnectTarget::V6(addr));
        assert_eq!(packet.header().payload_len, 27);
        assert_eq!(packet.encoded_len(), HEADER_SIZE + 27);
    }

    #[test]
    fn test_open_ack_carries_status_and_original_opcode() {
        let original = Header {
            opcode: Opcode::Open,
            msg_id: 42,
            sock_id: 0,
            payload_len: 5,
        };
        let ack = Packet::ack(&original, AckStatus::Open(OpenStatus::AlreadyExists));
        let bytes = ack.encode().unwrap();
        assert_eq!(&bytes[..], &[6, 0, 42, 0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_close_ack_has_no_status() {
        let original = Header {
            opcode: Opcode::Close,
            msg_id: 3,
            sock_id: 8,
            payload_len: 0,
        };
        let ack = Packet::ack(&original, AckStatus::None);
        assert_eq!(ack.header().payload_len, 0);
        assert_eq!(ack.encode().unwrap().len(), ACK_HEADER_SIZE);
    }

    #[test]
    fn test_oversized_transmit_rejected() {
        let packet = Packet::transmit(0, 1, vec![0u8; MAX_PAYLOAD + 1]);
        assert!(matches!(
            packet.encode(),
            Err(PacketError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_display() {
        let packet = Packet::transmit(4, 5, Bytes::from_static(b"hello"));
        assert_eq!(packet.to_string(), "TRANSMIT msg=4 sock=5 (5 bytes)");
    }
}
