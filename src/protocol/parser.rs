//! Packet Parser
//!
//! Turns the raw bytes of one delivered message into a [`Packet`].
//!
//! The transport delivers whole messages, so parsing is all-or-nothing: the
//! declared `payload_len` plus the header size must equal the number of bytes
//! delivered. Anything else is malformed and must be dropped without side
//! effects, because not even the message id can be trusted.
//!
//! [`peek_header`] is the incremental counterpart used by stream transports that
//! need to find message boundaries in a byte stream.

use crate::protocol::types::{
    family, AckStatus, Body, ConnectStatus, ConnectTarget, Header, OpenRequest, OpenStatus,
    Opcode, Packet, HEADER_SIZE,
};
use bytes::{Buf, Bytes};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use thiserror::Error;

/// Errors that can occur while parsing or encoding packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than the header requires
    #[error("truncated packet: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// Declared payload length disagrees with the delivered byte count
    #[error("length mismatch: header declares {declared} bytes, {actual} delivered")]
    LengthMismatch { declared: usize, actual: usize },

    /// Opcode byte outside the protocol
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// Status byte outside the acknowledged opcode's status space
    #[error("unknown {opcode} status: {status:#04x}")]
    UnknownStatus { opcode: Opcode, status: u8 },

    /// Payload shape does not match the opcode
    #[error("invalid {opcode} payload: {reason}")]
    InvalidPayload { opcode: Opcode, reason: String },

    /// Payload too large to describe in the header
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Result type for packet operations.
pub type PacketResult<T> = Result<T, PacketError>;

/// Decodes the common header at the start of `buf`.
///
/// Returns `Ok(None)` when fewer than [`HEADER_SIZE`] bytes are available.
pub fn peek_header(buf: &[u8]) -> PacketResult<Option<Header>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut cursor = buf;
    let raw_opcode = cursor.get_u8();
    let opcode = Opcode::from_u8(raw_opcode).ok_or(PacketError::UnknownOpcode(raw_opcode))?;

    Ok(Some(Header {
        opcode,
        msg_id: cursor.get_u16(),
        sock_id: cursor.get_u16(),
        payload_len: cursor.get_u16(),
    }))
}

/// Parses exactly one packet occupying all of `buf`.
pub fn parse_packet(buf: &[u8]) -> PacketResult<Packet> {
    let header = peek_header(buf)?.ok_or(PacketError::Truncated {
        needed: HEADER_SIZE,
        actual: buf.len(),
    })?;

    let header_size = header.opcode.header_size();
    if buf.len() < header_size {
        return Err(PacketError::Truncated {
            needed: header_size,
            actual: buf.len(),
        });
    }

    let declared = header.frame_len();
    if declared != buf.len() {
        return Err(PacketError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }

    let body = parse_body(header.opcode, &buf[HEADER_SIZE..])?;
    Ok(Packet::new(header.msg_id, header.sock_id, body))
}

/// Decodes the bytes following the common header.
fn parse_body(opcode: Opcode, mut rest: &[u8]) -> PacketResult<Body> {
    match opcode {
        Opcode::Open => {
            expect_len(opcode, rest, OpenRequest::LEN)?;
            Ok(Body::Open(OpenRequest {
                family: rest.get_u8(),
                socket_type: rest.get_u8(),
                protocol: rest.get_u8(),
                handle: rest.get_u16(),
            }))
        }
        Opcode::Connect => parse_connect(rest).map(Body::Connect),
        Opcode::Close => {
            expect_len(opcode, rest, 0)?;
            Ok(Body::Close)
        }
        Opcode::Shutdown => {
            expect_len(opcode, rest, 1)?;
            Ok(Body::Shutdown { how: rest.get_u8() })
        }
        Opcode::Transmit => Ok(Body::Transmit(Bytes::copy_from_slice(rest))),
        Opcode::Ack => {
            let orig_opcode = parse_orig_opcode(&mut rest)?;
            let status = parse_ack_status(orig_opcode, rest)?;
            Ok(Body::Ack {
                orig_opcode,
                status,
            })
        }
        Opcode::AckData => {
            let orig_opcode = parse_orig_opcode(&mut rest)?;
            Ok(Body::AckData {
                orig_opcode,
                data: Bytes::copy_from_slice(rest),
            })
        }
    }
}

fn parse_connect(mut rest: &[u8]) -> PacketResult<ConnectTarget> {
    if rest.len() < 3 {
        return Err(invalid(Opcode::Connect, "missing family or port"));
    }
    let fam = rest.get_u8();
    let port = rest.get_u16();

    match fam {
        family::IP => {
            expect_len(Opcode::Connect, rest, 4)?;
            let ip = Ipv4Addr::from(rest.get_u32());
            Ok(ConnectTarget::V4(SocketAddrV4::new(ip, port)))
        }
        family::IP6 => {
            expect_len(Opcode::Connect, rest, 24)?;
            let ip = Ipv6Addr::from(rest.get_u128());
            let flowinfo = rest.get_u32();
            let scope_id = rest.get_u32();
            Ok(ConnectTarget::V6(SocketAddrV6::new(ip, port, flowinfo, scope_id)))
        }
        other => Ok(ConnectTarget::Unsupported {
            family: other,
            port,
            address: Bytes::copy_from_slice(rest),
        }),
    }
}

fn parse_orig_opcode(rest: &mut &[u8]) -> PacketResult<Opcode> {
    // The header size check in parse_packet guarantees this byte exists.
    let raw = rest.get_u8();
    Opcode::from_u8(raw).ok_or(PacketError::UnknownOpcode(raw))
}

fn parse_ack_status(orig_opcode: Opcode, rest: &[u8]) -> PacketResult<AckStatus> {
    match (orig_opcode, rest) {
        (_, []) => Ok(AckStatus::None),
        (Opcode::Open, [code]) => OpenStatus::from_u8(*code)
            .map(AckStatus::Open)
            .ok_or(PacketError::UnknownStatus {
                opcode: Opcode::Open,
                status: *code,
            }),
        (Opcode::Connect, [code]) => ConnectStatus::from_u8(*code)
            .map(AckStatus::Connect)
            .ok_or(PacketError::UnknownStatus {
                opcode: Opcode::Connect,
                status: *code,
            }),
        (other, _) => Err(invalid(
            Opcode::Ack,
            format!("unexpected {}-byte status for {}", rest.len(), other),
        )),
    }
}

fn expect_len(opcode: Opcode, rest: &[u8], len: usize) -> PacketResult<()> {
    if rest.len() == len {
        Ok(())
    } else {
        Err(invalid(
            opcode,
            format!("expected {} bytes, got {}", len, rest.len()),
        ))
    }
}

fn invalid(opcode: Opcode, reason: impl Into<String>) -> PacketError {
    PacketError::InvalidPayload {
        opcode,
        reason: reason.into(),
    }
}
