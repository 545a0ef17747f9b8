//! Proxy Packet Protocol
//!
//! This module implements the packet format spoken between the remote peer and
//! the proxy.
//!
//! ## Overview
//!
//! Every message is a small packet with a fixed header (opcode, message id,
//! socket id, payload length) followed by an opcode-specific payload. The peer
//! sends OPEN / CONNECT / CLOSE / TRANSMIT commands; the proxy answers with ACKs
//! and pushes TRANSMIT / CLOSE packets of its own when host sockets produce data
//! or hang up.
//!
//! ## Modules
//!
//! - `types`: Defines `Packet`, `Body`, status codes and encoding
//! - `parser`: Validating parser for delivered messages
//!
//! ## Example
//!
//! ```
//! use sockproxy::protocol::{parse_packet, AckStatus, OpenStatus, Packet};
//!
//! let close = Packet::close(1, 5);
//! let bytes = close.encode().unwrap();
//! let parsed = parse_packet(&bytes).unwrap();
//!
//! let ack = Packet::ack(&parsed.header(), AckStatus::None);
//! assert_eq!(ack.header().payload_len, 0);
//! # let _ = OpenStatus::Success;
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{parse_packet, peek_header, PacketError, PacketResult};
pub use types::{
    family, ip_proto, shutdown_how, socket_type, AckStatus, Body, ConnectStatus, ConnectTarget,
    Header, OpenRequest, OpenStatus, Opcode, Packet, ACK_HEADER_SIZE, HEADER_SIZE, MAX_PAYLOAD,
};
