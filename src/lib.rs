//! # SockProxy - A Packet-Driven Socket Proxy
//!
//! SockProxy lets a remote peer that has no network stack of its own use the
//! host's TCP and UDP sockets. The peer speaks a small packet protocol over a
//! message transport; the proxy opens, connects, writes and closes host sockets
//! on its behalf and streams whatever the host sockets receive back to it.
//!
//! ## Features
//!
//! - **Compact Protocol**: 7-byte header, seven opcodes, big-endian fields
//! - **TCP and UDP**: IPv4 and IPv6 destinations
//! - **Non-Blocking Intake**: bounded queues and a lock-free ring for bulk data
//! - **Async I/O**: one Tokio task per connected socket
//! - **Multiple Peers**: independent instances keyed by an explicit id
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ProxyInstance                                 │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Transport  │───>│   Ingress   │───>│  Command    │                  │
//! │  │  (peer)     │    │ queues+ring │    │  Dispatcher │                  │
//! │  └──────▲──────┘    └─────────────┘    └──────┬──────┘                  │
//! │         │                                     │                         │
//! │         │                                     ▼                         │
//! │  ┌──────┴──────┐    ┌──────────────────────────────────────────────┐   │
//! │  │  Outbound   │    │              ConnectionTable                 │   │
//! │  │  (acks,     │    │   (instance, handle) ──> host socket         │   │
//! │  │   data)     │    └──────────────────────────────────────────────┘   │
//! │  └──────▲──────┘                          │                             │
//! │         │                                 ▼                             │
//! │         │           ┌─────────────────────────────────────────────────┐ │
//! │         └───────────│       ConnectionListener (one per socket)       │ │
//! │                     │           (Background Tokio Task)               │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use sockproxy::proxy::ProxyConfig;
//! use sockproxy::storage::InstanceId;
//! use sockproxy::transport::serve_peer;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:7878").await.unwrap();
//!     let mut next_id = 0u16;
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await.unwrap();
//!         next_id = next_id.wrapping_add(1);
//!         let config = ProxyConfig::for_instance(InstanceId::new(next_id));
//!
//!         tokio::spawn(serve_peer(stream, addr, config, 16 * 1024));
//!     }
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `OPEN family type protocol handle` - create a host socket
//! - `CONNECT handle address` - connect it and start forwarding host data
//! - `TRANSMIT handle data` - write to the socket (not acknowledged)
//! - `CLOSE handle` - release the socket (always acknowledged)
//!
//! The proxy sends `ACK` for OPEN, CONNECT and CLOSE, `TRANSMIT` for data read
//! from host sockets, and `CLOSE` when a host socket hangs up.
//!
//! ## Module Overview
//!
//! - [`protocol`]: Packet types, encoding and validating parser
//! - [`storage`]: Connection table and host socket wrappers
//! - [`commands`]: Command dispatcher
//! - [`connection`]: Per-socket listeners and statistics
//! - [`ingress`]: Intake queues, byte ring and workers
//! - [`transport`]: Transport trait, outbound path and the TCP stream transport
//! - [`proxy`]: Instance lifecycle and configuration
//!
//! ## Design Highlights
//!
//! ### One Lock
//!
//! The connection table is the only lock-protected state, and it is never held
//! across a host socket operation. Reads, writes and connects work on an
//! `Arc<Connection>` taken out of the table.
//!
//! ### Cancellation
//!
//! Every connection carries a `watch` signal that fires when it is removed from
//! the table. Its listener races each read against that signal, so a peer CLOSE
//! or a teardown stops the listener promptly and silently. Host writes race it
//! too, so a CLOSE also abandons a write the host is not draining.

pub mod commands;
pub mod connection;
pub mod error;
pub mod ingress;
pub mod protocol;
pub mod proxy;
pub mod storage;
pub mod transport;

// Re-export commonly used types for convenience
pub use commands::CommandDispatcher;
pub use connection::{ProxyStats, StatsSnapshot};
pub use error::{ProxyError, Result};
pub use ingress::Ingress;
pub use protocol::{parse_packet, Packet, PacketError};
pub use proxy::{ProxyConfig, ProxyInstance};
pub use storage::{ConnectionTable, InstanceId};
pub use transport::{serve_peer, StreamTransport, Transport};

/// The default port SockProxy listens on for peers
pub const DEFAULT_PORT: u16 = 7878;

/// The default host SockProxy binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default largest message exchanged with a peer (16 KB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Version of SockProxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
