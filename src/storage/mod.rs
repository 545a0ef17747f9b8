//! Connection Storage Module
//!
//! This module owns the host-side sockets driven by the remote peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ConnectionTable                         │
//! │        Mutex<HashMap<SocketKey, Arc<Connection>>>           │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐                     │
//! │  │ (1, 5)   │ │ (1, 6)   │ │ (1, 9)   │  ...                │
//! │  │ TCP v4   │ │ UDP v6   │ │ TCP v6   │                     │
//! │  └──────────┘ └──────────┘ └──────────┘                     │
//! └─────────────────────────────────────────────────────────────┘
//!        ▲                                   ▲
//!        │ open / connect / close / write    │ read / release on EOF
//!  CommandDispatcher                  ConnectionListener
//! ```
//!
//! ## Features
//!
//! - **Structured keys**: `SocketKey { instance, handle }`, no bit packing
//! - **Short critical sections**: the table lock never spans socket I/O
//! - **Idempotent close**: closing an unknown handle is not an error
//! - **Cancellation**: removal wakes the connection's listener
//!
//! ## Example
//!
//! ```
//! use sockproxy::storage::{AddressFamily, ConnectionTable, InstanceId, SocketKind};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let table = ConnectionTable::new(InstanceId::new(1));
//! let key = table.key(5);
//!
//! table.create(key, SocketKind::Tcp(AddressFamily::V4)).unwrap();
//! assert!(table.contains(key));
//!
//! assert!(table.close(key));
//! assert!(!table.close(key)); // already gone, still fine
//! # }
//! ```

pub mod socket;
pub mod table;

// Re-export commonly used types
pub use socket::{AddressFamily, Connection, HostStream, SocketKind};
pub use table::{
    ConnectionTable, InstanceId, SocketKey, TableError, DEFAULT_CONNECT_TIMEOUT,
};
