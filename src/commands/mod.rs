//! Command Dispatch Module
//!
//! This module implements the command processing layer of the proxy.
//! It receives parsed packets, executes them against the connection table,
//! and returns the acknowledgement the peer expects.
//!
//! ## Architecture
//!
//! ```text
//! Peer Command
//!       │
//!       ▼
//! ┌──────────────────┐
//! │  Packet Parser   │  (protocol module)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ CommandDispatcher│  (this module)
//! │                  │
//! │  - Translate     │
//! │  - Execute       │
//! │  - Acknowledge   │
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ ConnectionTable  │  (storage module)
//! └──────────────────┘
//! ```

pub mod dispatcher;

// Re-export the dispatcher
pub use dispatcher::{CommandDispatcher, TransmitReceipt};
