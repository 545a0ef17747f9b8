//! Connection Listener Module
//!
//! This module pumps data from connected host sockets back to the peer.
//! Each connected logical socket is served by its own async task, so a slow or
//! idle socket never holds up any other.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  CommandDispatcher                          │
//! │                  (CONNECT succeeded)                        │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ spawn into ListenerSet
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionListener                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ Read socket │───>│ Build       │───>│ Outbound    │     │
//! │  │ (or cancel) │    │ TRANSMIT    │    │ send        │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │         │                                                   │
//! │         └── EOF / error ──> release socket, send CLOSE      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Async I/O**: listeners park on socket readiness, not threads
//! - **Prompt cancellation**: closing the socket wakes its listener
//! - **Exactly one CLOSE**: only the listener that removes the socket reports it
//! - **Statistics**: shared counters for traffic and live listeners

pub mod listener;
pub mod stats;

// Re-export commonly used types
pub use listener::{ConnectionListener, ListenerExit, ListenerSet};
pub use stats::{ProxyStats, StatsSnapshot};
