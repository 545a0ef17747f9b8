//! Error types for the proxy runtime.
//!
//! Protocol status outcomes (refused, unreachable, ...) are not errors at this
//! level: the dispatcher turns them into acknowledgements. `ProxyError` covers
//! the conditions that abort processing of a single work item or packet.

use crate::ingress::RingError;
use crate::protocol::PacketError;
use std::io;
use thiserror::Error;

/// Result type alias using the proxy's error type.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("proxy instance is shutting down")]
    ShuttingDown,

    #[error("work queue full")]
    QueueFull,

    #[error("ring buffer full: {requested} bytes requested, {available} free")]
    RingFull { requested: usize, available: usize },

    #[error("outbound transport buffer unavailable")]
    BufferUnavailable,

    #[error("packet of {size} bytes exceeds transport maximum of {max}")]
    Oversized { size: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl From<RingError> for ProxyError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::Full {
                requested,
                available,
            } => ProxyError::RingFull {
                requested,
                available,
            },
            RingError::InvalidCapacity(_) => ProxyError::InvalidConfig(err.to_string()),
        }
    }
}
