//! Transport Boundary
//!
//! The proxy never talks to the peer directly. Inbound messages arrive through
//! [`Ingress`](crate::ingress::Ingress); outbound packets leave through a
//! [`Transport`] implementation supplied at attach time.
//!
//! ```text
//!           ┌──────────────┐  on_command_received / on_bulk_received
//!  peer ───>│  transport   │────────────────────────────────────────> Ingress
//!       <───│   driver     │<──── send(bytes) ──── Outbound <──── dispatcher,
//!           └──────────────┘                                       listeners
//! ```
//!
//! [`Outbound`] is the single outbound path shared by the command worker, the
//! bulk worker and every connection listener. It enforces the transport's
//! message size limit, encodes into a transport-provided buffer, and stamps
//! proxy-originated packets with fresh message ids.

pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

use crate::connection::ProxyStats;
use crate::error::{ProxyError, Result};
use crate::protocol::{Packet, HEADER_SIZE, MAX_PAYLOAD};
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::trace;

pub use stream::{serve_peer, PeerError, StreamTransport};

/// The outbound half of the message transport.
///
/// Implementations must not block for long: `send` is called from worker and
/// listener tasks.
pub trait Transport: Send + Sync + 'static {
    /// Largest single message the transport can deliver, header included.
    fn max_message_size(&self) -> usize;

    /// Provides a buffer to encode one outbound message into, or `None` if the
    /// transport has no buffer available right now.
    fn acquire_outbound_buffer(&self) -> Option<BytesMut>;

    /// Sends one complete message, returning the number of bytes accepted.
    fn send(&self, message: Bytes) -> io::Result<usize>;
}

/// Shared outbound path for one proxy instance.
#[derive(Clone)]
pub struct Outbound {
    transport: Arc<dyn Transport>,
    stats: Arc<ProxyStats>,
    next_msg_id: Arc<AtomicU16>,
}

impl Outbound {
    pub fn new(transport: Arc<dyn Transport>, stats: Arc<ProxyStats>) -> Self {
        Self {
            transport,
            stats,
            next_msg_id: Arc::new(AtomicU16::new(0)),
        }
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    pub fn max_message_size(&self) -> usize {
        self.transport.max_message_size()
    }

    /// Largest TRANSMIT payload that still fits in one transport message.
    pub fn max_payload(&self) -> usize {
        self.max_message_size()
            .saturating_sub(HEADER_SIZE)
            .min(MAX_PAYLOAD)
    }

    /// Message id for a packet the proxy originates (TRANSMIT, CLOSE).
    pub fn next_msg_id(&self) -> u16 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Encodes `packet` into a transport buffer and sends it.
    pub fn send(&self, packet: &Packet) -> Result<usize> {
        let result = self.try_send(packet);
        match &result {
            Ok(_) => self.stats.packet_sent(packet.opcode()),
            Err(_) => self.stats.outbound_failed(),
        }
        result
    }

    fn try_send(&self, packet: &Packet) -> Result<usize> {
        let size = packet.encoded_len();
        let max = self.max_message_size();
        if size > max {
            return Err(ProxyError::Oversized { size, max });
        }

        let mut buf = self
            .transport
            .acquire_outbound_buffer()
            .ok_or(ProxyError::BufferUnavailable)?;
        buf.clear();
        packet.encode_into(&mut buf)?;

        let sent = self.transport.send(buf.freeze())?;
        trace!(%packet, bytes = sent, "Sent packet");
        Ok(sent)
    }
}
