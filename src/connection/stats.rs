//! Per-instance statistics.

use crate::protocol::Opcode;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the ingress workers, the dispatcher and every listener.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Command queue items processed
    pub commands_processed: AtomicU64,
    /// Bulk queue items processed
    pub bulk_processed: AtomicU64,
    /// Packets dropped because they failed validation
    pub malformed_dropped: AtomicU64,
    /// Inbound messages dropped because a queue or the ring was full
    pub ingress_dropped: AtomicU64,
    /// Outbound packets that could not be delivered
    pub outbound_failed: AtomicU64,
    /// Acknowledgements handed to the transport
    pub acks_sent: AtomicU64,
    /// TRANSMIT packets handed to the transport
    pub transmits_sent: AtomicU64,
    /// CLOSE packets handed to the transport
    pub closes_sent: AtomicU64,
    /// Bytes written to host sockets
    pub bytes_to_host: AtomicU64,
    /// Bytes read from host sockets
    pub bytes_from_host: AtomicU64,
    /// Currently running connection listeners
    pub active_listeners: AtomicU64,
}

/// A point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub commands_processed: u64,
    pub bulk_processed: u64,
    pub malformed_dropped: u64,
    pub ingress_dropped: u64,
    pub outbound_failed: u64,
    pub acks_sent: u64,
    pub transmits_sent: u64,
    pub closes_sent: u64,
    pub bytes_to_host: u64,
    pub bytes_from_host: u64,
    pub active_listeners: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bulk_processed(&self) {
        self.bulk_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ingress_dropped(&self) {
        self.ingress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbound_failed(&self) {
        self.outbound_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self, opcode: Opcode) {
        let counter = match opcode {
            Opcode::Ack | Opcode::AckData => &self.acks_sent,
            Opcode::Transmit => &self.transmits_sent,
            Opcode::Close => &self.closes_sent,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_to_host(&self, count: usize) {
        self.bytes_to_host.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_from_host(&self, count: usize) {
        self.bytes_from_host
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn listener_started(&self) {
        self.active_listeners.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_stopped(&self) {
        self.active_listeners.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            bulk_processed: self.bulk_processed.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            ingress_dropped: self.ingress_dropped.load(Ordering::Relaxed),
            outbound_failed: self.outbound_failed.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            transmits_sent: self.transmits_sent.load(Ordering::Relaxed),
            closes_sent: self.closes_sent.load(Ordering::Relaxed),
            bytes_to_host: self.bytes_to_host.load(Ordering::Relaxed),
            bytes_from_host: self.bytes_from_host.load(Ordering::Relaxed),
            active_listeners: self.active_listeners.load(Ordering::Relaxed),
        }
    }
}
