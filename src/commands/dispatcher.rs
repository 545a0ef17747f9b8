//! Command Dispatcher
//!
//! Translates one parsed packet into host socket effects and, where the protocol
//! asks for one, an acknowledgement.
//!
//! ## Supported Commands
//!
//! - `OPEN` - create a host socket under the peer-proposed handle
//! - `CONNECT` - connect it (IPv4 or IPv6) and start its listener
//! - `CLOSE` - release it; always acknowledged
//! - `TRANSMIT` - write the payload to the socket; never acknowledged
//!
//! `SHUTDOWN`, `ACK` and `ACKDATA` have no host-side action and are ignored.
//!
//! ## Status Mapping
//!
//! ```text
//! TableError            OPEN ack            CONNECT ack
//! ──────────────────────────────────────────────────────────
//! (ok)                  Success             Success
//! AlreadyExists         AlreadyExists       Error
//! InvalidArgument       InvalidArgument     Error
//! ConnectionRefused     Error               ConnectionRefused
//! NetworkUnreachable    Error               NetworkUnreachable
//! TimedOut              Error               TimedOut
//! NotFound / other      Error               Error
//! ```
//!
//! A CONNECT to an unsupported family, or to a family other than the one the
//! socket was opened with, is acknowledged with `Error`.

use crate::connection::{ConnectionListener, ListenerSet};
use crate::protocol::{
    family, ip_proto, socket_type, AckStatus, Body, ConnectStatus, ConnectTarget, Header,
    OpenRequest, OpenStatus, Packet,
};
use crate::storage::{AddressFamily, ConnectionTable, SocketKind, TableError};
use crate::transport::Outbound;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Bookkeeping record for an inbound TRANSMIT. Not sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitReceipt {
    pub handle: u16,
    pub written: usize,
}

/// Executes peer commands against one instance's connection table.
#[derive(Clone)]
pub struct CommandDispatcher {
    table: Arc<ConnectionTable>,
    outbound: Outbound,
    listeners: Arc<ListenerSet>,
}

impl CommandDispatcher {
    pub fn new(
        table: Arc<ConnectionTable>,
        outbound: Outbound,
        listeners: Arc<ListenerSet>,
    ) -> Self {
        Self {
            table,
            outbound,
            listeners,
        }
    }

    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Executes a command and returns the acknowledgement to send, if any.
    pub async fn dispatch(&self, packet: Packet) -> Option<Packet> {
        let header = packet.header();
        trace!(instance = %self.table.instance(), %packet, "Dispatching");

        match packet.body {
            Body::Open(request) => Some(self.open(&header, request)),
            Body::Connect(target) => Some(self.connect(&header, target).await),
            Body::Close => Some(self.close(&header)),
            Body::Transmit(data) => {
                match self.transmit(header.sock_id, data).await {
                    Ok(receipt) => trace!(?receipt, "Transmit complete"),
                    Err(e) => debug!(handle = header.sock_id, error = %e, "Transmit failed"),
                }
                None
            }
            Body::Shutdown { .. } | Body::Ack { .. } | Body::AckData { .. } => {
                trace!(opcode = %header.opcode, "Ignoring command with no host-side action");
                None
            }
        }
    }

    /// OPEN: create a socket under the handle the peer proposed.
    fn open(&self, header: &Header, request: OpenRequest) -> Packet {
        let status = match socket_kind(&request) {
            None => OpenStatus::InvalidArgument,
            Some(kind) => match self.table.create(self.table.key(request.handle), kind) {
                Ok(_) => OpenStatus::Success,
                Err(TableError::AlreadyExists) => OpenStatus::AlreadyExists,
                Err(TableError::InvalidArgument) => OpenStatus::InvalidArgument,
                Err(e) => {
                    warn!(handle = request.handle, error = %e, "Failed to open host socket");
                    OpenStatus::Error
                }
            },
        };

        Packet::ack(header, AckStatus::Open(status)).with_sock_id(request.handle)
    }

    /// CONNECT: connect the socket and start its listener.
    async fn connect(&self, header: &Header, target: ConnectTarget) -> Packet {
        let key = self.table.key(header.sock_id);

        let status = match target.socket_addr() {
            None => ConnectStatus::Error,
            Some(addr) => match self.table.connect(key, addr).await {
                Ok(connection) => {
                    debug!(socket = %key, %addr, "Connected");
                    self.listeners.spawn(ConnectionListener::new(
                        connection,
                        Arc::clone(&self.table),
                        self.outbound.clone(),
                    ));
                    ConnectStatus::Success
                }
                Err(e) => {
                    debug!(socket = %key, %addr, error = %e, "Connect failed");
                    connect_status(&e)
                }
            },
        };

        Packet::ack(header, AckStatus::Connect(status))
    }

    /// CLOSE: release the socket. Unknown handles are acknowledged all the same.
    fn close(&self, header: &Header) -> Packet {
        let key = self.table.key(header.sock_id);
        if !self.table.close(key) {
            trace!(socket = %key, "Close for unknown socket");
        }
        Packet::ack(header, AckStatus::None)
    }

    /// TRANSMIT (peer to host): write `data` to the socket under `handle`.
    pub async fn transmit(&self, handle: u16, data: Bytes) -> Result<TransmitReceipt, TableError> {
        let written = self.table.write(self.table.key(handle), &data).await?;
        self.outbound.stats().bytes_to_host(written);
        Ok(TransmitReceipt { handle, written })
    }
}

/// Maps protocol enumerations to a host socket kind.
fn socket_kind(request: &OpenRequest) -> Option<SocketKind> {
    let family = match request.family {
        family::IP => AddressFamily::V4,
        family::IP6 => AddressFamily::V6,
        _ => return None,
    };

    match (request.socket_type, request.protocol) {
        (socket_type::STREAM, ip_proto::TCP) => Some(SocketKind::Tcp(family)),
        (socket_type::DGRAM, ip_proto::UDP) => Some(SocketKind::Udp(family)),
        _ => None,
    }
}

fn connect_status(err: &TableError) -> ConnectStatus {
    match err {
        TableError::ConnectionRefused => ConnectStatus::ConnectionRefused,
        TableError::NetworkUnreachable => ConnectStatus::NetworkUnreachable,
        TableError::TimedOut => ConnectStatus::TimedOut,
        TableError::InvalidArgument
        | TableError::AlreadyExists
        | TableError::NotFound
        | TableError::AlreadyConnected
        | TableError::Io(_) => ConnectStatus::Error,
    }
}
