//! Connection Listener
//!
//! Every connected logical socket gets its own listener task. The listener
//! blocks on host socket reads and forwards whatever arrives to the peer as
//! TRANSMIT packets. When the host side hangs up it removes the socket from the
//! table and tells the peer with a single CLOSE.
//!
//! ## Listener Lifecycle
//!
//! ```text
//!            ┌──────────────── read > 0 bytes ───────────────┐
//!            │                 send TRANSMIT                 │
//!            ▼                                               │
//!   ┌─────────────────┐                                      │
//!   │     Running     │──────────────────────────────────────┘
//!   └────────┬────────┘
//!            │
//!            ├── read returns 0 / fails ──> release socket, send CLOSE ──┐
//!            │                                                          ▼
//!            └── cancellation signal ─────────────────────────────> Terminated
//! ```
//!
//! Cancellation comes from the connection table: a peer CLOSE, a teardown, or a
//! handle reuse removes the socket and fires its signal. The signal is checked
//! at the top of every iteration and raced against the pending read, so a
//! cancelled listener never sends anything further.

use crate::connection::stats::ProxyStats;
use crate::protocol::Packet;
use crate::storage::{Connection, ConnectionTable, SocketKey};
use crate::transport::Outbound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// Why a listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// The host side closed the connection
    Eof,
    /// A host socket read failed
    ReadError,
    /// The socket was closed or the instance is shutting down
    Cancelled,
    /// Data could not be forwarded to the peer
    TransportFailed,
}

/// Pumps reads from one host socket to the peer.
pub struct ConnectionListener {
    connection: Arc<Connection>,
    table: Arc<ConnectionTable>,
    outbound: Outbound,
    max_read: usize,
}

impl ConnectionListener {
    /// Creates a listener for a connected socket.
    ///
    /// Reads are capped so each TRANSMIT fits in one transport message.
    pub fn new(connection: Arc<Connection>, table: Arc<ConnectionTable>, outbound: Outbound) -> Self {
        let max_read = outbound.max_payload().max(1);
        Self {
            connection,
            table,
            outbound,
            max_read,
        }
    }

    pub fn key(&self) -> SocketKey {
        self.connection.key()
    }

    /// Runs the listener until the socket hangs up or is cancelled.
    pub async fn run(self) -> ListenerExit {
        let key = self.key();
        let stats = Arc::clone(self.outbound.stats());
        stats.listener_started();
        debug!(socket = %key, max_read = self.max_read, "Listener started");

        let mut cancelled = self.connection.cancelled();
        let exit = self.pump(&mut cancelled, &stats).await;

        stats.listener_stopped();
        match exit {
            ListenerExit::Cancelled => debug!(socket = %key, "Listener cancelled"),
            _ => info!(socket = %key, ?exit, "Listener terminated"),
        }
        exit
    }

    async fn pump(
        &self,
        cancelled: &mut watch::Receiver<bool>,
        stats: &ProxyStats,
    ) -> ListenerExit {
        let key = self.key();

        loop {
            if *cancelled.borrow_and_update() {
                return ListenerExit::Cancelled;
            }

            let read = tokio::select! {
                biased;
                _ = cancelled.changed() => return ListenerExit::Cancelled,
                read = self.connection.read(self.max_read) => read,
            };

            match read {
                Ok(data) if !data.is_empty() => {
                    stats.bytes_from_host(data.len());
                    trace!(socket = %key, bytes = data.len(), "Forwarding host data");

                    let packet = Packet::transmit(self.outbound.next_msg_id(), key.handle, data);
                    if let Err(e) = self.outbound.send(&packet) {
                        warn!(socket = %key, error = %e, "Failed to forward host data");
                        return self.hang_up(ListenerExit::TransportFailed);
                    }
                }
                Ok(_) => return self.hang_up(ListenerExit::Eof),
                Err(e) => {
                    debug!(socket = %key, error = %e, "Host socket read failed");
                    return self.hang_up(ListenerExit::ReadError);
                }
            }
        }
    }

    /// Removes the socket and reports the hang-up to the peer, unless the socket
    /// was already closed from the peer side.
    fn hang_up(&self, exit: ListenerExit) -> ListenerExit {
        let key = self.key();
        if !self.table.release(&self.connection) {
            return ListenerExit::Cancelled;
        }

        let close = Packet::close(self.outbound.next_msg_id(), key.handle);
        if let Err(e) = self.outbound.send(&close) {
            warn!(socket = %key, error = %e, "Failed to send CLOSE");
        }
        exit
    }
}

/// Tracks the listener tasks of one proxy instance.
#[derive(Debug, Default)]
pub struct ListenerSet {
    tasks: Mutex<JoinSet<ListenerExit>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<ListenerExit>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `listener` on the current runtime.
    pub fn spawn(&self, listener: ConnectionListener) {
        let mut tasks = self.lock();
        // Reap finished listeners so the set tracks live connections only.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(listener.run());
    }

    /// Number of listener tasks not yet reaped.
    pub fn len(&self) -> usize {
        let mut tasks = self.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits up to `grace` for every listener to finish, then aborts the rest.
    ///
    /// Callers close the connection table first so that listeners observe their
    /// cancellation signal.
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = std::mem::take(&mut *self.lock());
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = tasks.len(), "Aborting listeners after grace period");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Body;
    use crate::storage::{AddressFamily, InstanceId, SocketKind};
    use crate::transport::testing::{assert_silent, next_packet, RecordingTransport};
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    const TCP4: SocketKind = SocketKind::Tcp(AddressFamily::V4);

    struct Harness {
        table: Arc<ConnectionTable>,
        outbound: Outbound,
        rx: mpsc::UnboundedReceiver<Bytes>,
        listener: TcpListener,
    }

    async fn harness(max_message_size: usize) -> Harness {
        let (transport, rx) = RecordingTransport::new(max_message_size);
        Harness {
            table: Arc::new(ConnectionTable::new(InstanceId::new(1))),
            outbound: Outbound::new(transport, Arc::new(ProxyStats::new())),
            rx,
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    /// Opens and connects `handle`, returning the host-side server stream.
    async fn connect(h: &Harness, handle: u16) -> (Arc<Connection>, TcpStream) {
        let key = h.table.key(handle);
        h.table.create(key, TCP4).unwrap();
        let addr = h.listener.local_addr().unwrap();
        let connection = h.table.connect(key, addr).await.unwrap();
        let (server, _) = h.listener.accept().await.unwrap();
        (connection, server)
    }

    #[tokio::test]
    async fn test_forwards_data_then_closes_on_eof() {
        let mut h = harness(1024).await;
        let (connection, mut server) = connect(&h, 5).await;
        let listener = ConnectionListener::new(connection, Arc::clone(&h.table), h.outbound.clone());
        let task = tokio::spawn(listener.run());

        server.write_all(&[0xab; 120]).await.unwrap();
        let mut received = Vec::new();
        while received.len() < 120 {
            let packet = next_packet(&mut h.rx).await;
            assert_eq!(packet.sock_id, 5);
            match packet.body {
                Body::Transmit(data) => received.extend_from_slice(&data),
                other => panic!("unexpected packet body: {:?}", other),
            }
        }
        assert_eq!(received, vec![0xab; 120]);

        drop(server);
        let packet = next_packet(&mut h.rx).await;
        assert_eq!(packet.sock_id, 5);
        assert_eq!(packet.body, Body::Close);

        assert_eq!(task.await.unwrap(), ListenerExit::Eof);
        assert!(!h.table.contains(h.table.key(5)));
        assert_silent(&mut h.rx, Duration::from_millis(50)).await;
        assert_eq!(h.outbound.stats().snapshot().active_listeners, 0);
    }

    #[tokio::test]
    async fn test_reads_are_capped_to_message_size() {
        let mut h = harness(32).await;
        let (connection, mut server) = connect(&h, 1).await;
        let listener = ConnectionListener::new(connection, Arc::clone(&h.table), h.outbound.clone());
        tokio::spawn(listener.run());

        server.write_all(&[7u8; 100]).await.unwrap();

        let mut total = 0;
        while total < 100 {
            match next_packet(&mut h.rx).await.body {
                Body::Transmit(data) => {
                    assert!(data.len() <= 32 - crate::protocol::HEADER_SIZE);
                    total += data.len();
                }
                other => panic!("unexpected packet body: {:?}", other),
            }
        }
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn test_peer_close_cancels_without_close_packet() {
        let mut h = harness(1024).await;
        let (connection, _server) = connect(&h, 2).await;
        let listener = ConnectionListener::new(connection, Arc::clone(&h.table), h.outbound.clone());
        let task = tokio::spawn(listener.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.table.close(h.table.key(2));

        assert_eq!(task.await.unwrap(), ListenerExit::Cancelled);
        assert_silent(&mut h.rx, Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_closing_one_listener_leaves_other_running() {
        let mut h = harness(1024).await;
        let (first, _first_server) = connect(&h, 1).await;
        let (second, mut second_server) = connect(&h, 2).await;

        let set = ListenerSet::new();
        set.spawn(ConnectionListener::new(first, Arc::clone(&h.table), h.outbound.clone()));
        set.spawn(ConnectionListener::new(second, Arc::clone(&h.table), h.outbound.clone()));
        assert_eq!(set.len(), 2);

        h.table.close(h.table.key(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(set.len(), 1);

        second_server.write_all(b"still here").await.unwrap();
        let packet = next_packet(&mut h.rx).await;
        assert_eq!(packet.sock_id, 2);
        assert_eq!(packet.body, Body::Transmit(Bytes::from_static(b"still here")));

        h.table.close_all();
        set.shutdown(Duration::from_secs(1)).await;
        assert!(set.is_empty());
    }
}
