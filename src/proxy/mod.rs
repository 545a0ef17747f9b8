//! Proxy Instance
//!
//! A [`ProxyInstance`] is everything the proxy keeps for one attached peer:
//! its connection table, its two ingress workers, its listener tasks and its
//! statistics. Several instances can run side by side in one process; each is
//! identified by the [`InstanceId`] in its configuration, and socket keys never
//! collide across instances because the id is part of every key.
//!
//! ## Lifecycle
//!
//! ```text
//! attach ──> running ──> shutdown
//!                          1. refuse new intake
//!                          2. stop workers (grace, then abort)
//!                          3. close every socket (cancels listeners)
//!                          4. await listeners (grace, then abort)
//! ```
//!
//! Dropping an instance without calling [`ProxyInstance::shutdown`] still
//! refuses intake, signals the workers and closes every socket.

pub mod config;

pub use config::{ProxyConfig, DEFAULT_QUEUE_DEPTH, DEFAULT_SHUTDOWN_GRACE};

use crate::commands::CommandDispatcher;
use crate::connection::{ListenerSet, ProxyStats, StatsSnapshot};
use crate::error::Result;
use crate::ingress::pipeline::{bulk_worker, command_worker};
use crate::ingress::{ring_buffer, Ingress};
use crate::storage::{ConnectionTable, InstanceId};
use crate::transport::{Outbound, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// One attached peer and all of its host-side state.
pub struct ProxyInstance {
    config: ProxyConfig,
    table: Arc<ConnectionTable>,
    listeners: Arc<ListenerSet>,
    stats: Arc<ProxyStats>,
    accepting: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    workers: JoinSet<()>,
}

impl ProxyInstance {
    /// Creates an instance and starts its workers on the current runtime.
    ///
    /// Returns the instance together with the [`Ingress`] the transport must
    /// feed inbound messages into.
    pub fn attach(config: ProxyConfig, transport: Arc<dyn Transport>) -> Result<(Self, Ingress)> {
        config.validate()?;
        let ring = ring_buffer(config.ring_capacity)?;

        let instance = config.instance_id;
        let table = Arc::new(ConnectionTable::with_connect_timeout(
            instance,
            config.connect_timeout,
        ));
        let listeners = Arc::new(ListenerSet::new());
        let stats = Arc::new(ProxyStats::new());
        let accepting = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let max_message_size = transport.max_message_size();
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&table),
            Outbound::new(transport, Arc::clone(&stats)),
            Arc::clone(&listeners),
        );

        let (ingress, queues) = Ingress::new(
            instance,
            config.command_queue_depth,
            config.bulk_queue_depth,
            ring,
            Arc::clone(&accepting),
            Arc::clone(&stats),
        );

        let mut workers = JoinSet::new();
        workers.spawn(command_worker(
            dispatcher.clone(),
            queues.commands,
            shutdown_rx.clone(),
        ));
        workers.spawn(bulk_worker(dispatcher, queues.bulk, queues.ring, shutdown_rx));

        info!(
            %instance,
            ring_capacity = config.ring_capacity,
            max_message_size,
            "Proxy instance attached"
        );

        let proxy = Self {
            config,
            table,
            listeners,
            stats,
            accepting,
            shutdown_tx,
            workers,
        };
        Ok((proxy, ingress))
    }

    pub fn id(&self) -> InstanceId {
        self.config.instance_id
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of listener tasks still running.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn signal_stop(&self) {
        self.accepting.store(false, Ordering::Release);
        self.shutdown_tx.send_replace(true);
    }

    /// Tears the instance down, releasing every host socket.
    pub async fn shutdown(mut self) {
        let instance = self.id();
        let grace = self.config.shutdown_grace;
        debug!(%instance, "Shutting down proxy instance");

        self.signal_stop();

        let mut workers = std::mem::take(&mut self.workers);
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(%instance, "Aborting ingress workers after grace period");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        let closed = self.table.close_all();
        self.listeners.shutdown(grace).await;

        let stats = self.stats.snapshot();
        info!(
            %instance,
            closed,
            commands = stats.commands_processed,
            bulk = stats.bulk_processed,
            dropped = stats.ingress_dropped + stats.malformed_dropped,
            "Proxy instance detached"
        );
    }
}

impl Drop for ProxyInstance {
    fn drop(&mut self) {
        self.signal_stop();
        self.table.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::protocol::{
        family, ip_proto, socket_type, AckStatus, Body, ConnectStatus, OpenRequest, OpenStatus,
        Opcode, Packet, ACK_HEADER_SIZE,
    };
    use crate::transport::testing::{assert_silent, next_packet, RecordingTransport};
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    fn attach(max_message_size: usize) -> (ProxyInstance, Ingress, mpsc::UnboundedReceiver<Bytes>) {
        let (transport, rx) = RecordingTransport::new(max_message_size);
        let config = ProxyConfig {
            shutdown_grace: Duration::from_millis(500),
            ..ProxyConfig::for_instance(InstanceId::new(1))
        };
        let (proxy, ingress) = ProxyInstance::attach(config, transport).unwrap();
        (proxy, ingress, rx)
    }

    fn send_command(ingress: &Ingress, packet: Packet) {
        assert_ok!(ingress.on_command_received(&packet.encode().unwrap()));
    }

    fn open(msg_id: u16, handle: u16) -> Packet {
        Packet::open(
            msg_id,
            OpenRequest {
                family: family::IP,
                socket_type: socket_type::STREAM,
                protocol: ip_proto::TCP,
                handle,
            },
        )
    }

    /// OPEN and CONNECT `handle` to `addr`, returning the accepted host side.
    async fn open_and_connect(
        ingress: &Ingress,
        rx: &mut mpsc::UnboundedReceiver<Bytes>,
        listener: &TcpListener,
        handle: u16,
    ) -> TcpStream {
        let addr = listener.local_addr().unwrap();
        send_command(ingress, open(handle * 2, handle));
        let ack = next_packet(rx).await;
        assert_eq!(
            ack.body,
            Body::Ack {
                orig_opcode: Opcode::Open,
                status: AckStatus::Open(OpenStatus::Success)
            }
        );

        send_command(ingress, Packet::connect(handle * 2 + 1, handle, addr));
        let ack = next_packet(rx).await;
        assert_eq!(
            ack.body,
            Body::Ack {
                orig_opcode: Opcode::Connect,
                status: AckStatus::Connect(ConnectStatus::Success)
            }
        );

        let (server, _) = listener.accept().await.unwrap();
        server
    }

    #[tokio::test]
    async fn test_attach_rejects_invalid_config() {
        let (transport, _rx) = RecordingTransport::new(1024);
        let config = ProxyConfig {
            ring_capacity: 3,
            ..ProxyConfig::default()
        };
        assert!(matches!(
            ProxyInstance::attach(config, transport),
            Err(ProxyError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_open_connect_transmit_close_scenario() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (proxy, ingress, mut rx) = attach(1024);

        let mut server = open_and_connect(&ingress, &mut rx, &listener, 5).await;

        let payload: Vec<u8> = (0..120u8).collect();
        server.write_all(&payload).await.unwrap();
        drop(server);

        // Host data arrives as TRANSMIT for handle 5, then exactly one CLOSE
        let mut received = Vec::new();
        loop {
            let packet = next_packet(&mut rx).await;
            assert_eq!(packet.sock_id, 5);
            match packet.body {
                Body::Transmit(data) => received.extend_from_slice(&data),
                Body::Close => break,
                other => panic!("unexpected packet {:?}", other),
            }
        }
        assert_eq!(received, payload);

        assert_silent(&mut rx, Duration::from_millis(50)).await;
        assert!(!proxy.table().contains(proxy.table().key(5)));
        assert_eq!(proxy.stats().closes_sent, 1);
        assert_eq!(proxy.stats().bytes_from_host, 120);
    }

    #[tokio::test]
    async fn test_bulk_transmit_reaches_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_proxy, mut ingress, mut rx) = attach(1024);

        let mut server = open_and_connect(&ingress, &mut rx, &listener, 2).await;

        let bulk = Packet::transmit(9, 2, Bytes::from_static(b"over the ring"));
        assert_ok!(ingress.on_bulk_received(&bulk.encode().unwrap()));

        let mut buf = [0u8; 13];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the ring");

        // Inbound TRANSMIT is never acknowledged
        assert_silent(&mut rx, Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_length_mismatch_dropped_without_effect() {
        let (proxy, ingress, mut rx) = attach(1024);

        let mut bytes = open(1, 5).encode().unwrap().to_vec();
        bytes.push(0xFF);
        assert_ok!(ingress.on_command_received(&bytes));

        assert_silent(&mut rx, Duration::from_millis(50)).await;
        assert!(proxy.table().is_empty());
        assert_eq!(proxy.stats().malformed_dropped, 1);
    }

    #[tokio::test]
    async fn test_close_unknown_handle_acks_header_only() {
        let (_proxy, ingress, mut rx) = attach(1024);

        send_command(&ingress, Packet::close(4, 99));
        let raw = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(raw.len(), ACK_HEADER_SIZE);
        assert_eq!(raw[0], Opcode::Ack.as_u8());
        assert_eq!(u16::from_be_bytes([raw[1], raw[2]]), 4);
        assert_eq!(u16::from_be_bytes([raw[3], raw[4]]), 99);
        assert_eq!(u16::from_be_bytes([raw[5], raw[6]]), 0);
        assert_eq!(raw[7], Opcode::Close.as_u8());
    }

    #[tokio::test]
    async fn test_two_connections_are_independent() {
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (proxy, ingress, mut rx) = attach(1024);

        let mut server_a = open_and_connect(&ingress, &mut rx, &listener_a, 1).await;
        let mut server_b = open_and_connect(&ingress, &mut rx, &listener_b, 2).await;
        assert_eq!(proxy.listener_count(), 2);

        // Peer closes handle 1: acknowledged, and no CLOSE is pushed for it
        send_command(&ingress, Packet::close(40, 1));
        let ack = next_packet(&mut rx).await;
        assert_eq!(ack.msg_id, 40);
        assert_eq!(ack.opcode(), Opcode::Ack);

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), server_a.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Handle 2 still forwards host data
        server_b.write_all(b"still here").await.unwrap();
        let mut received = Vec::new();
        while received.len() < 10 {
            let packet = next_packet(&mut rx).await;
            assert_eq!(packet.sock_id, 2);
            match packet.body {
                Body::Transmit(data) => received.extend_from_slice(&data),
                other => panic!("unexpected packet {:?}", other),
            }
        }
        assert_eq!(&received, b"still here");
        assert_eq!(proxy.table().handles(), vec![2]);
    }

    #[tokio::test]
    async fn test_connect_refused_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        drop(listener);

        let (proxy, ingress, mut rx) = attach(1024);
        send_command(&ingress, open(1, 3));
        next_packet(&mut rx).await;

        send_command(&ingress, Packet::connect(2, 3, addr));
        let ack = next_packet(&mut rx).await;
        assert_eq!(
            ack.body,
            Body::Ack {
                orig_opcode: Opcode::Connect,
                status: AckStatus::Connect(ConnectStatus::ConnectionRefused)
            }
        );
        assert_eq!(proxy.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (proxy, ingress, mut rx) = attach(1024);

        let mut server = open_and_connect(&ingress, &mut rx, &listener, 7).await;
        send_command(&ingress, open(50, 8));
        next_packet(&mut rx).await;

        let table = Arc::clone(proxy.table());
        proxy.shutdown().await;

        assert!(table.is_empty());
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Cancelled listeners stay silent, and intake is refused
        assert_silent(&mut rx, Duration::from_millis(50)).await;
        assert!(matches!(
            ingress.on_command_received(&open(60, 9).encode().unwrap()),
            Err(ProxyError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_instances_do_not_share_handles() {
        let (transport_a, mut rx_a) = RecordingTransport::new(1024);
        let (transport_b, mut rx_b) = RecordingTransport::new(1024);
        let (proxy_a, ingress_a) =
            ProxyInstance::attach(ProxyConfig::for_instance(InstanceId::new(1)), transport_a)
                .unwrap();
        let (proxy_b, ingress_b) =
            ProxyInstance::attach(ProxyConfig::for_instance(InstanceId::new(2)), transport_b)
                .unwrap();

        send_command(&ingress_a, open(1, 5));
        send_command(&ingress_b, open(1, 5));

        for rx in [&mut rx_a, &mut rx_b] {
            let ack = next_packet(rx).await;
            assert_eq!(
                ack.body,
                Body::Ack {
                    orig_opcode: Opcode::Open,
                    status: AckStatus::Open(OpenStatus::Success)
                }
            );
        }
        assert_eq!(proxy_a.table().key(5).instance, InstanceId::new(1));
        assert_eq!(proxy_b.table().key(5).instance, InstanceId::new(2));
    }
}
