//! Ingress Queues and Workers
//!
//! The transport hands over inbound messages on its own completion path, which
//! must never block. [`Ingress`] copies each message into a bounded queue (or,
//! for bulk data, into the byte ring) and returns immediately. Two worker tasks
//! per instance drain the queues in FIFO order.
//!
//! ```text
//! on_command_received ──> [ command queue ] ──> command_worker ──┐
//!                                                                ├──> CommandDispatcher
//! on_bulk_received ──> ring + [ bulk queue ] ──> bulk_worker ────┘
//! ```
//!
//! A full queue or ring drops the message and counts it; nothing waits for
//! space. A failure while processing one item never stops its worker.

use super::ring::{RingConsumer, RingProducer};
use crate::commands::CommandDispatcher;
use crate::connection::ProxyStats;
use crate::error::{ProxyError, Result};
use crate::protocol::{parse_packet, Body, Packet};
use crate::storage::InstanceId;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// A command message waiting for the command worker.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub instance: InstanceId,
    pub bytes: Bytes,
}

/// A bulk record waiting in the ring. Only its length travels on the queue.
#[derive(Debug, Clone, Copy)]
pub struct BulkItem {
    pub instance: InstanceId,
    pub len: usize,
}

/// Receiving ends of the ingress queues, consumed by the two workers.
#[derive(Debug)]
pub(crate) struct IngressQueues {
    pub commands: mpsc::Receiver<WorkItem>,
    pub bulk: mpsc::Receiver<BulkItem>,
    pub ring: RingConsumer,
}

/// Transport-facing intake of one proxy instance.
#[derive(Debug)]
pub struct Ingress {
    instance: InstanceId,
    commands: mpsc::Sender<WorkItem>,
    bulk: mpsc::Sender<BulkItem>,
    ring: RingProducer,
    accepting: Arc<AtomicBool>,
    stats: Arc<ProxyStats>,
}

impl Ingress {
    /// Builds the intake side and the queues its workers will drain.
    pub(crate) fn new(
        instance: InstanceId,
        command_depth: usize,
        bulk_depth: usize,
        ring: (RingProducer, RingConsumer),
        accepting: Arc<AtomicBool>,
        stats: Arc<ProxyStats>,
    ) -> (Self, IngressQueues) {
        let (command_tx, command_rx) = mpsc::channel(command_depth);
        let (bulk_tx, bulk_rx) = mpsc::channel(bulk_depth);
        let (producer, consumer) = ring;

        let ingress = Self {
            instance,
            commands: command_tx,
            bulk: bulk_tx,
            ring: producer,
            accepting,
            stats,
        };
        let queues = IngressQueues {
            commands: command_rx,
            bulk: bulk_rx,
            ring: consumer,
        };
        (ingress, queues)
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    fn check_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ProxyError::ShuttingDown)
        }
    }

    /// Queues a command message. Never blocks.
    pub fn on_command_received(&self, bytes: &[u8]) -> Result<()> {
        self.check_accepting()?;

        let item = WorkItem {
            instance: self.instance,
            bytes: Bytes::copy_from_slice(bytes),
        };
        match self.commands.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.ingress_dropped();
                debug!(instance = %self.instance, bytes = bytes.len(), "Command queue full, dropping");
                Err(ProxyError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProxyError::ShuttingDown),
        }
    }

    /// Stages a bulk message in the ring and queues its length. Never blocks.
    ///
    /// The queue slot is reserved before the ring write so that a record is
    /// never left in the ring without a queue entry describing it.
    pub fn on_bulk_received(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_accepting()?;

        let permit = match self.bulk.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => {
                self.stats.ingress_dropped();
                debug!(instance = %self.instance, bytes = bytes.len(), "Bulk queue full, dropping");
                return Err(ProxyError::QueueFull);
            }
            Err(mpsc::error::TrySendError::Closed(())) => return Err(ProxyError::ShuttingDown),
        };

        if let Err(e) = self.ring.write(bytes) {
            self.stats.ingress_dropped();
            debug!(instance = %self.instance, error = %e, "Ring full, dropping bulk message");
            return Err(e.into());
        }

        permit.send(BulkItem {
            instance: self.instance,
            len: bytes.len(),
        });
        Ok(())
    }
}

/// Drains the command queue until shutdown.
pub(crate) async fn command_worker(
    dispatcher: CommandDispatcher,
    mut commands: mpsc::Receiver<WorkItem>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let instance = dispatcher.table().instance();
    debug!(%instance, "Command worker started");

    loop {
        let item = tokio::select! {
            biased;
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            item = commands.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        if item.instance != instance {
            warn!(%instance, item_instance = %item.instance, "Dropping command for another instance");
            continue;
        }

        let Some(packet) = parse_or_drop(&dispatcher, &item.bytes) else {
            continue;
        };
        execute(&dispatcher, packet).await;
        dispatcher.outbound().stats().command_processed();
    }

    debug!(%instance, "Command worker stopped");
}

/// Drains the bulk queue until shutdown, pulling each record from the ring.
pub(crate) async fn bulk_worker(
    dispatcher: CommandDispatcher,
    mut bulk: mpsc::Receiver<BulkItem>,
    mut ring: RingConsumer,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let instance = dispatcher.table().instance();
    debug!(%instance, "Bulk worker started");

    loop {
        let item = tokio::select! {
            biased;
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            item = bulk.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let Some(record) = ring.read_exact(item.len) else {
            warn!(%instance, len = item.len, available = ring.len(), "Bulk record missing from ring");
            continue;
        };

        let Some(packet) = parse_or_drop(&dispatcher, &record) else {
            continue;
        };

        match packet.body {
            Body::Transmit(data) => match dispatcher.transmit(packet.sock_id, data).await {
                Ok(receipt) => trace!(?receipt, "Bulk transmit complete"),
                Err(e) => debug!(handle = packet.sock_id, error = %e, "Bulk transmit failed"),
            },
            _ => execute(&dispatcher, packet).await,
        }
        dispatcher.outbound().stats().bulk_processed();
    }

    debug!(%instance, "Bulk worker stopped");
}

fn parse_or_drop(dispatcher: &CommandDispatcher, bytes: &[u8]) -> Option<Packet> {
    match parse_packet(bytes) {
        Ok(packet) => Some(packet),
        Err(e) => {
            dispatcher.outbound().stats().malformed();
            debug!(instance = %dispatcher.table().instance(), error = %e, "Dropping malformed packet");
            None
        }
    }
}

async fn execute(dispatcher: &CommandDispatcher, packet: Packet) {
    if let Some(ack) = dispatcher.dispatch(packet).await {
        if let Err(e) = dispatcher.outbound().send(&ack) {
            warn!(%ack, error = %e, "Failed to send acknowledgement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ListenerSet;
    use crate::ingress::ring::ring_buffer;
    use crate::protocol::{
        family, ip_proto, socket_type, AckStatus, OpenRequest, OpenStatus, Opcode,
    };
    use crate::storage::ConnectionTable;
    use crate::transport::testing::{assert_silent, next_packet, RecordingTransport};
    use crate::transport::Outbound;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        ingress: Ingress,
        queues: Option<IngressQueues>,
        dispatcher: CommandDispatcher,
        stats: Arc<ProxyStats>,
        accepting: Arc<AtomicBool>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    fn harness(depth: usize, ring_capacity: usize) -> Harness {
        let instance = InstanceId::new(3);
        let stats = Arc::new(ProxyStats::new());
        let accepting = Arc::new(AtomicBool::new(true));
        let (transport, rx) = RecordingTransport::new(1024);
        let dispatcher = CommandDispatcher::new(
            Arc::new(ConnectionTable::new(instance)),
            Outbound::new(transport, Arc::clone(&stats)),
            Arc::new(ListenerSet::new()),
        );
        let (ingress, queues) = Ingress::new(
            instance,
            depth,
            depth,
            ring_buffer(ring_capacity).unwrap(),
            Arc::clone(&accepting),
            Arc::clone(&stats),
        );
        Harness {
            ingress,
            queues: Some(queues),
            dispatcher,
            stats,
            accepting,
            rx,
        }
    }

    fn start_workers(h: &mut Harness) -> watch::Sender<bool> {
        let queues = h.queues.take().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(command_worker(
            h.dispatcher.clone(),
            queues.commands,
            shutdown_rx.clone(),
        ));
        tokio::spawn(bulk_worker(
            h.dispatcher.clone(),
            queues.bulk,
            queues.ring,
            shutdown_rx,
        ));
        shutdown_tx
    }

    fn open_bytes(msg_id: u16, handle: u16) -> Bytes {
        Packet::open(
            msg_id,
            OpenRequest {
                family: family::IP,
                socket_type: socket_type::STREAM,
                protocol: ip_proto::TCP,
                handle,
            },
        )
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_command_is_acknowledged() {
        let mut h = harness(8, 1024);
        let _shutdown = start_workers(&mut h);

        assert_ok!(h.ingress.on_command_received(&open_bytes(7, 5)));

        let ack = next_packet(&mut h.rx).await;
        assert_eq!(ack.msg_id, 7);
        assert_eq!(ack.sock_id, 5);
        assert_eq!(
            ack.body,
            Body::Ack {
                orig_opcode: Opcode::Open,
                status: AckStatus::Open(OpenStatus::Success)
            }
        );
        assert!(h.dispatcher.table().contains(h.dispatcher.table().key(5)));
    }

    #[tokio::test]
    async fn test_commands_processed_in_order() {
        let mut h = harness(8, 1024);
        let _shutdown = start_workers(&mut h);

        for msg_id in 1..=4u16 {
            assert_ok!(h.ingress.on_command_received(&open_bytes(msg_id, msg_id)));
        }
        for msg_id in 1..=4u16 {
            assert_eq!(next_packet(&mut h.rx).await.msg_id, msg_id);
        }
    }

    #[tokio::test]
    async fn test_malformed_command_dropped() {
        let mut h = harness(8, 1024);
        let _shutdown = start_workers(&mut h);

        // Declared payload length of 5 with only 2 payload bytes delivered
        let mut bytes = open_bytes(1, 5).to_vec();
        bytes.truncate(bytes.len() - 3);
        assert_ok!(h.ingress.on_command_received(&bytes));

        assert_silent(&mut h.rx, Duration::from_millis(50)).await;
        assert!(h.dispatcher.table().is_empty());
        assert_eq!(h.stats.snapshot().malformed_dropped, 1);

        // The worker keeps going after a bad item
        assert_ok!(h.ingress.on_command_received(&open_bytes(2, 5)));
        assert_eq!(next_packet(&mut h.rx).await.msg_id, 2);
    }

    #[tokio::test]
    async fn test_command_queue_full_drops() {
        let h = harness(1, 1024);

        assert_ok!(h.ingress.on_command_received(&open_bytes(1, 1)));
        let result = h.ingress.on_command_received(&open_bytes(2, 2));
        assert!(matches!(result, Err(ProxyError::QueueFull)));
        assert_eq!(h.stats.snapshot().ingress_dropped, 1);
    }

    #[tokio::test]
    async fn test_ring_full_drops_without_queueing() {
        let mut h = harness(8, 16);

        let big = Packet::transmit(1, 1, vec![0u8; 20]).encode().unwrap();
        let result = h.ingress.on_bulk_received(&big);
        assert!(matches!(
            result,
            Err(ProxyError::RingFull {
                requested: 27,
                available: 16
            })
        ));
        assert_eq!(h.stats.snapshot().ingress_dropped, 1);

        // A record that fits still goes through
        let small = Packet::transmit(2, 1, vec![0u8; 4]).encode().unwrap();
        assert_ok!(h.ingress.on_bulk_received(&small));
        let queues = h.queues.as_mut().unwrap();
        assert_eq!(queues.bulk.try_recv().unwrap().len, small.len());
        assert!(queues.bulk.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bulk_queue_full_leaves_ring_untouched() {
        let mut h = harness(1, 1024);

        let record = Packet::transmit(1, 1, vec![1u8; 4]).encode().unwrap();
        assert_ok!(h.ingress.on_bulk_received(&record));
        assert!(matches!(
            h.ingress.on_bulk_received(&record),
            Err(ProxyError::QueueFull)
        ));
        assert_eq!(h.queues.as_ref().unwrap().ring.len(), record.len());
    }

    #[tokio::test]
    async fn test_bulk_non_transmit_is_dispatched() {
        let mut h = harness(8, 1024);
        let _shutdown = start_workers(&mut h);

        assert_ok!(h.ingress.on_bulk_received(&open_bytes(9, 6)));
        let ack = next_packet(&mut h.rx).await;
        assert_eq!(ack.msg_id, 9);
        assert_eq!(ack.opcode(), Opcode::Ack);
    }

    #[tokio::test]
    async fn test_refuses_after_teardown_starts() {
        let mut h = harness(8, 1024);
        h.accepting.store(false, Ordering::Release);

        assert_err!(h.ingress.on_command_received(&open_bytes(1, 1)));
        assert!(matches!(
            h.ingress.on_bulk_received(&open_bytes(1, 1)),
            Err(ProxyError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown_signal() {
        let mut h = harness(8, 1024);
        let queues = h.queues.take().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(command_worker(
            h.dispatcher.clone(),
            queues.commands,
            shutdown_rx,
        ));

        shutdown_tx.send_replace(true);
        assert_ok!(assert_ok!(tokio::time::timeout(Duration::from_secs(1), worker).await));
    }
}
