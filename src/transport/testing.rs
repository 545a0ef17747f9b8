//! In-memory transport used by unit tests.

use super::Transport;
use crate::protocol::{parse_packet, Packet};
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Records every outbound message on a channel.
pub(crate) struct RecordingTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    max_message_size: usize,
    buffers_available: AtomicBool,
}

impl RecordingTransport {
    pub(crate) fn new(
        max_message_size: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            tx,
            max_message_size,
            buffers_available: AtomicBool::new(true),
        });
        (transport, rx)
    }

    pub(crate) fn set_buffers_available(&self, available: bool) {
        self.buffers_available.store(available, Ordering::Relaxed);
    }
}

impl Transport for RecordingTransport {
    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn acquire_outbound_buffer(&self) -> Option<BytesMut> {
        self.buffers_available
            .load(Ordering::Relaxed)
            .then(|| BytesMut::with_capacity(self.max_message_size))
    }

    fn send(&self, message: Bytes) -> io::Result<usize> {
        let len = message.len();
        self.tx
            .send(message)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(len)
    }
}

/// Waits for the next outbound packet, failing the test after two seconds.
pub(crate) async fn next_packet(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Packet {
    let bytes = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for outbound packet")
        .expect("transport channel closed");
    parse_packet(&bytes).expect("proxy sent a malformed packet")
}

/// Asserts that nothing is sent within `wait`.
pub(crate) async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Bytes>, wait: Duration) {
    if let Ok(Some(bytes)) = tokio::time::timeout(wait, rx.recv()).await {
        panic!("unexpected outbound packet: {:?}", parse_packet(&bytes));
    }
}
