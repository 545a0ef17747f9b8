//! TCP Stream Transport
//!
//! A peer attaches over a plain TCP stream. Packets travel back to back on the
//! stream and are delimited by their own header: the reader waits for a full
//! header, works out the frame length from the opcode and `payload_len`, and
//! hands each complete frame to the instance's [`Ingress`]. TRANSMIT frames go
//! to the bulk path, everything else to the command path.
//!
//! Outbound packets are queued on an unbounded channel and written by a
//! dedicated writer task, so [`Transport::send`] never waits on the network.
//!
//! ## Buffer Management
//!
//! A single `BytesMut` accumulates stream data. A read may deliver part of a
//! frame or several frames at once; complete frames are split off the front
//! and the remainder stays buffered.

use super::Transport;
use crate::error::ProxyError;
use crate::ingress::Ingress;
use crate::protocol::{peek_header, Opcode, PacketError, HEADER_SIZE};
use crate::proxy::{ProxyConfig, ProxyInstance};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// How long detaching waits for queued outbound packets to be written
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound half of a stream-attached peer.
#[derive(Debug)]
pub struct StreamTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    max_message_size: usize,
}

impl StreamTransport {
    /// Creates the transport and the receiver its writer task drains.
    pub fn new(max_message_size: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, max_message_size }), rx)
    }
}

impl Transport for StreamTransport {
    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn acquire_outbound_buffer(&self) -> Option<BytesMut> {
        if self.tx.is_closed() {
            return None;
        }
        Some(BytesMut::with_capacity(self.max_message_size))
    }

    fn send(&self, message: Bytes) -> io::Result<usize> {
        let len = message.len();
        self.tx
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer writer has stopped"))?;
        Ok(len)
    }
}

/// Errors that end a peer session.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// The stream can no longer be split into frames
    #[error("framing error: {0}")]
    Framing(#[from] PacketError),

    #[error("unexpected end of stream with {buffered} bytes of a partial frame")]
    UnexpectedEof { buffered: usize },
}

/// Serves one peer until it disconnects, then tears its instance down.
pub async fn serve_peer(
    stream: TcpStream,
    addr: SocketAddr,
    config: ProxyConfig,
    max_message_size: usize,
) -> Result<(), PeerError> {
    let instance = config.instance_id;
    let (read_half, write_half) = stream.into_split();

    let (transport, outbound_rx) = StreamTransport::new(max_message_size);
    let (proxy, ingress) = ProxyInstance::attach(config, transport)?;
    let mut writer = tokio::spawn(write_loop(write_half, outbound_rx));

    info!(peer = %addr, %instance, "Peer attached");

    let result = FrameReader::new(read_half, addr, ingress).run().await;

    proxy.shutdown().await;

    // Every outbound handle is gone once the instance has shut down, so the
    // writer finishes after flushing what is queued.
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => debug!(peer = %addr, error = %e, "Peer writer failed"),
        Ok(Err(e)) => warn!(peer = %addr, error = %e, "Peer writer panicked"),
        Err(_) => {
            warn!(peer = %addr, "Peer writer did not drain in time");
            writer.abort();
        }
    }

    match &result {
        Ok(()) => info!(peer = %addr, %instance, "Peer detached"),
        Err(PeerError::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
            debug!(peer = %addr, %instance, "Connection reset by peer")
        }
        Err(e) => warn!(peer = %addr, %instance, error = %e, "Peer session ended with error"),
    }
    result
}

async fn write_loop(
    half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    let mut stream = BufWriter::new(half);

    while let Some(message) = rx.recv().await {
        stream.write_all(&message).await?;
        if rx.is_empty() {
            stream.flush().await?;
        }
    }

    stream.flush().await?;
    stream.shutdown().await
}

/// Splits the inbound stream into frames and feeds them to the instance.
struct FrameReader {
    stream: OwnedReadHalf,
    addr: SocketAddr,
    buffer: BytesMut,
    ingress: Ingress,
}

impl FrameReader {
    fn new(stream: OwnedReadHalf, addr: SocketAddr, ingress: Ingress) -> Self {
        Self {
            stream,
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            ingress,
        }
    }

    async fn run(mut self) -> Result<(), PeerError> {
        loop {
            while let Some((opcode, frame)) = self.next_frame()? {
                self.deliver(opcode, &frame)?;
            }

            if !self.read_more().await? {
                return Ok(());
            }
        }
    }

    /// Splits one complete frame off the buffer, if there is one.
    fn next_frame(&mut self) -> Result<Option<(Opcode, Bytes)>, PacketError> {
        let Some(header) = peek_header(&self.buffer)? else {
            return Ok(None);
        };

        let frame_len = header.frame_len();
        if self.buffer.len() < frame_len {
            self.buffer.reserve(frame_len - self.buffer.len());
            return Ok(None);
        }

        let frame = self.buffer.split_to(frame_len).freeze();
        trace!(peer = %self.addr, opcode = %header.opcode, len = frame_len, "Frame received");
        Ok(Some((header.opcode, frame)))
    }

    fn deliver(&mut self, opcode: Opcode, frame: &[u8]) -> Result<(), PeerError> {
        let delivered = match opcode {
            Opcode::Transmit => self.ingress.on_bulk_received(frame),
            _ => self.ingress.on_command_received(frame),
        };

        match delivered {
            Ok(()) => Ok(()),
            Err(ProxyError::ShuttingDown) => Err(ProxyError::ShuttingDown.into()),
            Err(e) => {
                // Dropped and counted; the session carries on.
                debug!(peer = %self.addr, %opcode, error = %e, "Frame dropped");
                Ok(())
            }
        }
    }

    /// Reads from the stream. Returns `false` on a clean end of stream.
    async fn read_more(&mut self) -> Result<bool, PeerError> {
        if self.buffer.capacity() - self.buffer.len() < HEADER_SIZE {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.read_buf(&mut self.buffer).await?;
        if n == 0 {
            if self.buffer.is_empty() {
                return Ok(false);
            }
            return Err(PeerError::UnexpectedEof {
                buffered: self.buffer.len(),
            });
        }

        trace!(peer = %self.addr, bytes = n, "Read data");
        Ok(true)
    }
}
