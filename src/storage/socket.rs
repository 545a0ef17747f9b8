//! Host Socket Wrapper
//!
//! A [`Connection`] is the host-side half of one logical socket. It owns the
//! tokio socket through its whole lifecycle:
//!
//! ```text
//!   open()            connect()                  read()/write()
//! ────────> Pending ────────────> Connected ─────────────────────> ...
//!              │                      │
//!              └── connect failed ──> Failed        (removal fires `cancel`)
//! ```
//!
//! The state lock is only held to move between states or to clone the stream
//! handle out; socket I/O always happens without it, so a blocked read never
//! stalls a write or a close.

use crate::storage::table::{SocketKey, TableError};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Address family of a host socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn matches(self, addr: &SocketAddr) -> bool {
        matches!(
            (self, addr),
            (AddressFamily::V4, SocketAddr::V4(_)) | (AddressFamily::V6, SocketAddr::V6(_))
        )
    }
}

/// The kind of host socket an OPEN asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp(AddressFamily),
    Udp(AddressFamily),
}

impl SocketKind {
    pub fn family(self) -> AddressFamily {
        match self {
            SocketKind::Tcp(family) | SocketKind::Udp(family) => family,
        }
    }
}

/// A connected host socket. Cloning shares the underlying descriptor.
#[derive(Debug, Clone)]
pub enum HostStream {
    Tcp(Arc<TcpStream>),
    Udp(Arc<UdpSocket>),
}

impl HostStream {
    /// Reads at most `max_len` bytes. An empty result means end of stream.
    ///
    /// A UDP datagram longer than `max_len` is truncated to `max_len`; the rest
    /// of it is discarded by the OS.
    pub async fn read(&self, max_len: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(max_len);
        let n = match self {
            HostStream::Tcp(stream) => loop {
                stream.readable().await?;
                match stream.try_read(&mut buf) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            },
            HostStream::Udp(socket) => {
                let n = socket.recv(&mut buf).await?;
                if n == max_len {
                    debug!(max_len, "UDP datagram filled the read buffer, may be truncated");
                }
                n
            }
        };
        buf.truncate(n);
        Ok(buf.freeze())
    }

    /// Writes all of `data` (TCP) or sends it as one datagram (UDP).
    pub async fn write(&self, data: &[u8]) -> io::Result<usize> {
        match self {
            HostStream::Tcp(stream) => {
                let mut written = 0;
                while written < data.len() {
                    stream.writable().await?;
                    match stream.try_write(&data[written..]) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => written += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(written)
            }
            HostStream::Udp(socket) => socket.send(data).await,
        }
    }
}

#[derive(Debug)]
enum SocketState {
    /// Opened but not yet connected
    PendingTcp(TcpSocket),
    PendingUdp(Arc<UdpSocket>),
    /// A connect is in flight
    Connecting,
    Connected(HostStream),
    /// A TCP connect failed and consumed the socket
    Failed,
}

/// One live host socket, addressed by its [`SocketKey`].
#[derive(Debug)]
pub struct Connection {
    key: SocketKey,
    kind: SocketKind,
    state: Mutex<SocketState>,
    /// Flipped to `true` when the connection leaves the table
    cancel: watch::Sender<bool>,
}

impl Connection {
    /// Opens an unconnected host socket of the requested kind.
    ///
    /// UDP sockets are bound to the unspecified address of their family so that
    /// replies can be received once connected. Must run inside a tokio runtime.
    pub fn open(key: SocketKey, kind: SocketKind) -> io::Result<Self> {
        let state = match kind {
            SocketKind::Tcp(AddressFamily::V4) => SocketState::PendingTcp(TcpSocket::new_v4()?),
            SocketKind::Tcp(AddressFamily::V6) => SocketState::PendingTcp(TcpSocket::new_v6()?),
            SocketKind::Udp(family) => {
                let local: SocketAddr = match family {
                    AddressFamily::V4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    AddressFamily::V6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
                };
                let socket = std::net::UdpSocket::bind(local)?;
                socket.set_nonblocking(true)?;
                SocketState::PendingUdp(Arc::new(UdpSocket::from_std(socket)?))
            }
        };

        let (cancel, _) = watch::channel(false);
        Ok(Self {
            key,
            kind,
            state: Mutex::new(state),
            cancel,
        })
    }

    pub fn key(&self) -> SocketKey {
        self.key
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    fn lock_state(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true once a connect has completed successfully.
    pub fn is_connected(&self) -> bool {
        matches!(*self.lock_state(), SocketState::Connected(_))
    }

    /// Connects the socket to `addr`, giving up after `timeout`.
    pub async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<(), TableError> {
        if !self.kind.family().matches(&addr) {
            return Err(TableError::InvalidArgument);
        }

        let pending = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, SocketState::Connecting) {
                pending @ (SocketState::PendingTcp(_) | SocketState::PendingUdp(_)) => pending,
                other => {
                    *state = other;
                    return Err(TableError::AlreadyConnected);
                }
            }
        };

        let (next, result) = match pending {
            SocketState::PendingTcp(socket) => {
                match tokio::time::timeout(timeout, socket.connect(addr)).await {
                    Ok(Ok(stream)) => (
                        SocketState::Connected(HostStream::Tcp(Arc::new(stream))),
                        Ok(()),
                    ),
                    Ok(Err(e)) => (SocketState::Failed, Err(TableError::from_io(e))),
                    Err(_) => (SocketState::Failed, Err(TableError::TimedOut)),
                }
            }
            SocketState::PendingUdp(socket) => match socket.connect(addr).await {
                Ok(()) => (SocketState::Connected(HostStream::Udp(socket)), Ok(())),
                Err(e) => (SocketState::PendingUdp(socket), Err(TableError::from_io(e))),
            },
            _ => (SocketState::Failed, Err(TableError::AlreadyConnected)),
        };

        trace!(socket = %self.key, %addr, ok = result.is_ok(), "Connect finished");
        *self.lock_state() = next;
        result
    }

    /// Clones out the connected stream handle.
    pub fn stream(&self) -> Result<HostStream, TableError> {
        match &*self.lock_state() {
            SocketState::Connected(stream) => Ok(stream.clone()),
            _ => Err(TableError::Io(io::ErrorKind::NotConnected.into())),
        }
    }

    /// Reads up to `max_len` bytes from the connected socket.
    pub async fn read(&self, max_len: usize) -> Result<Bytes, TableError> {
        let stream = self.stream()?;
        stream.read(max_len).await.map_err(TableError::Io)
    }

    /// Writes `data` to the connected socket.
    ///
    /// A write blocked on a full send buffer gives up with
    /// [`TableError::NotFound`] as soon as the connection leaves the table.
    pub async fn write(&self, data: &[u8]) -> Result<usize, TableError> {
        let stream = self.stream()?;
        let mut cancelled = self.cancelled();
        if *cancelled.borrow_and_update() {
            return Err(TableError::NotFound);
        }

        tokio::select! {
            biased;

            _ = cancelled.changed() => {
                trace!(socket = %self.key, "Write abandoned on close");
                Err(TableError::NotFound)
            }
            written = stream.write(data) => written.map_err(TableError::Io),
        }
    }

    /// Signals every subscriber that this connection is gone.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Subscribes to the cancellation signal.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }
}
