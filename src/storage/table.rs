//! Connection Table
//!
//! The connection table is the authoritative mapping from logical socket
//! identifiers to live host sockets. It is the only state touched by more than
//! one actor: the command dispatcher opens, connects and closes entries, while
//! connection listeners remove the entry they serve when the host side hangs up.
//!
//! ## Locking Discipline
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Mutex<HashMap<SocketKey, Arc<Connection>>>   │  held for lookup / insert /
//! └──────────────────────┬───────────────────────┘  remove only
//!                        │ Arc::clone
//!                        ▼
//!              ┌───────────────────┐
//!              │    Connection     │  socket I/O happens here, unlocked
//!              └───────────────────┘
//! ```
//!
//! A handed-out `Arc<Connection>` stays valid after removal, but removal fires the
//! connection's cancellation signal so that its listener stops promptly.

use crate::storage::socket::{Connection, SocketKind};
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Identifies one proxy instance (one attached peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InstanceId(u16);

impl InstanceId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite key of a logical socket: owning instance plus peer-chosen handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketKey {
    pub instance: InstanceId,
    pub handle: u16,
}

impl fmt::Display for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.handle)
    }
}

/// Errors reported by connection table operations.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("socket already exists")]
    AlreadyExists,

    #[error("socket not found")]
    NotFound,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("socket already connected")]
    AlreadyConnected,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("connection timed out")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TableError {
    /// Classifies a host socket error into the outcomes the protocol reports.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => TableError::ConnectionRefused,
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
                TableError::NetworkUnreachable
            }
            io::ErrorKind::TimedOut => TableError::TimedOut,
            _ => TableError::Io(err),
        }
    }
}

/// Default bound on how long a CONNECT may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The per-instance table of logical sockets.
pub struct ConnectionTable {
    instance: InstanceId,
    connections: Mutex<HashMap<SocketKey, Arc<Connection>>>,
    connect_timeout: Duration,
}

impl fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("instance", &self.instance)
            .field("connections", &self.len())
            .finish()
    }
}

impl ConnectionTable {
    pub fn new(instance: InstanceId) -> Self {
        Self::with_connect_timeout(instance, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(instance: InstanceId, connect_timeout: Duration) -> Self {
        Self {
            instance,
            connections: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Builds the key for a peer handle within this table's instance.
    #[inline]
    pub fn key(&self, handle: u16) -> SocketKey {
        SocketKey {
            instance: self.instance,
            handle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketKey, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a host socket and registers it under `key`.
    pub fn create(&self, key: SocketKey, kind: SocketKind) -> Result<Arc<Connection>, TableError> {
        if key.instance != self.instance {
            return Err(TableError::InvalidArgument);
        }
        if self.contains(key) {
            return Err(TableError::AlreadyExists);
        }

        // Opening the descriptor happens outside the lock; a racing create for the
        // same key is resolved at insertion time.
        let connection = Arc::new(Connection::open(key, kind)?);

        match self.lock().entry(key) {
            Entry::Occupied(_) => Err(TableError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&connection));
                debug!(socket = %key, ?kind, "Socket created");
                Ok(connection)
            }
        }
    }

    /// Returns a reference to the connection registered under `key`.
    pub fn get(&self, key: SocketKey) -> Option<Arc<Connection>> {
        self.lock().get(&key).cloned()
    }

    pub fn contains(&self, key: SocketKey) -> bool {
        self.lock().contains_key(&key)
    }

    /// Connects the socket registered under `key` to `addr`.
    ///
    /// Fails with `NotFound` if the socket is closed while the connect is in
    /// flight; the freshly connected stream is then dropped with the connection.
    pub async fn connect(
        &self,
        key: SocketKey,
        addr: SocketAddr,
    ) -> Result<Arc<Connection>, TableError> {
        let connection = self.get(key).ok_or(TableError::NotFound)?;
        connection.connect(addr, self.connect_timeout).await?;

        if !self.is_occupant(&connection) {
            return Err(TableError::NotFound);
        }
        Ok(connection)
    }

    /// Removes and releases the socket under `key`. Closing an absent key is a
    /// no-op; returns whether anything was removed.
    pub fn close(&self, key: SocketKey) -> bool {
        let removed = self.lock().remove(&key);
        match removed {
            Some(connection) => {
                connection.cancel();
                debug!(socket = %key, "Socket closed");
                true
            }
            None => false,
        }
    }

    /// Removes `connection` only if it is still the current occupant of its key.
    ///
    /// Listeners use this so that a handle reused after a peer CLOSE is never
    /// torn down by the previous occupant's listener.
    pub fn release(&self, connection: &Arc<Connection>) -> bool {
        let key = connection.key();
        let removed = {
            let mut connections = self.lock();
            match connections.get(&key) {
                Some(current) if Arc::ptr_eq(current, connection) => connections.remove(&key),
                _ => None,
            }
        };

        match removed {
            Some(connection) => {
                connection.cancel();
                debug!(socket = %key, "Socket released");
                true
            }
            None => false,
        }
    }

    fn is_occupant(&self, connection: &Arc<Connection>) -> bool {
        self.lock()
            .get(&connection.key())
            .is_some_and(|current| Arc::ptr_eq(current, connection))
    }

    /// Reads up to `max_len` bytes from the socket under `key`.
    pub async fn read(&self, key: SocketKey, max_len: usize) -> Result<Bytes, TableError> {
        let connection = self.get(key).ok_or(TableError::NotFound)?;
        connection.read(max_len).await
    }

    /// Writes `data` to the socket under `key`.
    pub async fn write(&self, key: SocketKey, data: &[u8]) -> Result<usize, TableError> {
        let connection = self.get(key).ok_or(TableError::NotFound)?;
        connection.write(data).await
    }

    /// Closes every socket. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().map(|(_, c)| c).collect();
        for connection in &drained {
            connection.cancel();
        }
        drained.len()
    }

    /// Handles currently registered, in ascending order.
    pub fn handles(&self) -> Vec<u16> {
        let mut handles: Vec<u16> = self.lock().keys().map(|k| k.handle).collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
