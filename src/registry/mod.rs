use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    ConnectionNotFound { connection_id: u64 },
    CapacityReached { limit: usize },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotFound { connection_id } => {
                write!(f, "connection {connection_id} not found")
            }
            Self::CapacityReached { limit } => {
                write!(f, "connection limit of {limit} reached")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// A live control session. The writer half is only touched under its mutex;
/// the reading half belongs to the connection's worker thread.
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    writer: Mutex<TcpStream>,
    closed: AtomicBool,
    bytes_received: AtomicU64,
    bytes_written: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct ConnectionSnapshot {
    pub connection_id: u64,
    pub peer_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub bytes_received: u64,
    pub bytes_written: u64,
}

impl Connection {
    fn new(id: u64, writer: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            connected_at: Utc::now(),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    #[cfg(test)]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn record_received(&self, size: usize) {
        self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn send(&self, payload: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().expect("connection writer lock poisoned");
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection {} is closed", self.id),
            ));
        }

        writer.write_all(payload)?;
        writer.flush()?;
        self.bytes_written
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(payload.len())
    }

    /// Writes `notice` (best effort) and shuts the socket down in both
    /// directions, all under the writer mutex. Returns `false` when the
    /// connection had already been closed.
    pub fn close_with_notice(&self, notice: Option<&[u8]>) -> bool {
        let mut writer = self.writer.lock().expect("connection writer lock poisoned");
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(notice) = notice {
            if writer.write_all(notice).is_ok() {
                self.bytes_written
                    .fetch_add(notice.len() as u64, Ordering::Relaxed);
            }
        }
        let _ = writer.shutdown(Shutdown::Both);
        true
    }

    pub fn close(&self) -> bool {
        self.close_with_notice(None)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connection_id: self.id,
            peer_addr: self.peer_addr,
            connected_at: self.connected_at,
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub struct ConnectionRegistry {
    next_connection_id: AtomicU64,
    records: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            next_connection_id: AtomicU64::new(1),
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `writer` unless `limit` live connections already exist. The
    /// capacity check and the insert happen under one lock.
    pub fn register(
        &self,
        writer: TcpStream,
        peer_addr: SocketAddr,
        limit: usize,
    ) -> Result<Arc<Connection>, RegistryError> {
        let mut records = self.records.lock().expect("connection registry lock poisoned");
        if records.len() >= limit {
            return Err(RegistryError::CapacityReached { limit });
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(id, writer, peer_addr));
        records.insert(id, Arc::clone(&connection));
        Ok(connection)
    }

    pub fn get(&self, connection_id: u64) -> Result<Arc<Connection>, RegistryError> {
        self.records
            .lock()
            .expect("connection registry lock poisoned")
            .get(&connection_id)
            .cloned()
            .ok_or(RegistryError::ConnectionNotFound { connection_id })
    }

    pub fn remove(&self, connection_id: u64) -> Option<Arc<Connection>> {
        self.records
            .lock()
            .expect("connection registry lock poisoned")
            .remove(&connection_id)
    }

    pub fn count(&self) -> usize {
        self.records
            .lock()
            .expect("connection registry lock poisoned")
            .len()
    }

    #[cfg(test)]
    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .records
            .lock()
            .expect("connection registry lock poisoned")
            .values()
            .map(|connection| connection.snapshot())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.connection_id);
        snapshots
    }

    /// Removes and returns every registered connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.records
            .lock()
            .expect("connection registry lock poisoned")
            .drain()
            .map(|(_, connection)| connection)
            .collect()
    }
}
