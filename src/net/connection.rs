//! Accepted connections and their lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count connections still waiting for protocol detection
//! - Carry bytes consumed during detection to whoever takes the socket
//! - Define the byte-stream interface application handlers consume

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mio::event::Source;
use mio::net::TcpStream;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts live connections of one kind (e.g. pending detection).
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}

/// Non-blocking byte stream handed to application handlers.
pub trait Transport: Read + Write + Send {
    /// Socket to register with the reactor.
    fn source(&mut self) -> &mut dyn Source;

    fn peer_addr(&self) -> SocketAddr;

    fn connection_id(&self) -> ConnectionId;

    /// True while encoded bytes wait for the socket to become writable.
    fn has_pending_output(&self) -> bool {
        false
    }

    /// Protocol label for logs and metrics.
    fn protocol(&self) -> &'static str;
}

/// An accepted, non-blocking socket plus the bytes read during detection.
///
/// Reads drain the replay prefix before touching the socket, so a handler
/// taking over the connection sees the stream from its first byte.
#[derive(Debug)]
pub struct RawConnection {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    replay: Vec<u8>,
    replay_pos: usize,
}

impl RawConnection {
    pub fn new(id: ConnectionId, stream: TcpStream, peer_addr: SocketAddr, replay: Vec<u8>) -> Self {
        Self {
            id,
            stream,
            peer_addr,
            replay,
            replay_pos: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Bytes consumed during detection that have not been read back yet.
    pub fn pending_replay(&self) -> &[u8] {
        &self.replay[self.replay_pos..]
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

impl Read for RawConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pending = &self.replay[self.replay_pos..];
        if !pending.is_empty() {
            let n = pending.len().min(buf.len());
            buf[..n].copy_from_slice(&pending[..n]);
            self.replay_pos += n;
            if self.replay_pos == self.replay.len() {
                self.replay = Vec::new();
                self.replay_pos = 0;
            }
            return Ok(n);
        }
        self.stream.read(buf)
    }
}

impl Write for RawConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for RawConnection {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn protocol(&self) -> &'static str {
        "plain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    fn connected_pair() -> (std::net::TcpStream, TcpStream, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server), peer)
    }

    #[test]
    fn replay_prefix_is_read_before_socket() {
        let (mut client, server, peer) = connected_pair();
        client.write_all(b" world").unwrap();

        let mut raw = RawConnection::new(ConnectionId::new(), server, peer, b"hello".to_vec());
        assert_eq!(raw.pending_replay(), b"hello");

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 3];
        while received.len() < 11 && Instant::now() < deadline {
            match raw.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }

        assert_eq!(received, b"hello world");
        assert!(raw.pending_replay().is_empty());
    }
}
