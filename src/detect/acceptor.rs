//! Protocol-sniffing connection acceptor.
//!
//! # Responsibilities
//! - Own the listening socket (as a reactor handler)
//! - Track each accepted socket until a detector claims it
//! - Enforce the detection budget: bytes, deadline, pending-connection cap
//! - Hand claimed sockets, with their prefix, to the detector's handler
//!
//! # Design Decisions
//! - Each pending connection is its own reactor handler, so a slow peer
//!   never delays the others
//! - The detector list is snapshotted at accept time; registry changes
//!   apply to the next connection
//! - `stop()` only closes the listener; handed-off connections live on

use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DetectionConfig, ListenerConfig};
use crate::detect::{classify, max_signature_len, Classification, DetectorRegistry, ProtocolDetector};
use crate::net::connection::{ConnectionGuard, ConnectionId, ConnectionTracker, RawConnection};
use crate::net::listener::{self, ListenerError};
use crate::net::reactor::{
    Context, Detached, Handler, HandlerError, HandlerId, ReactorError, ReactorHandle, Status,
};
use crate::observability::metrics;

const READ_CHUNK: usize = 256;

/// Error type for acceptor setup.
#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to register listener: {0}")]
    Reactor(#[from] ReactorError),

    #[error("listener I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Accepts connections on one port and routes them by their first bytes.
pub struct MultiProtocolAcceptor {
    local_addr: SocketAddr,
    registry: Arc<DetectorRegistry>,
    pending: ConnectionTracker,
    stopped: Arc<AtomicBool>,
    listener_id: HandlerId,
    handle: ReactorHandle,
}

impl std::fmt::Debug for MultiProtocolAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiProtocolAcceptor")
            .field("local_addr", &self.local_addr)
            .field("detectors", &self.registry.len())
            .field("pending", &self.pending.active_count())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl MultiProtocolAcceptor {
    /// Bind the listening socket and start accepting on `handle`'s reactor.
    ///
    /// Bind failures are returned here, before anything is registered.
    pub fn bind(
        handle: &ReactorHandle,
        config: &ListenerConfig,
        detection: &DetectionConfig,
    ) -> Result<Self, AcceptorError> {
        let socket = listener::bind(&config.host, config.port)?;
        let local_addr = socket.local_addr()?;

        let registry = Arc::new(DetectorRegistry::new());
        let pending = ConnectionTracker::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let handler = ListenerHandler {
            listener: socket,
            local_addr,
            registry: registry.clone(),
            pending: pending.clone(),
            stopped: stopped.clone(),
            detection: detection.clone(),
            max_pending: config.max_pending_connections,
        };
        let listener_id = handle.register(Box::new(handler))?;

        info!(
            address = %local_addr,
            max_pending = config.max_pending_connections,
            detection_timeout_ms = detection.timeout_ms,
            "Acceptor listening"
        );

        Ok(Self {
            local_addr,
            registry,
            pending,
            stopped,
            listener_id,
            handle: handle.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Consult `detector` for connections accepted from now on.
    pub fn add_detector(&self, detector: Arc<dyn ProtocolDetector>) {
        self.registry.add(detector);
    }

    /// Stop consulting `detector`. Returns false if it was not registered.
    pub fn remove_detector(&self, detector: &Arc<dyn ProtocolDetector>) -> bool {
        self.registry.remove(detector)
    }

    pub fn detectors(&self) -> &DetectorRegistry {
        &self.registry
    }

    /// Connections accepted but not yet claimed by a detector.
    pub fn pending_connections(&self) -> usize {
        self.pending.active_count() as usize
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Close the listening socket and abandon pending detections. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.handle.unregister(self.listener_id) {
            Ok(()) => info!(address = %self.local_addr, "Acceptor stopped"),
            // The reactor closed every handler, the listener included.
            Err(ReactorError::Stopped) => debug!("Acceptor stopped after reactor"),
            Err(e) => warn!(error = %e, "Failed to unregister listener"),
        }
    }
}

impl Drop for MultiProtocolAcceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ListenerHandler {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<DetectorRegistry>,
    pending: ConnectionTracker,
    stopped: Arc<AtomicBool>,
    detection: DetectionConfig,
    max_pending: usize,
}

impl ListenerHandler {
    fn admit(&self, stream: TcpStream, peer_addr: SocketAddr, cx: &mut Context<'_>) {
        metrics::record_accepted();

        if self.stopped.load(Ordering::SeqCst) {
            metrics::record_rejected("acceptor_stopped");
            return;
        }
        if self.pending.active_count() as usize >= self.max_pending {
            warn!(
                peer_addr = %peer_addr,
                max_pending = self.max_pending,
                "Too many pending connections, closing"
            );
            metrics::record_rejected("pending_limit");
            return;
        }

        let id = ConnectionId::new();
        let detectors = self.registry.snapshot();
        let budget = max_signature_len(&detectors).min(self.detection.max_buffer_bytes);
        let now = Instant::now();

        debug!(
            connection_id = %id,
            peer_addr = %peer_addr,
            detectors = detectors.len(),
            budget,
            "Connection accepted"
        );

        cx.register(Box::new(PendingConnection {
            stream: Some(stream),
            detached: Detached,
            id,
            peer_addr,
            buf: Vec::with_capacity(budget),
            budget,
            detectors,
            accepted_at: now,
            deadline: now + self.detection.timeout(),
            stopped: self.stopped.clone(),
            _guard: self.pending.track(id),
        }));
    }
}

impl Handler for ListenerHandler {
    fn name(&self) -> &'static str {
        "listener"
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn on_readable(&mut self, cx: &mut Context<'_>) -> Result<Status, HandlerError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.admit(stream, peer_addr, cx),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!(error = %e, "Connection aborted before accept");
                }
                Err(e) => {
                    // Typically fd exhaustion; retry on the next readiness.
                    warn!(address = %self.local_addr, error = %e, "Accept failed");
                    break;
                }
            }
        }
        Ok(Status::Continue)
    }

    fn on_close(&mut self) {
        info!(address = %self.local_addr, "Listener closed");
    }
}

/// An accepted socket waiting for a detector to claim it.
struct PendingConnection {
    stream: Option<TcpStream>,
    detached: Detached,
    id: ConnectionId,
    peer_addr: SocketAddr,
    buf: Vec<u8>,
    budget: usize,
    detectors: Arc<Vec<Arc<dyn ProtocolDetector>>>,
    accepted_at: Instant,
    deadline: Instant,
    stopped: Arc<AtomicBool>,
    _guard: ConnectionGuard,
}

impl PendingConnection {
    /// Read until the budget is reached or the socket would block.
    ///
    /// Returns true if the peer closed its side.
    fn fill(&mut self) -> io::Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(true);
        };
        let mut chunk = [0u8; READ_CHUNK];
        while self.buf.len() < self.budget {
            let want = (self.budget - self.buf.len()).min(READ_CHUNK);
            match stream.read(&mut chunk[..want]) {
                Ok(0) => return Ok(true),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    fn hand_off(&mut self, detector: Arc<dyn ProtocolDetector>) -> Result<Status, HandlerError> {
        let Some(stream) = self.stream.take() else {
            return Ok(Status::Close);
        };
        let replay = std::mem::take(&mut self.buf);
        debug!(
            connection_id = %self.id,
            peer_addr = %self.peer_addr,
            protocol = detector.name(),
            prefix_len = replay.len(),
            elapsed_ms = self.accepted_at.elapsed().as_millis() as u64,
            "Protocol detected"
        );
        metrics::record_detected(detector.name());

        let conn = RawConnection::new(self.id, stream, self.peer_addr, replay);
        detector.handle_socket(conn).map(Status::Replace)
    }
}

impl Handler for PendingConnection {
    fn name(&self) -> &'static str {
        "pending"
    }

    fn source(&mut self) -> &mut dyn Source {
        match self.stream.as_mut() {
            Some(stream) => stream as &mut dyn Source,
            None => &mut self.detached,
        }
    }

    fn on_readable(&mut self, _cx: &mut Context<'_>) -> Result<Status, HandlerError> {
        if self.stopped.load(Ordering::SeqCst) {
            debug!(connection_id = %self.id, "Acceptor stopped, abandoning detection");
            metrics::record_rejected("acceptor_stopped");
            return Ok(Status::Close);
        }

        let peer_closed = self.fill()?;
        let exhausted = peer_closed || self.buf.len() >= self.budget;
        if self.buf.is_empty() && !exhausted {
            return Ok(Status::Continue);
        }

        match classify(&self.detectors, &self.buf, exhausted) {
            Classification::Matched(detector) => self.hand_off(detector),
            Classification::Pending => Ok(Status::Continue),
            Classification::Unrecognized => {
                info!(
                    connection_id = %self.id,
                    peer_addr = %self.peer_addr,
                    bytes = self.buf.len(),
                    peer_closed,
                    "Unrecognized protocol, closing"
                );
                metrics::record_rejected(if peer_closed && self.buf.is_empty() {
                    "peer_closed"
                } else {
                    "unrecognized"
                });
                Ok(Status::Close)
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        if self.stopped.load(Ordering::SeqCst) {
            // Expire on the next loop iteration.
            Some(self.accepted_at)
        } else {
            Some(self.deadline)
        }
    }

    fn on_timeout(&mut self) {
        if self.stopped.load(Ordering::SeqCst) {
            debug!(connection_id = %self.id, "Acceptor stopped, abandoning detection");
            metrics::record_rejected("acceptor_stopped");
        } else {
            info!(
                connection_id = %self.id,
                peer_addr = %self.peer_addr,
                bytes = self.buf.len(),
                "Protocol detection timed out"
            );
            metrics::record_rejected("timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    use crate::config::ReactorConfig;
    use crate::detect::Verdict;
    use crate::net::reactor::{Reactor, ReactorThread};

    fn reactor() -> ReactorThread {
        Reactor::new(&ReactorConfig {
            poll_interval_ms: 20,
            events_capacity: 64,
        })
        .unwrap()
        .spawn()
        .unwrap()
    }

    fn local_listener() -> ListenerConfig {
        ListenerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_pending_connections: 4,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Claims connections starting with `PING` and drops them.
    struct Ping;

    impl ProtocolDetector for Ping {
        fn name(&self) -> &'static str {
            "ping"
        }

        fn signature_len(&self) -> usize {
            4
        }

        fn detect(&self, prefix: &[u8]) -> Verdict {
            if prefix.starts_with(b"PING") {
                Verdict::Match
            } else if b"PING".starts_with(prefix) {
                Verdict::NeedMore
            } else {
                Verdict::NoMatch
            }
        }

        fn handle_socket(&self, _conn: RawConnection) -> Result<Box<dyn Handler>, HandlerError> {
            Err(HandlerError::Rejected("ping is not served".to_string()))
        }
    }

    fn assert_closed(mut client: std::net::TcpStream) {
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 16];
        match client.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("unexpected {} bytes from server", n),
            Err(e) => assert_ne!(e.kind(), io::ErrorKind::WouldBlock, "connection left open"),
        }
    }

    #[test]
    fn bind_reports_ephemeral_port() {
        let thread = reactor();
        let acceptor =
            MultiProtocolAcceptor::bind(thread.handle(), &local_listener(), &DetectionConfig::default())
                .unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
        assert_eq!(acceptor.pending_connections(), 0);
    }

    #[test]
    fn unmatched_bytes_close_the_connection() {
        let thread = reactor();
        let acceptor =
            MultiProtocolAcceptor::bind(thread.handle(), &local_listener(), &DetectionConfig::default())
                .unwrap();
        acceptor.add_detector(Arc::new(Ping));

        let mut client = std::net::TcpStream::connect(acceptor.local_addr()).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        assert_closed(client);
        assert!(wait_until(|| acceptor.pending_connections() == 0));
    }

    #[test]
    fn silent_peer_times_out() {
        let thread = reactor();
        let detection = DetectionConfig {
            timeout_ms: 100,
            ..DetectionConfig::default()
        };
        let acceptor =
            MultiProtocolAcceptor::bind(thread.handle(), &local_listener(), &detection).unwrap();
        acceptor.add_detector(Arc::new(Ping));

        let client = std::net::TcpStream::connect(acceptor.local_addr()).unwrap();
        assert!(wait_until(|| acceptor.pending_connections() == 1));
        assert_closed(client);
        assert!(wait_until(|| acceptor.pending_connections() == 0));
    }

    #[test]
    fn pending_limit_closes_excess_connections() {
        let thread = reactor();
        let acceptor =
            MultiProtocolAcceptor::bind(thread.handle(), &local_listener(), &DetectionConfig::default())
                .unwrap();
        acceptor.add_detector(Arc::new(Ping));

        let held: Vec<_> = (0..4)
            .map(|_| std::net::TcpStream::connect(acceptor.local_addr()).unwrap())
            .collect();
        assert!(wait_until(|| acceptor.pending_connections() == 4));

        let extra = std::net::TcpStream::connect(acceptor.local_addr()).unwrap();
        assert_closed(extra);
        assert_eq!(acceptor.pending_connections(), 4);
        drop(held);
    }

    #[test]
    fn stop_abandons_pending_and_is_idempotent() {
        let thread = reactor();
        let acceptor =
            MultiProtocolAcceptor::bind(thread.handle(), &local_listener(), &DetectionConfig::default())
                .unwrap();
        acceptor.add_detector(Arc::new(Ping));

        let mut client = std::net::TcpStream::connect(acceptor.local_addr()).unwrap();
        client.write_all(b"PI").unwrap();
        assert!(wait_until(|| acceptor.pending_connections() == 1));

        acceptor.stop();
        acceptor.stop();
        assert!(acceptor.is_stopped());
        assert!(wait_until(|| acceptor.pending_connections() == 0));
        assert_closed(client);
    }

    #[test]
    fn removed_detector_no_longer_claims() {
        let thread = reactor();
        let acceptor =
            MultiProtocolAcceptor::bind(thread.handle(), &local_listener(), &DetectionConfig::default())
                .unwrap();
        let ping: Arc<dyn ProtocolDetector> = Arc::new(Ping);
        acceptor.add_detector(ping.clone());
        assert!(acceptor.remove_detector(&ping));
        assert!(acceptor.detectors().is_empty());

        // No detectors means a zero budget: closed without reading.
        let mut client = std::net::TcpStream::connect(acceptor.local_addr()).unwrap();
        client.write_all(b"PING").unwrap();
        assert_closed(client);
    }
}
