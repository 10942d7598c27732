//! Application services that take over admitted connections.
//!
//! Detectors hand every classified connection to a `Service`, which turns
//! the byte stream into a reactor handler. RPC dispatch lives outside this
//! crate; `EchoService` is the reference implementation used by the daemon
//! and the tests.

use std::io::{self, Read, Write};

use mio::event::Source;

use crate::net::connection::Transport;
use crate::net::reactor::{Context, Handler, HandlerError, Status};

const ECHO_BUFFER_SIZE: usize = 16 * 1024;
/// Unsent bytes at which the echo handler stops reading from its peer.
pub const ECHO_BACKLOG_LIMIT: usize = 256 * 1024;

/// Factory for the handler that serves an admitted connection.
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the handler that owns `transport` from now on.
    fn serve(&self, transport: Box<dyn Transport>) -> Result<Box<dyn Handler>, HandlerError>;
}

/// Writes every byte it receives back to the peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoService;

impl Service for EchoService {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn serve(&self, transport: Box<dyn Transport>) -> Result<Box<dyn Handler>, HandlerError> {
        tracing::debug!(
            connection_id = %transport.connection_id(),
            peer_addr = %transport.peer_addr(),
            protocol = transport.protocol(),
            "Echo session started"
        );
        Ok(Box::new(EchoHandler::new(transport)))
    }
}

/// Handler echoing a transport's input back to it.
pub struct EchoHandler {
    transport: Box<dyn Transport>,
    outbound: Vec<u8>,
    eof: bool,
}

impl EchoHandler {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            outbound: Vec::new(),
            eof: false,
        }
    }

    /// Write buffered bytes until done or the socket would block.
    fn flush_outbound(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.transport.write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        match self.transport.flush() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            other => other,
        }
    }

    /// Unsent bytes buffered for the peer.
    pub fn backlog(&self) -> usize {
        self.outbound.len()
    }

    fn backlogged(&self) -> bool {
        self.outbound.len() >= ECHO_BACKLOG_LIMIT
    }

    /// Read and echo until the socket would block, the peer hangs up, or
    /// the peer stops draining its replies.
    fn pump(&mut self) -> Result<(), HandlerError> {
        let mut buf = [0u8; ECHO_BUFFER_SIZE];
        while !self.eof && !self.backlogged() {
            match self.transport.read(&mut buf) {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    self.outbound.extend_from_slice(&buf[..n]);
                    self.flush_outbound()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // TLS peers that hang up without close_notify.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => self.eof = true,
                Err(e) => return Err(e.into()),
            }
        }
        self.flush_outbound()?;
        Ok(())
    }

    fn status(&self) -> Status {
        if self.eof && self.outbound.is_empty() && !self.transport.has_pending_output() {
            Status::Close
        } else {
            Status::Continue
        }
    }
}

impl Handler for EchoHandler {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn source(&mut self) -> &mut dyn Source {
        self.transport.source()
    }

    fn wants_read(&self) -> bool {
        !self.eof && !self.backlogged()
    }

    fn wants_write(&self) -> bool {
        !self.outbound.is_empty() || self.transport.has_pending_output()
    }

    fn on_readable(&mut self, _cx: &mut Context<'_>) -> Result<Status, HandlerError> {
        self.pump()?;
        Ok(self.status())
    }

    fn on_writable(&mut self, _cx: &mut Context<'_>) -> Result<Status, HandlerError> {
        self.flush_outbound()?;
        // Input left unread while backlogged raises no new readable edge.
        if !self.backlogged() {
            self.pump()?;
        }
        Ok(self.status())
    }

    fn on_close(&mut self) {
        tracing::debug!(
            connection_id = %self.transport.connection_id(),
            protocol = self.transport.protocol(),
            "Echo session closed"
        );
    }
}
