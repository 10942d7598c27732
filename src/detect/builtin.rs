//! Built-in protocol detectors.
//!
//! - `TlsDetector`: first byte is a TLS handshake record (`0x16`); the socket
//!   is wrapped and handed to a `HandshakeDispatcher`
//! - `MarkerDetector`: plaintext framing markers (STOMP `CONNECT`/`STOMP` by
//!   default); the socket goes straight to the service

use std::sync::Arc;

use crate::config::HandshakeConfig;
use crate::detect::{ProtocolDetector, Verdict};
use crate::identity::Resolver;
use crate::net::connection::RawConnection;
use crate::net::handshake::HandshakeDispatcher;
use crate::net::reactor::{Handler, HandlerError};
use crate::net::tls::{TlsContext, TlsError};
use crate::service::Service;

/// TLS record content type for handshake messages.
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Markers used by STOMP clients to open a session.
pub const STOMP_MARKERS: [&str; 2] = ["CONNECT", "STOMP"];

pub struct TlsDetector {
    context: Arc<TlsContext>,
    handshake: HandshakeConfig,
    resolver: Arc<dyn Resolver>,
    service: Arc<dyn Service>,
}

impl TlsDetector {
    pub fn new(
        context: Arc<TlsContext>,
        handshake: HandshakeConfig,
        resolver: Arc<dyn Resolver>,
        service: Arc<dyn Service>,
    ) -> Self {
        Self {
            context,
            handshake,
            resolver,
            service,
        }
    }
}

impl ProtocolDetector for TlsDetector {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn signature_len(&self) -> usize {
        1
    }

    fn detect(&self, prefix: &[u8]) -> Verdict {
        match prefix.first() {
            None => Verdict::NeedMore,
            Some(&TLS_HANDSHAKE_RECORD) => Verdict::Match,
            Some(_) => Verdict::NoMatch,
        }
    }

    fn handle_socket(&self, conn: RawConnection) -> Result<Box<dyn Handler>, HandlerError> {
        let stream = self.context.wrap_server(conn).map_err(|e| match e {
            TlsError::Rustls(e) => HandlerError::Tls(e),
            other => HandlerError::Rejected(other.to_string()),
        })?;
        Ok(Box::new(HandshakeDispatcher::new(
            stream,
            &self.handshake,
            self.resolver.clone(),
            self.service.clone(),
        )))
    }
}

/// Matches any of a set of plaintext markers at the start of the stream.
pub struct MarkerDetector {
    markers: Vec<Vec<u8>>,
    service: Arc<dyn Service>,
}

impl MarkerDetector {
    pub fn new<I, S>(markers: I, service: Arc<dyn Service>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.as_ref().to_vec())
                .filter(|m| !m.is_empty())
                .collect(),
            service,
        }
    }

    /// Detector for STOMP `CONNECT` and `STOMP` frames.
    pub fn stomp(service: Arc<dyn Service>) -> Self {
        Self::new(STOMP_MARKERS, service)
    }
}

impl ProtocolDetector for MarkerDetector {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    fn signature_len(&self) -> usize {
        self.markers.iter().map(Vec::len).max().unwrap_or(0)
    }

    fn detect(&self, prefix: &[u8]) -> Verdict {
        let mut need_more = false;
        for marker in &self.markers {
            if prefix.starts_with(marker) {
                return Verdict::Match;
            }
            if marker.starts_with(prefix) {
                need_more = true;
            }
        }
        if need_more {
            Verdict::NeedMore
        } else {
            Verdict::NoMatch
        }
    }

    fn handle_socket(&self, conn: RawConnection) -> Result<Box<dyn Handler>, HandlerError> {
        self.service.serve(Box::new(conn))
    }
}
