//! Server-side TLS handshake state machine.
//!
//! # States
//! ```text
//! Handshaking ──negotiated──▶ Verified ──service handler built──▶ Established
//!      │                          │
//!      └──────────── Failed ◀─────┘ (negotiation error, identity mismatch,
//!                                    deadline passed)
//! ```
//!
//! # Design Decisions
//! - Progress happens only inside readiness callbacks; every callback does
//!   as much non-blocking TLS I/O as the socket allows, then re-arms
//! - The peer certificate is checked against the observed peer address
//!   before any application byte is handed to the service
//! - A failed handshake flushes its alert best-effort, then closes

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use mio::event::Source;
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use x509_parser::extensions::GeneralName;

use crate::config::HandshakeConfig;
use crate::identity::{matches_any, Resolver};
use crate::net::connection::Transport;
use crate::net::reactor::{Context, Detached, Handler, HandlerError, Status};
use crate::net::tls::TlsStream;
use crate::observability::metrics;
use crate::service::Service;

/// Progress of one connection's handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Handshaking,
    Verified,
    Established,
    Failed,
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HandshakeState::Handshaking => "handshaking",
            HandshakeState::Verified => "verified",
            HandshakeState::Established => "established",
            HandshakeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a handshake did not reach `Established`.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] rustls::Error),

    #[error("socket error during handshake: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection during the handshake")]
    PeerClosed,

    #[error("peer presented no certificate")]
    NoPeerCertificate,

    #[error("peer certificate could not be parsed: {0}")]
    BadCertificate(String),

    #[error("certificate names {names:?} do not match peer address {peer}")]
    IdentityMismatch { names: Vec<String>, peer: IpAddr },

    #[error("service refused the connection: {0}")]
    Service(#[source] HandlerError),
}

impl HandshakeError {
    fn outcome(&self) -> &'static str {
        match self {
            HandshakeError::IdentityMismatch { .. } | HandshakeError::NoPeerCertificate => {
                "identity_mismatch"
            }
            _ => "failed",
        }
    }
}

/// Names a certificate asserts for its subject: commonName attributes plus
/// subjectAltName DNS names and IP addresses, in that order.
pub fn peer_names(cert_der: &[u8]) -> Result<Vec<String>, HandshakeError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| HandshakeError::BadCertificate(e.to_string()))?;

    let mut names: Vec<String> = cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .map(str::to_string)
        .collect();

    let san = cert
        .subject_alternative_name()
        .map_err(|e| HandshakeError::BadCertificate(e.to_string()))?;
    if let Some(san) = san {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        names.push(ip.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    names.dedup();
    Ok(names)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// True if any asserted name identifies `peer`. The peer address is
/// reverse-resolved at most once per call.
pub fn verify_peer_identity(names: &[String], peer: IpAddr, resolver: &dyn Resolver) -> bool {
    matches_any(names, peer, resolver)
}

/// Reactor handler driving one server-side handshake.
pub struct HandshakeDispatcher {
    stream: Option<TlsStream>,
    detached: Detached,
    state: HandshakeState,
    peer_certificate: Option<CertificateDer<'static>>,
    deadline: Instant,
    verify_identity: bool,
    resolver: Arc<dyn Resolver>,
    service: Arc<dyn Service>,
}

impl HandshakeDispatcher {
    pub fn new(
        stream: TlsStream,
        config: &HandshakeConfig,
        resolver: Arc<dyn Resolver>,
        service: Arc<dyn Service>,
    ) -> Self {
        Self {
            stream: Some(stream),
            detached: Detached,
            state: HandshakeState::Handshaking,
            peer_certificate: None,
            deadline: Instant::now() + config.timeout(),
            verify_identity: config.verify_peer_identity,
            resolver,
            service,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Leaf certificate the peer presented, once negotiation completed.
    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.peer_certificate.as_ref()
    }

    /// Run handshake I/O until it completes or the socket would block.
    ///
    /// Returns `true` once the handshake is complete.
    fn advance(stream: &mut TlsStream) -> Result<bool, HandshakeError> {
        loop {
            stream.write_pending()?;
            let (conn, sock) = stream.parts_mut();
            if !conn.is_handshaking() {
                return Ok(true);
            }

            match conn.read_tls(sock) {
                Ok(0) => return Err(HandshakeError::PeerClosed),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if let Err(e) = conn.process_new_packets() {
                // Send the alert rustls queued for the peer.
                let _ = stream.write_pending();
                return Err(e.into());
            }
        }
    }

    /// Check the negotiated peer certificate against the socket's peer.
    fn verify(&self, stream: &TlsStream) -> Result<(), HandshakeError> {
        if !self.verify_identity {
            return Ok(());
        }
        let leaf = self
            .peer_certificate
            .as_ref()
            .ok_or(HandshakeError::NoPeerCertificate)?;
        let names = peer_names(leaf.as_ref())?;
        let peer = stream.peer_addr().ip();

        if verify_peer_identity(&names, peer, self.resolver.as_ref()) {
            Ok(())
        } else {
            Err(HandshakeError::IdentityMismatch { names, peer })
        }
    }

    fn drive(&mut self) -> Result<Status, HandshakeError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Status::Close);
        };
        if !Self::advance(stream)? {
            return Ok(Status::Continue);
        }
        self.peer_certificate = stream
            .peer_certificates()
            .and_then(|chain| chain.first())
            .cloned();

        let Some(stream) = self.stream.take() else {
            return Ok(Status::Close);
        };
        if let Err(e) = self.verify(&stream) {
            self.stream = Some(stream);
            return Err(e);
        }
        self.state = HandshakeState::Verified;

        let connection_id = stream.connection_id();
        let version = stream.negotiated_version();
        let handler = self
            .service
            .serve(Box::new(stream))
            .map_err(HandshakeError::Service)?;

        self.state = HandshakeState::Established;
        metrics::record_handshake("established");
        tracing::info!(
            connection_id = %connection_id,
            version = ?version,
            service = self.service.name(),
            "TLS handshake established"
        );
        Ok(Status::Replace(handler))
    }

    fn on_event(&mut self) -> Result<Status, HandlerError> {
        match self.drive() {
            Ok(status) => Ok(status),
            Err(e) => {
                self.state = HandshakeState::Failed;
                metrics::record_handshake(e.outcome());
                match &self.stream {
                    Some(stream) => tracing::warn!(
                        connection_id = %stream.connection_id(),
                        peer_addr = %stream.peer_addr(),
                        error = %e,
                        "TLS handshake failed"
                    ),
                    None => tracing::warn!(error = %e, "TLS handshake failed"),
                }
                Ok(Status::Close)
            }
        }
    }
}

impl Handler for HandshakeDispatcher {
    fn name(&self) -> &'static str {
        "tls-handshake"
    }

    fn source(&mut self) -> &mut dyn Source {
        match self.stream.as_mut() {
            Some(stream) => stream.source(),
            None => &mut self.detached,
        }
    }

    fn wants_write(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|stream| stream.has_pending_output())
    }

    fn on_readable(&mut self, _cx: &mut Context<'_>) -> Result<Status, HandlerError> {
        self.on_event()
    }

    fn on_writable(&mut self, _cx: &mut Context<'_>) -> Result<Status, HandlerError> {
        self.on_event()
    }

    fn deadline(&self) -> Option<Instant> {
        match self.state {
            HandshakeState::Handshaking => Some(self.deadline),
            _ => None,
        }
    }

    fn on_timeout(&mut self) {
        self.state = HandshakeState::Failed;
        metrics::record_handshake("timeout");
        if let Some(stream) = &self.stream {
            tracing::warn!(
                connection_id = %stream.connection_id(),
                peer_addr = %stream.peer_addr(),
                "TLS handshake timed out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::identity::{HostEntry, ResolveError, StaticResolver};

    fn certificate(names: &[&str]) -> Vec<u8> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let certified = rcgen::generate_simple_self_signed(names).unwrap();
        certified.cert.der().to_vec()
    }

    #[test]
    fn names_include_dns_and_ip_alt_names() {
        let der = certificate(&["node1.example.com", "10.0.0.7"]);
        let names = peer_names(&der).unwrap();

        assert!(names.contains(&"node1.example.com".to_string()));
        assert!(names.contains(&"10.0.0.7".to_string()));
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        assert!(matches!(
            peer_names(b"not a certificate"),
            Err(HandshakeError::BadCertificate(_))
        ));
    }

    #[test]
    fn ip_alt_name_matches_peer_address() {
        let names = vec!["10.0.0.7".to_string()];
        let resolver = StaticResolver::new();

        assert!(verify_peer_identity(&names, "10.0.0.7".parse().unwrap(), &resolver));
        assert!(verify_peer_identity(
            &names,
            "::ffff:10.0.0.7".parse().unwrap(),
            &resolver
        ));
        assert!(!verify_peer_identity(&names, "10.0.0.8".parse().unwrap(), &resolver));
    }

    #[test]
    fn hostname_matches_through_reverse_lookup() {
        let peer: IpAddr = "10.0.0.7".parse().unwrap();
        let resolver = StaticResolver::new().with_host("node1.example.com", &[peer]);

        let names = vec!["node1.example.com".to_string()];
        assert!(verify_peer_identity(&names, peer, &resolver));

        let imposter = vec!["node2.example.com".to_string()];
        assert!(!verify_peer_identity(&imposter, peer, &resolver));
    }

    #[test]
    fn any_asserted_name_suffices() {
        let peer: IpAddr = "10.0.0.7".parse().unwrap();
        let resolver = StaticResolver::new().with_host("node1.example.com", &[peer]);
        let names = vec![
            "unrelated.example.com".to_string(),
            "node1.example.com".to_string(),
        ];
        assert!(verify_peer_identity(&names, peer, &resolver));
    }

    #[test]
    fn loopback_peer_is_trusted_for_any_hostname() {
        let names = vec!["anything.example.com".to_string()];
        let resolver = StaticResolver::new();
        assert!(verify_peer_identity(&names, "127.0.0.1".parse().unwrap(), &resolver));
        assert!(verify_peer_identity(&names, "::1".parse().unwrap(), &resolver));
    }

    struct SlowResolver {
        delay: Duration,
        lookups: AtomicUsize,
    }

    impl Resolver for SlowResolver {
        fn reverse(&self, addr: IpAddr) -> Result<HostEntry, ResolveError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Err(ResolveError::NotFound(addr))
        }
    }

    #[test]
    fn certificate_with_many_names_resolves_peer_once() {
        let sans: Vec<String> = (0..20).map(|i| format!("node{}.example.com", i)).collect();
        let sans: Vec<&str> = sans.iter().map(String::as_str).collect();
        let names = peer_names(&certificate(&sans)).unwrap();
        let resolver = SlowResolver {
            delay: Duration::from_millis(100),
            lookups: AtomicUsize::new(0),
        };

        let started = Instant::now();
        assert!(!verify_peer_identity(&names, "10.0.0.7".parse().unwrap(), &resolver));
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn empty_name_list_never_matches() {
        let resolver = StaticResolver::new();
        assert!(!verify_peer_identity(&[], "127.0.0.1".parse().unwrap(), &resolver));
    }
}
