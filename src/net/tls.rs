//! TLS configuration, certificate loading and socket wrapping.
//!
//! # Responsibilities
//! - Load certificate, private key and CA bundle (PEM) at startup
//! - Resolve the accepted protocol set against the exclusion mask
//! - Wrap accepted sockets for the server side of a handshake
//! - Wrap outbound sockets for the client side (the CLI client, tests)
//!
//! # Design Decisions
//! - rustls does the cryptography; this module only configures it
//! - Legacy versions (SSLv2 through TLSv1.1) are never negotiable; naming
//!   them in the accepted set is logged and ignored
//! - Missing or empty key material is a startup error, never deferred

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use mio::event::Source;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TlsConfig;
use crate::net::connection::{ConnectionId, RawConnection, Transport};

/// Protocol versions known to the policy layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum TlsVersion {
    #[serde(rename = "sslv2")]
    Ssl2,
    #[serde(rename = "sslv3")]
    Ssl3,
    #[serde(rename = "tlsv1")]
    Tls1_0,
    #[serde(rename = "tlsv1.1")]
    Tls1_1,
    #[serde(rename = "tlsv1.2")]
    Tls1_2,
    #[serde(rename = "tlsv1.3")]
    Tls1_3,
}

impl TlsVersion {
    pub const ALL: [TlsVersion; 6] = [
        TlsVersion::Ssl2,
        TlsVersion::Ssl3,
        TlsVersion::Tls1_0,
        TlsVersion::Tls1_1,
        TlsVersion::Tls1_2,
        TlsVersion::Tls1_3,
    ];

    fn bit(self) -> u32 {
        match self {
            TlsVersion::Ssl2 => 1 << 0,
            TlsVersion::Ssl3 => 1 << 1,
            TlsVersion::Tls1_0 => 1 << 2,
            TlsVersion::Tls1_1 => 1 << 3,
            TlsVersion::Tls1_2 => 1 << 4,
            TlsVersion::Tls1_3 => 1 << 5,
        }
    }

    /// The rustls version, if the backend can negotiate it at all.
    fn backend(self) -> Option<&'static rustls::SupportedProtocolVersion> {
        match self {
            TlsVersion::Tls1_2 => Some(&rustls::version::TLS12),
            TlsVersion::Tls1_3 => Some(&rustls::version::TLS13),
            _ => None,
        }
    }

    fn from_backend(version: rustls::ProtocolVersion) -> Option<Self> {
        match version {
            rustls::ProtocolVersion::SSLv2 => Some(TlsVersion::Ssl2),
            rustls::ProtocolVersion::SSLv3 => Some(TlsVersion::Ssl3),
            rustls::ProtocolVersion::TLSv1_0 => Some(TlsVersion::Tls1_0),
            rustls::ProtocolVersion::TLSv1_1 => Some(TlsVersion::Tls1_1),
            rustls::ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls1_2),
            rustls::ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls1_3),
            _ => None,
        }
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TlsVersion::Ssl2 => "SSLv2",
            TlsVersion::Ssl3 => "SSLv3",
            TlsVersion::Tls1_0 => "TLSv1",
            TlsVersion::Tls1_1 => "TLSv1.1",
            TlsVersion::Tls1_2 => "TLSv1.2",
            TlsVersion::Tls1_3 => "TLSv1.3",
        };
        f.write_str(name)
    }
}

/// Bit set of protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolMask(u32);

impl ProtocolMask {
    pub const NONE: ProtocolMask = ProtocolMask(0);
    pub const NO_SSLV2: ProtocolMask = ProtocolMask(1 << 0);
    pub const NO_SSLV3: ProtocolMask = ProtocolMask(1 << 1);
    pub const NO_TLSV1: ProtocolMask = ProtocolMask(1 << 2);
    pub const NO_TLSV1_1: ProtocolMask = ProtocolMask(1 << 3);
    pub const NO_TLSV1_2: ProtocolMask = ProtocolMask(1 << 4);
    pub const NO_TLSV1_3: ProtocolMask = ProtocolMask(1 << 5);

    pub fn from_versions(versions: &[TlsVersion]) -> Self {
        versions
            .iter()
            .fold(Self::NONE, |mask, v| ProtocolMask(mask.0 | v.bit()))
    }

    pub fn contains(self, version: TlsVersion) -> bool {
        self.0 & version.bit() != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn versions(self) -> Vec<TlsVersion> {
        TlsVersion::ALL
            .into_iter()
            .filter(|v| self.contains(*v))
            .collect()
    }
}

impl std::ops::BitOr for ProtocolMask {
    type Output = ProtocolMask;

    fn bitor(self, rhs: ProtocolMask) -> ProtocolMask {
        ProtocolMask(self.0 | rhs.0)
    }
}

/// Versions the backend will actually negotiate for this policy.
pub fn effective_versions(accepted: ProtocolMask, excluded: ProtocolMask) -> Vec<TlsVersion> {
    accepted
        .versions()
        .into_iter()
        .filter(|v| !excluded.contains(*v) && v.backend().is_some())
        .collect()
}

/// Error type for TLS setup and wrapping.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{kind} file not found: {path}")]
    NotFound { kind: &'static str, path: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("protocol policy leaves no negotiable version")]
    NoProtocolVersions,

    #[error("{0} is not supported by the TLS backend")]
    UnsupportedVersion(TlsVersion),

    #[error("no CA bundle configured for client connections")]
    MissingTrustBundle,

    #[error("client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("handshake I/O failed: {0}")]
    Handshake(#[source] io::Error),
}

/// Immutable TLS material and protocol policy.
#[derive(Debug, Clone)]
pub struct TlsContext {
    server_config: Arc<ServerConfig>,
    provider: Arc<CryptoProvider>,
    certs: Vec<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
    roots: Option<Arc<RootCertStore>>,
    versions: Vec<TlsVersion>,
    excluded: ProtocolMask,
}

impl TlsContext {
    /// Load certificate material and build the server configuration.
    pub fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let certs = load_certs(Path::new(&config.cert_path))?;
        let key = load_private_key(Path::new(&config.key_path))?;
        let roots = match &config.ca_path {
            Some(path) => Some(Arc::new(load_roots(Path::new(path))?)),
            None => None,
        };

        let accepted = config.accepted_mask();
        let excluded = config.excluded_mask();
        for version in accepted.versions() {
            if version.backend().is_none() && !excluded.contains(version) {
                tracing::warn!(%version, "Legacy protocol version is never negotiated, ignoring");
            }
        }
        let versions = effective_versions(accepted, excluded);
        if versions.is_empty() {
            return Err(TlsError::NoProtocolVersions);
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let backend: Vec<&'static rustls::SupportedProtocolVersion> =
            versions.iter().filter_map(|v| v.backend()).collect();

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&backend)?;
        let builder = match &roots {
            Some(roots) => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone());
                let verifier = if config.require_client_cert {
                    verifier.build()?
                } else {
                    verifier.allow_unauthenticated().build()?
                };
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };
        let server_config = builder.with_single_cert(certs.clone(), key.clone_key())?;

        tracing::info!(
            cert_path = %config.cert_path,
            versions = ?versions,
            client_auth = roots.is_some() && config.require_client_cert,
            "TLS context loaded"
        );

        Ok(Self {
            server_config: Arc::new(server_config),
            provider,
            certs,
            key: Arc::new(key),
            roots,
            versions,
            excluded,
        })
    }

    /// Versions this context negotiates as a server.
    pub fn versions(&self) -> &[TlsVersion] {
        &self.versions
    }

    pub fn excluded(&self) -> ProtocolMask {
        self.excluded
    }

    /// Whether the server side demands a client certificate.
    pub fn requests_client_cert(&self) -> bool {
        self.roots.is_some()
    }

    /// Wrap an accepted connection for the server side of a handshake.
    ///
    /// No I/O happens here; the handshake is driven by the reactor.
    pub fn wrap_server(&self, raw: RawConnection) -> Result<TlsStream, TlsError> {
        let conn = ServerConnection::new(self.server_config.clone())?;
        Ok(TlsStream { conn, io: raw })
    }

    /// Wrap a connected blocking socket for the client side and complete the
    /// handshake. `protocol` pins a single version; `None` uses the
    /// context's policy.
    pub fn wrap_client(
        &self,
        mut sock: std::net::TcpStream,
        server_name: ServerName<'static>,
        protocol: Option<TlsVersion>,
    ) -> Result<ClientStream, TlsError> {
        let roots = self.roots.clone().ok_or(TlsError::MissingTrustBundle)?;
        let backend: Vec<&'static rustls::SupportedProtocolVersion> = match protocol {
            Some(version) => vec![version
                .backend()
                .ok_or(TlsError::UnsupportedVersion(version))?],
            None => self.versions.iter().filter_map(|v| v.backend()).collect(),
        };

        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&backend)?
            .with_root_certificates(roots)
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())?;

        let mut conn = ClientConnection::new(Arc::new(config), server_name)?;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock).map_err(TlsError::Handshake)?;
        }
        Ok(rustls::StreamOwned::new(conn, sock))
    }
}

/// Client side of an established TLS connection over a blocking socket.
pub type ClientStream = rustls::StreamOwned<ClientConnection, std::net::TcpStream>;

fn open(kind: &'static str, path: &Path) -> Result<BufReader<File>, TlsError> {
    if !path.exists() {
        return Err(TlsError::NotFound {
            kind,
            path: path.display().to_string(),
        });
    }
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// Read every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open("Certificate", path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

/// Read the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open("Private key", path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server side of a TLS connection over a non-blocking socket.
///
/// Reads and writes never block: they surface `WouldBlock` when the socket
/// has nothing to give or cannot take more, and encrypted output that did
/// not fit stays queued until `flush` is called on a writable socket.
pub struct TlsStream {
    conn: ServerConnection,
    io: RawConnection,
}

impl std::fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("connection_id", &self.io.id())
            .field("peer_addr", &self.io.peer_addr())
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

impl TlsStream {
    pub fn connection(&self) -> &ServerConnection {
        &self.conn
    }

    /// Negotiated protocol version, once known.
    pub fn negotiated_version(&self) -> Option<TlsVersion> {
        self.conn
            .protocol_version()
            .and_then(TlsVersion::from_backend)
    }

    /// Peer certificate chain presented during the handshake.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.conn.peer_certificates()
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut ServerConnection, &mut RawConnection) {
        (&mut self.conn, &mut self.io)
    }

    /// Write queued TLS records until the socket would block.
    pub(crate) fn write_pending(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.io) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            match self.conn.read_tls(&mut self.io) {
                // EOF is recorded by rustls; the next reader() call reports it.
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            // Alerts and key updates queued by processing go out best-effort.
            self.write_pending()?;
            state?;
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.write_pending()?;
        if n == 0 && !buf.is_empty() {
            // rustls refused more plaintext until queued records drain.
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.writer().flush()?;
        self.write_pending()
    }
}

impl Transport for TlsStream {
    fn source(&mut self) -> &mut dyn Source {
        self.io.stream_mut()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.io.peer_addr()
    }

    fn connection_id(&self) -> ConnectionId {
        self.io.id()
    }

    fn has_pending_output(&self) -> bool {
        self.conn.wants_write()
    }

    fn protocol(&self) -> &'static str {
        "tls"
    }
}
