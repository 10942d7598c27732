//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hostd_admission::config::{DetectionConfig, HandshakeConfig, ListenerConfig, ReactorConfig, TlsConfig};
use hostd_admission::detect::{MarkerDetector, MultiProtocolAcceptor, TlsDetector};
use hostd_admission::identity::{Resolver, StaticResolver};
use hostd_admission::net::reactor::{Reactor, ReactorThread};
use hostd_admission::net::tls::{load_certs, ClientStream, TlsContext, TlsError, TlsVersion};
use hostd_admission::service::{EchoService, Service};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

static NEXT_PKI: AtomicUsize = AtomicUsize::new(0);

/// A self-signed certificate written to a temp dir. It serves as server
/// certificate, client certificate and CA bundle at once.
pub struct TestPki {
    pub dir: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TestPki {
    /// Certificate for `127.0.0.1` and `localhost`.
    pub fn generate() -> Self {
        let certified =
            rcgen::generate_simple_self_signed(vec!["127.0.0.1".into(), "localhost".into()])
                .unwrap();
        Self::write(certified.cert.pem(), certified.key_pair.serialize_pem())
    }

    /// Certificate asserting only the given IP address, with an empty subject.
    pub fn generate_for_ip(ip: &str) -> Self {
        let mut params = rcgen::CertificateParams::new(vec![ip.to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        Self::write(cert.pem(), key_pair.serialize_pem())
    }

    fn write(cert_pem: String, key_pem: String) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "hostd-admission-it-{}-{}",
            std::process::id(),
            NEXT_PKI.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, cert_pem).unwrap();
        std::fs::write(&key, key_pem).unwrap();
        Self { dir, cert, key }
    }

    pub fn tls_config(&self) -> TlsConfig {
        let cert = self.cert.to_str().unwrap();
        TlsConfig::new(cert, self.key.to_str().unwrap(), Some(cert))
    }

    /// Context used on the client side of test connections.
    pub fn client_context(&self) -> TlsContext {
        TlsContext::load(&self.tls_config()).unwrap()
    }

    /// Client config that trusts this certificate but presents none.
    pub fn anonymous_client(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.cert).unwrap() {
            roots.add(cert).unwrap();
        }
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        Arc::new(config)
    }
}

impl Drop for TestPki {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// A reactor thread with an acceptor serving echo over TLS and STOMP.
pub struct Harness {
    // Dropped before the reactor so the listener is unregistered first.
    pub acceptor: MultiProtocolAcceptor,
    pub reactor: ReactorThread,
}

impl Harness {
    pub fn start(tls: Option<TlsConfig>, detection: DetectionConfig) -> Self {
        Self::start_with(tls, detection, HandshakeConfig::default())
    }

    pub fn start_with(
        tls: Option<TlsConfig>,
        detection: DetectionConfig,
        handshake: HandshakeConfig,
    ) -> Self {
        let reactor = Reactor::new(&ReactorConfig {
            poll_interval_ms: 20,
            events_capacity: 64,
        })
        .unwrap()
        .spawn()
        .unwrap();

        let listener = ListenerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_pending_connections: 64,
        };
        let acceptor = MultiProtocolAcceptor::bind(reactor.handle(), &listener, &detection).unwrap();

        let service: Arc<dyn Service> = Arc::new(EchoService);
        if let Some(tls) = tls {
            let context = Arc::new(TlsContext::load(&tls).unwrap());
            let resolver: Arc<dyn Resolver> = Arc::new(StaticResolver::new());
            acceptor.add_detector(Arc::new(TlsDetector::new(
                context,
                handshake,
                resolver,
                service.clone(),
            )));
        }
        acceptor.add_detector(Arc::new(MarkerDetector::stomp(service)));

        Self { acceptor, reactor }
    }

    pub fn addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    sock
}

/// Complete a TLS handshake as client, optionally pinning the version.
pub fn tls_connect(
    addr: SocketAddr,
    client: &TlsContext,
    server_name: &str,
    version: Option<TlsVersion>,
) -> Result<ClientStream, TlsError> {
    let name = ServerName::try_from(server_name.to_string()).unwrap();
    client.wrap_client(connect(addr), name, version)
}

/// Handshake with a client config of the test's choosing.
pub fn tls_connect_with(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
    server_name: &str,
) -> io::Result<StreamOwned<ClientConnection, TcpStream>> {
    let name = ServerName::try_from(server_name.to_string()).unwrap();
    let mut conn = ClientConnection::new(config, name).map_err(io::Error::other)?;
    let mut sock = connect(addr);
    while conn.is_handshaking() {
        conn.complete_io(&mut sock)?;
    }
    Ok(StreamOwned::new(conn, sock))
}

/// Send `payload` and read back the same number of bytes.
pub fn echo<S: Read + Write>(stream: &mut S, payload: &[u8]) -> io::Result<Vec<u8>> {
    stream.write_all(payload)?;
    stream.flush()?;
    let mut reply = vec![0u8; payload.len()];
    stream.read_exact(&mut reply)?;
    Ok(reply)
}

/// Read whatever the server sends until it closes, resets, or goes quiet.
///
/// Returns `None` if the connection was still open when the read timed out.
pub fn read_until_closed(sock: &mut TcpStream) -> Option<Vec<u8>> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match sock.read(&mut buf) {
            Ok(0) => return Some(received),
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return None
            }
            Err(_) => return Some(received),
        }
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
