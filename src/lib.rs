//! Connection admission for a host-management daemon.
//!
//! One TCP port serves plaintext and TLS clients alike: the acceptor sniffs
//! each connection's first bytes, a detector claims it, TLS connections are
//! handshaken and their certificate identity checked against the peer
//! address, and the result is handed to an application `Service`.

pub mod config;
pub mod detect;
pub mod identity;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod service;

pub use config::schema::AdmissionConfig;
pub use detect::{MultiProtocolAcceptor, ProtocolDetector, Verdict};
pub use identity::{compare_names, matches_any};
pub use net::reactor::{Reactor, ReactorHandle, ReactorThread};
pub use net::tls::TlsContext;
pub use service::{EchoService, Service};
