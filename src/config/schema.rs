//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! admission daemon. All types derive Serde traits for deserialization from
//! config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::tls::{ProtocolMask, TlsVersion};

/// Root configuration for the admission daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Listener configuration (bind address, pending limit).
    pub listener: ListenerConfig,

    /// TLS material and protocol policy. Plaintext only when absent.
    pub tls: Option<TlsConfig>,

    /// Protocol detection budget.
    pub detection: DetectionConfig,

    /// TLS handshake policy.
    pub handshake: HandshakeConfig,

    /// Reverse lookup settings.
    pub resolver: ResolverConfig,

    /// Event loop settings.
    pub reactor: ReactorConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind host (name or IP literal).
    pub host: String,

    /// Bind port; 0 picks an ephemeral port.
    pub port: u16,

    /// Maximum connections waiting for protocol detection.
    pub max_pending_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 54321,
            max_pending_connections: 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// Path to the trusted CA bundle (PEM). Enables client certificates.
    #[serde(default)]
    pub ca_path: Option<String>,

    /// Protocol versions the context may negotiate.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<TlsVersion>,

    /// Versions refused even if listed in `protocols`.
    #[serde(default = "default_excludes")]
    pub excludes: Vec<TlsVersion>,

    /// Require and verify a client certificate when `ca_path` is set.
    #[serde(default = "default_true")]
    pub require_client_cert: bool,
}

impl TlsConfig {
    /// Minimal config with default protocol policy.
    pub fn new(cert_path: &str, key_path: &str, ca_path: Option<&str>) -> Self {
        Self {
            cert_path: cert_path.to_string(),
            key_path: key_path.to_string(),
            ca_path: ca_path.map(str::to_string),
            protocols: default_protocols(),
            excludes: default_excludes(),
            require_client_cert: true,
        }
    }

    /// Accepted versions as a mask.
    pub fn accepted_mask(&self) -> ProtocolMask {
        ProtocolMask::from_versions(&self.protocols)
    }

    /// Excluded versions as a mask.
    pub fn excluded_mask(&self) -> ProtocolMask {
        ProtocolMask::from_versions(&self.excludes)
    }
}

fn default_protocols() -> Vec<TlsVersion> {
    vec![TlsVersion::Tls1_2, TlsVersion::Tls1_3]
}

fn default_excludes() -> Vec<TlsVersion> {
    vec![TlsVersion::Ssl2, TlsVersion::Ssl3]
}

fn default_true() -> bool {
    true
}

/// Longest detection deadline honoured, in milliseconds.
pub const MAX_DETECTION_TIMEOUT_MS: u64 = 10 * 60 * 1_000;

/// Longest handshake deadline honoured, in seconds.
pub const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 60 * 60;

/// Longest reverse lookup wait honoured, in milliseconds.
pub const MAX_RESOLVER_TIMEOUT_MS: u64 = 60 * 1_000;

/// Protocol detection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Time a new connection has to identify its protocol, in milliseconds.
    pub timeout_ms: u64,

    /// Upper bound on bytes buffered for detection.
    pub max_buffer_bytes: usize,

    /// Framing markers claimed by the plaintext detector.
    pub markers: Vec<String>,
}

impl DetectionConfig {
    /// Detection deadline, clamped to [`MAX_DETECTION_TIMEOUT_MS`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.min(MAX_DETECTION_TIMEOUT_MS))
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_buffer_bytes: 64,
            markers: vec!["CONNECT".to_string(), "STOMP".to_string()],
        }
    }
}

/// TLS handshake configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Handshake deadline in seconds.
    pub timeout_secs: u64,

    /// Compare certificate names against the peer address.
    pub verify_peer_identity: bool,
}

impl HandshakeConfig {
    /// Handshake deadline, clamped to [`MAX_HANDSHAKE_TIMEOUT_SECS`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.min(MAX_HANDSHAKE_TIMEOUT_SECS))
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            verify_peer_identity: true,
        }
    }
}

/// Reverse lookup configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Reverse lookup timeout in milliseconds.
    pub timeout_ms: u64,
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.min(MAX_RESOLVER_TIMEOUT_MS))
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { timeout_ms: 2_000 }
    }
}

/// Event loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Longest single poll, in milliseconds. Bounds stop latency.
    pub poll_interval_ms: u64,

    /// Readiness events fetched per poll.
    pub events_capacity: usize,
}

impl ReactorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            events_capacity: 256,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Output format for log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
