//! TCP listener binding.
//!
//! # Responsibilities
//! - Resolve the configured host and port
//! - Bind a non-blocking listening socket (port 0 → ephemeral)
//! - Surface bind failures synchronously to the caller

use std::net::{SocketAddr, ToSocketAddrs};

use mio::net::TcpListener;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Host/port did not resolve to any address.
    Resolve(String, std::io::Error),
    /// Failed to bind to address.
    Bind(SocketAddr, std::io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Resolve(host, e) => write!(f, "Failed to resolve {}: {}", host, e),
            ListenerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Resolve(_, e) | ListenerError::Bind(_, e) => Some(e),
        }
    }
}

/// Bind a non-blocking listener on `host:port`.
///
/// Tries each resolved address in turn and returns the first that binds.
pub fn bind(host: &str, port: u16) -> Result<TcpListener, ListenerError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| ListenerError::Resolve(host.to_string(), e))?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpListener::bind(addr) {
            Ok(listener) => {
                let local_addr = listener.local_addr().map_err(|e| ListenerError::Bind(addr, e))?;
                tracing::info!(address = %local_addr, "Listener bound");
                return Ok(listener);
            }
            Err(e) => last_error = Some(ListenerError::Bind(addr, e)),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ListenerError::Resolve(
            host.to_string(),
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        )
    }))
}
