//! hostd-admission daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────── reactor thread ─────────────────────┐
//!   TCP connection    │  ┌──────────┐   ┌──────────┐   TLS    ┌────────────┐    │
//!   ──────────────────┼─▶│ listener │──▶│ pending  │────────▶│ handshake  │──┐ │
//!                     │  └──────────┘   │detection │          │ + identity │  │ │
//!                     │                 └────┬─────┘          └────────────┘  │ │
//!                     │                      │ plaintext                      ▼ │
//!                     │                      └────────────────────────▶ service │
//!                     └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The main thread only loads configuration, starts the reactor and waits for
//! SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use hostd_admission::config::{resolve_config, AdmissionConfig, ConfigError, Overrides};
use hostd_admission::detect::{MarkerDetector, MultiProtocolAcceptor, TlsDetector};
use hostd_admission::identity::{Resolver, SystemResolver};
use hostd_admission::lifecycle::shutdown_signal;
use hostd_admission::net::reactor::Reactor;
use hostd_admission::net::tls::TlsContext;
use hostd_admission::observability::{logging, metrics};
use hostd_admission::service::{EchoService, Service};

#[derive(Parser)]
#[command(name = "hostd-admission")]
#[command(about = "Plaintext/TLS connection admission daemon", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listener.host
    #[arg(long)]
    host: Option<String>,

    /// Override listener.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override observability.log_level
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<AdmissionConfig, ConfigError> {
        let overrides = Overrides {
            host: self.host,
            port: self.port,
            log_level: self.log_level,
        };
        resolve_config(self.config.as_deref(), overrides)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;
    logging::init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.listener.host,
        port = config.listener.port,
        tls = config.tls.is_some(),
        "hostd-admission starting"
    );

    if config.observability.metrics_enabled {
        metrics::init_metrics(config.observability.metrics_address.parse()?)?;
    }

    // TLS material is loaded before binding so bad paths fail fast.
    let tls = match &config.tls {
        Some(tls) => Some(Arc::new(TlsContext::load(tls)?)),
        None => {
            tracing::warn!("No [tls] section configured, accepting plaintext only");
            None
        }
    };

    let service: Arc<dyn Service> = Arc::new(EchoService);
    let resolver: Arc<dyn Resolver> = Arc::new(SystemResolver::new(config.resolver.timeout()));

    let reactor = Reactor::new(&config.reactor)?.spawn()?;
    let acceptor =
        MultiProtocolAcceptor::bind(reactor.handle(), &config.listener, &config.detection)?;

    if let Some(context) = tls {
        acceptor.add_detector(Arc::new(TlsDetector::new(
            context,
            config.handshake.clone(),
            resolver,
            service.clone(),
        )));
    }
    acceptor.add_detector(Arc::new(MarkerDetector::new(
        &config.detection.markers,
        service,
    )));

    tracing::info!(
        address = %acceptor.local_addr(),
        detectors = acceptor.detectors().len(),
        "Accepting connections"
    );

    let signal = shutdown_signal().await;
    tracing::info!(signal, "Shutdown signal received");

    acceptor.stop();
    reactor.stop();
    tokio::task::spawn_blocking(move || reactor.join()).await??;

    tracing::info!("Shutdown complete");
    Ok(())
}
