//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! reactor, acceptor, detectors, handshakes produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (admission counters)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection ID flows through every log line about a socket
//! - Metrics are cheap (atomic increments); without an installed
//!   recorder they are no-ops

pub mod logging;
pub mod metrics;
