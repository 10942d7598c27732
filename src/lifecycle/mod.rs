//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Logging/metrics → TLS context
//!     → Reactor thread → Acceptor + detectors
//!
//! Shutdown:
//!     SIGTERM/SIGINT (signals.rs) → Stop acceptor → Stop reactor → Join
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then the listener
//! - Ordered shutdown: stop accepting before closing established sessions

pub mod signals;

pub use signals::shutdown_signal;
