//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, non-blocking accept socket)
//!     → reactor.rs (readiness dispatch on one thread)
//!     → connection.rs (id, pending tracking, replayed detection bytes)
//!     → tls.rs + handshake.rs (when the first byte is a TLS record)
//!     → Hand off to the application service
//!
//! Connection States:
//!     Pending → [Handshaking → Verified] → Established | Closed
//! ```
//!
//! # Design Decisions
//! - Bounded pending set prevents resource exhaustion
//! - Every socket is owned by exactly one reactor handler at a time
//! - TLS is optional and handled transparently

pub mod connection;
pub mod handshake;
pub mod listener;
pub mod reactor;
pub mod tls;
