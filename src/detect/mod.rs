//! Protocol detection subsystem.
//!
//! # Data Flow
//! ```text
//! accepted socket
//!     → acceptor.rs (pending record: buffer, deadline, detector snapshot)
//!     → classify() over the registry, in registration order
//!     → first Match: detector.handle_socket(raw + replayed bytes)
//!     → no match within budget: closed as unrecognized
//! ```
//!
//! # Design Decisions
//! - Detectors are stateless; per-connection state lives in the acceptor
//! - The registry is a lock-free snapshot, so detectors can be added or
//!   removed from any thread without pausing the reactor
//! - A detector asking for more bytes keeps its priority over later ones

pub mod acceptor;
pub mod builtin;

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::net::connection::RawConnection;
use crate::net::reactor::{Handler, HandlerError};

pub use acceptor::{AcceptorError, MultiProtocolAcceptor};
pub use builtin::{MarkerDetector, TlsDetector};

/// Result of testing a byte prefix against one detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The prefix is this detector's protocol.
    Match,
    /// The prefix can never be this detector's protocol.
    NoMatch,
    /// Undecided until more bytes arrive.
    NeedMore,
}

/// Signature test plus factory for one wire protocol.
pub trait ProtocolDetector: Send + Sync {
    /// Protocol label for logs and metrics.
    fn name(&self) -> &'static str;

    /// Bytes this detector may need before it can decide.
    fn signature_len(&self) -> usize;

    fn detect(&self, prefix: &[u8]) -> Verdict;

    /// Build the handler that takes over a matched connection.
    ///
    /// Reads on `conn` return the detection bytes first.
    fn handle_socket(&self, conn: RawConnection) -> Result<Box<dyn Handler>, HandlerError>;
}

/// Outcome of classifying a pending connection's buffer.
#[derive(Clone)]
pub enum Classification {
    Matched(Arc<dyn ProtocolDetector>),
    Pending,
    Unrecognized,
}

impl std::fmt::Debug for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Matched(d) => write!(f, "Matched({})", d.name()),
            Classification::Pending => f.write_str("Pending"),
            Classification::Unrecognized => f.write_str("Unrecognized"),
        }
    }
}

/// Test `buf` against `detectors` in order.
///
/// `exhausted` means no further bytes will be read (budget reached or peer
/// closed); a `NeedMore` then counts as `NoMatch`.
pub fn classify(
    detectors: &[Arc<dyn ProtocolDetector>],
    buf: &[u8],
    exhausted: bool,
) -> Classification {
    for detector in detectors {
        match detector.detect(buf) {
            Verdict::Match => return Classification::Matched(detector.clone()),
            Verdict::NeedMore if !exhausted => return Classification::Pending,
            Verdict::NeedMore | Verdict::NoMatch => {}
        }
    }
    Classification::Unrecognized
}

fn same_detector(a: &Arc<dyn ProtocolDetector>, b: &Arc<dyn ProtocolDetector>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Ordered, thread-safe detector list.
pub struct DetectorRegistry {
    detectors: ArcSwap<Vec<Arc<dyn ProtocolDetector>>>,
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            detectors: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Append a detector; it is consulted after those already present.
    pub fn add(&self, detector: Arc<dyn ProtocolDetector>) {
        tracing::debug!(detector = detector.name(), "Protocol detector added");
        self.detectors.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(detector.clone());
            next
        });
    }

    /// Remove a previously added detector. Returns false if it was absent.
    pub fn remove(&self, detector: &Arc<dyn ProtocolDetector>) -> bool {
        let previous = self.detectors.rcu(|current| {
            current
                .iter()
                .filter(|d| !same_detector(d, detector))
                .cloned()
                .collect::<Vec<_>>()
        });
        let removed = previous.iter().any(|d| same_detector(d, detector));
        if removed {
            tracing::debug!(detector = detector.name(), "Protocol detector removed");
        }
        removed
    }

    /// Current detector list, unaffected by later changes.
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn ProtocolDetector>>> {
        self.detectors.load_full()
    }

    pub fn len(&self) -> usize {
        self.detectors.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.load().is_empty()
    }

    /// Longest signature across the current detectors.
    pub fn max_signature_len(&self) -> usize {
        max_signature_len(&self.detectors.load())
    }
}

pub(crate) fn max_signature_len(detectors: &[Arc<dyn ProtocolDetector>]) -> usize {
    detectors
        .iter()
        .map(|d| d.signature_len())
        .max()
        .unwrap_or(0)
}
