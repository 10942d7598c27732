//! Peer identity verification.
//!
//! Decides whether a name asserted by a peer certificate corresponds to the
//! network address the connection actually came from.
//!
//! # Rules
//! ```text
//! normalize:   ::ffff:a.b.c.d  ==  a.b.c.d
//! ip  vs ip:   equal after normalization
//! ip  vs host: loopback ip → trusted
//!              otherwise reverse lookup of ip; any returned name == host
//! host vs host: equal (ASCII case-insensitive)
//! anything else, or any lookup failure: reject
//! ```
//!
//! # Design Decisions
//! - Comparison is symmetric; argument order never changes the outcome
//! - Lookup failures are typed (`ResolveError`) and only collapsed to
//!   `false` at the comparison boundary, after being logged

pub mod resolver;

use std::net::IpAddr;

pub use resolver::{HostEntry, ResolveError, Resolver, StaticResolver, SystemResolver};

/// A name or address as presented by either side of the comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerName {
    /// IP literal, with IPv4-mapped IPv6 folded into IPv4.
    Addr(IpAddr),
    /// Anything that does not parse as an IP literal.
    Host(String),
}

impl PeerName {
    /// Parse and normalize a name or address string.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);

        match unbracketed.parse::<IpAddr>() {
            Ok(addr) => PeerName::Addr(normalize_addr(addr)),
            Err(_) => PeerName::Host(trimmed.to_string()),
        }
    }
}

/// Fold an IPv4-mapped IPv6 address into its IPv4 form.
pub fn normalize_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Compare two names or addresses, resolving through `resolver` when one
/// side is an address and the other a host name.
pub fn compare_names(lhs: &str, rhs: &str, resolver: &dyn Resolver) -> bool {
    match (PeerName::parse(lhs), PeerName::parse(rhs)) {
        (PeerName::Addr(a), PeerName::Addr(b)) => a == b,
        (PeerName::Host(a), PeerName::Host(b)) => a.eq_ignore_ascii_case(&b),
        (PeerName::Addr(addr), PeerName::Host(host))
        | (PeerName::Host(host), PeerName::Addr(addr)) => {
            if addr.is_loopback() {
                return true;
            }
            resolve_peer(addr, resolver).is_some_and(|entry| entry_matches(&entry, &host))
        }
    }
}

/// True if any of `names` identifies the address `peer`.
///
/// Gives the same answer as calling [`compare_names`] for each name, but
/// reverse-resolves `peer` at most once however many host names there are.
pub fn matches_any(names: &[String], peer: IpAddr, resolver: &dyn Resolver) -> bool {
    let peer = normalize_addr(peer);
    let mut hosts = Vec::new();
    for name in names {
        match PeerName::parse(name) {
            PeerName::Addr(addr) if addr == peer => return true,
            PeerName::Addr(_) => {}
            PeerName::Host(host) => hosts.push(host),
        }
    }

    if hosts.is_empty() {
        return false;
    }
    if peer.is_loopback() {
        return true;
    }
    match resolve_peer(peer, resolver) {
        Some(entry) => hosts.iter().any(|host| entry_matches(&entry, host)),
        None => false,
    }
}

/// Reverse-resolve `addr` and report whether `host` is among its names.
pub fn reverse_matches(
    addr: IpAddr,
    host: &str,
    resolver: &dyn Resolver,
) -> Result<bool, ResolveError> {
    let entry = resolver.reverse(addr)?;
    let matched = entry_matches(&entry, host);
    Ok(matched)
}

/// True if `host` is the canonical name or an alias of `entry`.
pub fn entry_matches(entry: &HostEntry, host: &str) -> bool {
    entry.names().any(|name| name.eq_ignore_ascii_case(host))
}

fn resolve_peer(addr: IpAddr, resolver: &dyn Resolver) -> Option<HostEntry> {
    match resolver.reverse(addr) {
        Ok(entry) => Some(entry),
        Err(ResolveError::NotFound(_)) => {
            tracing::debug!(peer_addr = %addr, "No reverse record for peer address");
            None
        }
        Err(e) => {
            tracing::warn!(peer_addr = %addr, error = %e, "Reverse lookup failed");
            None
        }
    }
}
