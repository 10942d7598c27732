//! Reverse name resolution for peer identity checks.
//!
//! # Responsibilities
//! - Map a peer IP address to the host entry published for it
//! - Bound every lookup with a timeout (lookups run on the reactor thread)
//! - Report failures as typed outcomes instead of swallowing them
//!
//! # Design Decisions
//! - `Resolver` is a trait so tests substitute a `StaticResolver`
//! - The system lookup runs on a short-lived worker thread; the caller waits
//!   at most `timeout` and abandons the worker afterwards

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Host entry returned by a reverse lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    /// Canonical host name.
    pub hostname: String,
    /// Additional names published for the address.
    pub aliases: Vec<String>,
}

impl HostEntry {
    /// Iterate over the canonical name followed by every alias.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.hostname.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// Errors produced by reverse lookups.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No PTR record exists for the address.
    #[error("no host name found for {0}")]
    NotFound(IpAddr),

    /// The resolver did not answer in time.
    #[error("reverse lookup of {addr} timed out after {after:?}")]
    Timeout { addr: IpAddr, after: Duration },

    /// Resolver failure other than a missing record.
    #[error("reverse lookup of {addr} failed: {reason}")]
    Lookup { addr: IpAddr, reason: String },
}

/// Source of reverse lookups.
pub trait Resolver: Send + Sync {
    /// Look up the host entry for `addr`.
    fn reverse(&self, addr: IpAddr) -> Result<HostEntry, ResolveError>;
}

/// Resolver backed by the operating system (`getnameinfo`), with a timeout.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    /// Create a resolver that gives up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Configured lookup timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl Resolver for SystemResolver {
    fn reverse(&self, addr: IpAddr) -> Result<HostEntry, ResolveError> {
        run_with_timeout(addr, self.timeout, move || lookup_host_entry(addr))
    }
}

/// Run `lookup` on a worker thread and wait at most `timeout` for its answer.
pub(crate) fn run_with_timeout<F>(
    addr: IpAddr,
    timeout: Duration,
    lookup: F,
) -> Result<HostEntry, ResolveError>
where
    F: FnOnce() -> Result<HostEntry, ResolveError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("reverse-lookup".to_string())
        .spawn(move || {
            // The receiver may already be gone after a timeout.
            let _ = tx.send(lookup());
        })
        .map_err(|e| ResolveError::Lookup {
            addr,
            reason: format!("failed to spawn lookup worker: {}", e),
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(ResolveError::Timeout {
            addr,
            after: timeout,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(ResolveError::Lookup {
            addr,
            reason: "lookup worker exited without an answer".to_string(),
        }),
    }
}

fn lookup_host_entry(addr: IpAddr) -> Result<HostEntry, ResolveError> {
    let hostname = reverse_name(addr)?;
    Ok(HostEntry {
        hostname,
        aliases: Vec::new(),
    })
}

#[cfg(unix)]
fn reverse_name(addr: IpAddr) -> Result<String, ResolveError> {
    use std::ffi::CStr;
    use std::mem;

    const HOST_BUF_LEN: usize = 1025;

    // SAFETY: sockaddr_storage is plain old data; zeroed is a valid value and
    // is large and aligned enough for both sockaddr_in and sockaddr_in6.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        IpAddr::V4(v4) => {
            // SAFETY: see above.
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        IpAddr::V6(v6) => {
            // SAFETY: see above.
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_addr.s6_addr = v6.octets();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    let mut host = [0 as libc::c_char; HOST_BUF_LEN];
    // SAFETY: storage holds an initialized socket address of `len` bytes and
    // host is a writable buffer of the advertised length.
    let rc = unsafe {
        libc::getnameinfo(
            &storage as *const _ as *const libc::sockaddr,
            len as libc::socklen_t,
            host.as_mut_ptr(),
            HOST_BUF_LEN as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };

    match rc {
        0 => {
            // SAFETY: getnameinfo NUL-terminates the host buffer on success.
            let name = unsafe { CStr::from_ptr(host.as_ptr()) };
            Ok(name.to_string_lossy().into_owned())
        }
        libc::EAI_NONAME => Err(ResolveError::NotFound(addr)),
        code => {
            // SAFETY: gai_strerror returns a pointer to a static string.
            let reason = unsafe { CStr::from_ptr(libc::gai_strerror(code)) }
                .to_string_lossy()
                .into_owned();
            Err(ResolveError::Lookup { addr, reason })
        }
    }
}

#[cfg(not(unix))]
fn reverse_name(addr: IpAddr) -> Result<String, ResolveError> {
    Err(ResolveError::Lookup {
        addr,
        reason: "reverse lookup is not supported on this platform".to_string(),
    })
}

/// In-memory resolver with fixed host entries.
///
/// A lookup of any address listed for an entry returns that entry, the way
/// a host table maps every address of a multi-homed host to one name.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<IpAddr, HostEntry>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `hostname` for every address in `addresses`.
    pub fn with_host(mut self, hostname: &str, addresses: &[IpAddr]) -> Self {
        let entry = HostEntry {
            hostname: hostname.to_string(),
            aliases: Vec::new(),
        };
        for addr in addresses {
            self.entries.insert(*addr, entry.clone());
        }
        self
    }

    /// Add an alias to the entry that owns `addr`, and so to every address
    /// published for the same host.
    pub fn with_alias(mut self, addr: IpAddr, alias: &str) -> Self {
        let Some(hostname) = self.entries.get(&addr).map(|e| e.hostname.clone()) else {
            return self;
        };
        for entry in self.entries.values_mut() {
            if entry.hostname == hostname {
                entry.aliases.push(alias.to_string());
            }
        }
        self
    }
}

impl Resolver for StaticResolver {
    fn reverse(&self, addr: IpAddr) -> Result<HostEntry, ResolveError> {
        self.entries
            .get(&addr)
            .cloned()
            .ok_or(ResolveError::NotFound(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn static_resolver_maps_every_listed_address() {
        let resolver =
            StaticResolver::new().with_host("example.com", &[ip("10.0.0.1"), ip("10.0.0.2")]);

        let entry = resolver.reverse(ip("10.0.0.2")).unwrap();
        assert_eq!(entry.hostname, "example.com");
        assert_eq!(resolver.reverse(ip("10.0.0.1")).unwrap(), entry);
        assert!(matches!(
            resolver.reverse(ip("10.0.0.3")),
            Err(ResolveError::NotFound(_))
        ));
    }

    #[test]
    fn aliases_are_shared_across_addresses() {
        let resolver = StaticResolver::new()
            .with_host("node1.lab", &[ip("10.0.0.1"), ip("10.0.0.2")])
            .with_alias(ip("10.0.0.1"), "node1");

        let entry = resolver.reverse(ip("10.0.0.2")).unwrap();
        let names: Vec<&str> = entry.names().collect();
        assert_eq!(names, vec!["node1.lab", "node1"]);
    }

    #[test]
    fn slow_lookup_times_out() {
        let addr = ip("10.0.0.9");
        let result = run_with_timeout(addr, Duration::from_millis(50), move || {
            thread::sleep(Duration::from_millis(500));
            Ok(HostEntry {
                hostname: "late.example".to_string(),
                aliases: Vec::new(),
            })
        });

        assert!(matches!(result, Err(ResolveError::Timeout { .. })));
    }

    #[test]
    fn fast_lookup_returns_worker_answer() {
        let addr = ip("10.0.0.9");
        let result = run_with_timeout(addr, Duration::from_secs(5), move || {
            Err(ResolveError::NotFound(addr))
        });

        assert!(matches!(result, Err(ResolveError::NotFound(a)) if a == addr));
    }
}
