//! Asynchronous DNS resolver channel and its socket set.
//!
//! The wire protocol is not implemented here: a transport drives queries
//! through [`DnsResolver::complete`]. What the engine context owns is the
//! channel (pending queries and nameservers) and the socket set, whose
//! sockets are also registered with the event multiplexer.
//!
//! # Teardown
//! ```text
//! cancel_all()            every pending callback sees ResolveOutcome::Cancelled
//!   → destroy(mux)        SocketSet::release: deregister each fd, then close
//!   → library_cleanup()   last context in the process drops the shared state
//! ```
//!
//! Deregistration is part of [`SocketSet::release`], so a socket cannot be
//! closed while the multiplexer still indexes it.

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use netengine_config::DNS_PORT;
use tracing::{debug, warn};

use crate::library::SharedLibrary;
use crate::multiplexer::{
    EventMultiplexer, Interest, RawDescriptor, borrow_descriptor, descriptor_of,
};

/// Completion callback for a submitted query.
pub type ResolveCallback = Box<dyn FnOnce(ResolveOutcome)>;

/// Result delivered to a query callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The transport produced addresses for the hostname.
    Resolved(Vec<IpAddr>),
    /// The channel was cancelled before an answer arrived.
    Cancelled,
}

/// Identifier of a submitted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query#{}", self.0)
    }
}

/// Lifecycle contract for the resolver.
pub trait DnsResolver {
    /// Nameservers this channel queries.
    fn nameservers(&self) -> &[SocketAddr];

    /// Queue a lookup for `hostname`.
    fn submit(&mut self, hostname: &str, on_done: ResolveCallback) -> QueryId;

    /// Deliver an answer for `id`. Returns `false` if the query is no longer
    /// pending.
    fn complete(&mut self, id: QueryId, addrs: Vec<IpAddr>) -> bool;

    /// Number of in-flight queries.
    fn pending(&self) -> usize;

    /// Open a socket to `nameserver`, add it to the socket set and register
    /// it with `mux`.
    fn open_socket(
        &mut self,
        nameserver: SocketAddr,
        mux: &mut dyn EventMultiplexer,
    ) -> io::Result<RawDescriptor>;

    /// Descriptors currently in the socket set, in insertion order.
    fn sockets(&self) -> Vec<RawDescriptor>;

    /// Cancel every in-flight query. Returns the number cancelled.
    fn cancel_all(&mut self) -> usize;

    /// Deregister and close every socket, then destroy the channel.
    ///
    /// `mux` is `None` only when the multiplexer was never created, in which
    /// case no socket can have been registered.
    fn destroy(self: Box<Self>, mux: Option<&mut dyn EventMultiplexer>);
}

#[derive(Debug)]
struct ResolverSocket {
    fd: RawDescriptor,
    nameserver: SocketAddr,
    _socket: UdpSocket,
}

/// Resolver-owned sockets, each mirrored by a multiplexer registration.
#[derive(Debug, Default)]
pub struct SocketSet {
    entries: Vec<ResolverSocket>,
}

impl SocketSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> Vec<RawDescriptor> {
        self.entries.iter().map(|e| e.fd).collect()
    }

    /// Nameserver the socket `fd` is connected to.
    pub fn nameserver_of(&self, fd: RawDescriptor) -> Option<SocketAddr> {
        self.entries
            .iter()
            .find(|e| e.fd == fd)
            .map(|e| e.nameserver)
    }

    fn push(&mut self, socket: UdpSocket, nameserver: SocketAddr) -> RawDescriptor {
        let fd = descriptor_of(&socket);
        self.entries.push(ResolverSocket {
            fd,
            nameserver,
            _socket: socket,
        });
        fd
    }

    /// Remove every socket's multiplexer registration, then close the
    /// sockets. Returns the number closed.
    pub fn release(mut self, mux: Option<&mut dyn EventMultiplexer>) -> usize {
        let entries = std::mem::take(&mut self.entries);
        match mux {
            Some(mux) => {
                for entry in &entries {
                    if let Err(e) = mux.deregister(entry.fd) {
                        warn!(fd = entry.fd, error = %e, "failed to deregister resolver socket");
                    }
                }
            }
            None if !entries.is_empty() => {
                warn!(
                    sockets = entries.len(),
                    "releasing resolver sockets without a multiplexer"
                );
            }
            None => {}
        }
        entries.len()
    }
}

impl Drop for SocketSet {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                sockets = self.entries.len(),
                "resolver socket set dropped without deregistration"
            );
        }
    }
}

struct PendingQuery {
    id: QueryId,
    hostname: String,
    on_done: ResolveCallback,
}

/// Default resolver channel.
pub struct ResolverChannel {
    nameservers: Vec<SocketAddr>,
    max_sockets: usize,
    sockets: SocketSet,
    queries: Vec<PendingQuery>,
    next_query: u64,
}

impl ResolverChannel {
    pub fn new(nameservers: Vec<SocketAddr>, max_sockets: usize) -> Self {
        debug!(
            nameservers = nameservers.len(),
            max_sockets, "resolver channel initialized"
        );
        Self {
            nameservers,
            max_sockets,
            sockets: SocketSet::default(),
            queries: Vec::new(),
            next_query: 0,
        }
    }

    /// The socket set backing this channel.
    pub fn socket_set(&self) -> &SocketSet {
        &self.sockets
    }

    /// Hostnames of the in-flight queries, oldest first.
    pub fn pending_hostnames(&self) -> impl Iterator<Item = &str> {
        self.queries.iter().map(|q| q.hostname.as_str())
    }
}

impl DnsResolver for ResolverChannel {
    fn nameservers(&self) -> &[SocketAddr] {
        &self.nameservers
    }

    fn submit(&mut self, hostname: &str, on_done: ResolveCallback) -> QueryId {
        self.next_query += 1;
        let id = QueryId(self.next_query);
        self.queries.push(PendingQuery {
            id,
            hostname: hostname.to_string(),
            on_done,
        });
        debug!(%id, hostname, "query submitted");
        id
    }

    fn complete(&mut self, id: QueryId, addrs: Vec<IpAddr>) -> bool {
        let Some(pos) = self.queries.iter().position(|q| q.id == id) else {
            return false;
        };
        let query = self.queries.remove(pos);
        debug!(%id, hostname = %query.hostname, answers = addrs.len(), "query completed");
        (query.on_done)(ResolveOutcome::Resolved(addrs));
        true
    }

    fn pending(&self) -> usize {
        self.queries.len()
    }

    fn open_socket(
        &mut self,
        nameserver: SocketAddr,
        mux: &mut dyn EventMultiplexer,
    ) -> io::Result<RawDescriptor> {
        if self.sockets.len() >= self.max_sockets {
            return Err(io::Error::other(format!(
                "resolver socket set is full ({} sockets)",
                self.max_sockets
            )));
        }

        let local: SocketAddr = if nameserver.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        socket.connect(nameserver)?;

        // Register before inserting so a failed registration never leaves an
        // unregistered socket in the set.
        mux.register(borrow_descriptor(&socket), Interest::READABLE)?;
        let fd = self.sockets.push(socket, nameserver);
        debug!(fd, %nameserver, "resolver socket opened");
        Ok(fd)
    }

    fn sockets(&self) -> Vec<RawDescriptor> {
        self.sockets.descriptors()
    }

    fn cancel_all(&mut self) -> usize {
        let queries = std::mem::take(&mut self.queries);
        let cancelled = queries.len();
        for query in queries {
            (query.on_done)(ResolveOutcome::Cancelled);
        }
        cancelled
    }

    fn destroy(self: Box<Self>, mux: Option<&mut dyn EventMultiplexer>) {
        let ResolverChannel {
            sockets, queries, ..
        } = *self;
        if !queries.is_empty() {
            warn!(
                pending = queries.len(),
                "resolver destroyed with pending queries; callbacks dropped"
            );
        }
        let closed = sockets.release(mux);
        debug!(closed, "resolver channel destroyed");
    }
}

// ── Process-wide resolver state ─────────────────────────────────────────

static DNS_LIBRARY: SharedLibrary<Arc<Vec<SocketAddr>>> = SharedLibrary::new("dns");

/// Take a reference on the process-wide resolver state, reading the system
/// nameserver list on first use.
pub fn library_init() -> Arc<Vec<SocketAddr>> {
    let Ok(servers) = DNS_LIBRARY.acquire(|| Ok::<_, Infallible>(Arc::new(read_system_nameservers())));
    servers
}

/// Drop a reference on the process-wide resolver state.
pub fn library_cleanup() {
    DNS_LIBRARY.release();
}

/// Nameservers discovered by [`library_init`], or empty if uninitialized.
pub fn system_nameservers() -> Vec<SocketAddr> {
    DNS_LIBRARY
        .current()
        .map(|servers| servers.as_ref().clone())
        .unwrap_or_default()
}

/// Number of engine contexts currently holding the resolver library.
pub fn library_users() -> usize {
    DNS_LIBRARY.users()
}

#[cfg(unix)]
fn read_system_nameservers() -> Vec<SocketAddr> {
    match std::fs::read_to_string("/etc/resolv.conf") {
        Ok(text) => parse_resolv_conf(&text),
        Err(e) => {
            warn!(error = %e, "could not read /etc/resolv.conf; no default nameservers");
            Vec::new()
        }
    }
}

#[cfg(not(unix))]
fn read_system_nameservers() -> Vec<SocketAddr> {
    Vec::new()
}

/// Extract `nameserver` entries from resolv.conf text.
pub fn parse_resolv_conf(text: &str) -> Vec<SocketAddr> {
    text.lines()
        .filter_map(|line| {
            let line = line.split(['#', ';']).next()?.trim();
            let mut fields = line.split_whitespace();
            if fields.next()? != "nameserver" {
                return None;
            }
            fields.next()?.parse::<IpAddr>().ok()
        })
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::multiplexer::{EventBackend, PollMultiplexer};

    fn loopback_ns() -> SocketAddr {
        "127.0.0.1:53".parse().unwrap()
    }

    fn recorder() -> (Rc<RefCell<Vec<ResolveOutcome>>>, impl Fn() -> ResolveCallback) {
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&outcomes);
        let make = move || -> ResolveCallback {
            let sink = Rc::clone(&sink);
            Box::new(move |outcome| sink.borrow_mut().push(outcome))
        };
        (outcomes, make)
    }

    #[test]
    fn test_parse_resolv_conf() {
        let text = "\
            # generated\n\
            search example.com\n\
            nameserver 10.0.0.2\n\
            nameserver   2001:db8::53 # secondary\n\
            nameserver not-an-ip\n\
            ; nameserver 10.9.9.9\n\
            options ndots:2\n";
        let servers = parse_resolv_conf(text);
        assert_eq!(
            servers,
            vec![
                "10.0.0.2:53".parse::<SocketAddr>().unwrap(),
                "[2001:db8::53]:53".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_cancel_all_completes_every_query() {
        let (outcomes, make) = recorder();
        let mut channel = ResolverChannel::new(vec![loopback_ns()], 4);

        channel.submit("a.example", make());
        channel.submit("b.example", make());
        assert_eq!(channel.pending(), 2);
        assert_eq!(
            channel.pending_hostnames().collect::<Vec<_>>(),
            vec!["a.example", "b.example"]
        );

        assert_eq!(channel.cancel_all(), 2);
        assert_eq!(channel.pending(), 0);
        assert_eq!(
            *outcomes.borrow(),
            vec![ResolveOutcome::Cancelled, ResolveOutcome::Cancelled]
        );
        assert_eq!(channel.cancel_all(), 0);
    }

    #[test]
    fn test_complete_delivers_answer_once() {
        let (outcomes, make) = recorder();
        let mut channel = ResolverChannel::new(Vec::new(), 4);
        let id = channel.submit("host.example", make());
        let addr: IpAddr = "192.0.2.7".parse().unwrap();

        assert!(channel.complete(id, vec![addr]));
        assert!(!channel.complete(id, vec![addr]));
        assert_eq!(*outcomes.borrow(), vec![ResolveOutcome::Resolved(vec![addr])]);
    }

    #[test]
    fn test_open_socket_registers_with_multiplexer() {
        let mut mux = PollMultiplexer::new(EventBackend::compiled()).unwrap();
        let mut channel = ResolverChannel::new(vec![loopback_ns()], 4);

        let fd = channel.open_socket(loopback_ns(), &mut mux).unwrap();
        assert!(mux.is_registered(fd));
        assert_eq!(channel.sockets(), vec![fd]);
        assert_eq!(channel.socket_set().nameserver_of(fd), Some(loopback_ns()));

        Box::new(channel).destroy(Some(&mut mux));
        assert!(!mux.is_registered(fd));
        assert_eq!(mux.registered(), 0);
    }

    #[test]
    fn test_socket_limit_is_enforced() {
        let mut mux = PollMultiplexer::new(EventBackend::compiled()).unwrap();
        let mut channel = ResolverChannel::new(vec![loopback_ns()], 1);

        channel.open_socket(loopback_ns(), &mut mux).unwrap();
        assert!(channel.open_socket(loopback_ns(), &mut mux).is_err());
        assert_eq!(mux.registered(), 1);

        Box::new(channel).destroy(Some(&mut mux));
        assert_eq!(mux.registered(), 0);
    }

    #[test]
    fn test_release_without_multiplexer_closes_sockets() {
        let channel = ResolverChannel::new(Vec::new(), 1);
        assert!(channel.socket_set().is_empty());
        Box::new(channel).destroy(None);
    }

    #[test]
    fn test_library_refcount() {
        let servers = library_init();
        assert!(library_users() >= 1);
        assert_eq!(system_nameservers().len(), servers.len());
        library_cleanup();
    }

    #[test]
    fn test_query_id_display() {
        assert_eq!(QueryId(3).to_string(), "query#3");
    }
}
