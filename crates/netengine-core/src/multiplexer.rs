//! I/O event multiplexer: backend selection and the descriptor registry.
//!
//! The readiness polling loop itself lives outside the engine context. What
//! the context owns is the backend handle and the table of registered
//! descriptors, which must never outlive the descriptors it indexes.
//!
//! ```text
//! EventBackend::compiled()          (fixed at build time)
//!     → PollMultiplexer::new()      (backend resource: epoll/kqueue/... fd)
//!     → register(fd, interest)      (resolver sockets, connections)
//!     → deregister(fd)              (before the owner closes fd)
//!     → destroy()                   (drop remaining registrations)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;

use polling::{Event, Poller};
use serde::Serialize;
use slab::Slab;
use tracing::debug;

/// OS-level descriptor tracked by the multiplexer.
#[cfg(unix)]
pub type RawDescriptor = std::os::fd::RawFd;

/// OS-level descriptor tracked by the multiplexer.
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawSocket;

/// An open descriptor borrowed from its owner for the length of a call.
#[cfg(unix)]
pub type BorrowedDescriptor<'a> = std::os::fd::BorrowedFd<'a>;

/// An open socket borrowed from its owner for the length of a call.
#[cfg(windows)]
pub type BorrowedDescriptor<'a> = std::os::windows::io::BorrowedSocket<'a>;

/// Raw descriptor of a socket or file owned elsewhere.
#[cfg(unix)]
pub fn descriptor_of<S: std::os::fd::AsRawFd>(source: &S) -> RawDescriptor {
    source.as_raw_fd()
}

/// Raw descriptor of a socket owned elsewhere.
#[cfg(windows)]
pub fn descriptor_of<S: std::os::windows::io::AsRawSocket>(source: &S) -> RawDescriptor {
    source.as_raw_socket()
}

/// Borrow an owned socket or file for [`EventMultiplexer::register`].
#[cfg(unix)]
pub fn borrow_descriptor<S: std::os::fd::AsFd>(source: &S) -> BorrowedDescriptor<'_> {
    source.as_fd()
}

/// Borrow an owned socket for [`EventMultiplexer::register`].
#[cfg(windows)]
pub fn borrow_descriptor<S: std::os::windows::io::AsSocket>(source: &S) -> BorrowedDescriptor<'_> {
    source.as_socket()
}

/// The readiness-notification mechanism compiled into this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventBackend {
    /// No supported mechanism for this target.
    Unknown,
    /// Linux `epoll`.
    Epoll,
    /// BSD/Apple `kqueue`.
    Kqueue,
    /// Portable fallback.
    Select,
}

impl EventBackend {
    /// The backend chosen for the current compilation target.
    ///
    /// Exactly one tag is selected per build; nothing is probed at run time.
    pub const fn compiled() -> Self {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            EventBackend::Epoll
        } else if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )) {
            EventBackend::Kqueue
        } else if cfg!(any(unix, windows)) {
            EventBackend::Select
        } else {
            EventBackend::Unknown
        }
    }
}

impl fmt::Display for EventBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventBackend::Unknown => write!(f, "unknown"),
            EventBackend::Epoll => write!(f, "epoll"),
            EventBackend::Kqueue => write!(f, "kqueue"),
            EventBackend::Select => write!(f, "select"),
        }
    }
}

/// Readiness a registration is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    fn to_event(self, key: usize) -> Event {
        Event::new(key, self.readable, self.writable)
    }
}

/// Lifecycle contract between the engine context and its multiplexer.
///
/// A registered descriptor must be deregistered before its owner closes it.
/// The engine enforces this for resolver sockets by routing their teardown
/// through [`DnsResolver::destroy`](crate::resolver::DnsResolver::destroy).
pub trait EventMultiplexer {
    /// The backend tag this multiplexer was built for.
    fn backend(&self) -> EventBackend;

    /// Add `source` to the registration table, keyed by its raw descriptor.
    ///
    /// Taking a borrow guarantees the descriptor is open when registered.
    /// Its owner must still deregister before closing it.
    fn register(&mut self, source: BorrowedDescriptor<'_>, interest: Interest) -> io::Result<()>;

    /// Remove `fd` from the registration table.
    fn deregister(&mut self, fd: RawDescriptor) -> io::Result<()>;

    /// Whether `fd` currently has a registration.
    fn is_registered(&self, fd: RawDescriptor) -> bool;

    /// Number of live registrations.
    fn registered(&self) -> usize;

    /// Release the backend and drop every remaining registration.
    fn destroy(self: Box<Self>) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    fd: RawDescriptor,
    interest: Interest,
}

/// Multiplexer backed by the OS poller (`epoll`, `kqueue`, event ports,
/// IOCP or `poll`, depending on target).
pub struct PollMultiplexer {
    backend: EventBackend,
    poller: Poller,
    registrations: Slab<Registration>,
    keys: HashMap<RawDescriptor, usize>,
}

impl PollMultiplexer {
    /// Create the backend resource for `backend`.
    pub fn new(backend: EventBackend) -> io::Result<Self> {
        if backend == EventBackend::Unknown {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no event backend is compiled for this target",
            ));
        }
        let poller = Poller::new()?;
        debug!(backend = %backend, "event multiplexer initialized");
        Ok(Self {
            backend,
            poller,
            registrations: Slab::new(),
            keys: HashMap::new(),
        })
    }

    /// Interest recorded for `fd`, if registered.
    pub fn interest(&self, fd: RawDescriptor) -> Option<Interest> {
        self.keys
            .get(&fd)
            .and_then(|key| self.registrations.get(*key))
            .map(|reg| reg.interest)
    }

    fn delete_from_poller(&self, fd: RawDescriptor) -> io::Result<()> {
        // SAFETY: registered descriptors stay open until deregistered; the
        // only callers are `deregister` and `destroy`, both of which run
        // before the owner closes `fd`.
        #[cfg(unix)]
        #[allow(unsafe_code)]
        let source = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        #[cfg(windows)]
        #[allow(unsafe_code)]
        let source = unsafe { std::os::windows::io::BorrowedSocket::borrow_raw(fd) };
        self.poller.delete(source)
    }
}

impl EventMultiplexer for PollMultiplexer {
    fn backend(&self) -> EventBackend {
        self.backend
    }

    fn register(&mut self, source: BorrowedDescriptor<'_>, interest: Interest) -> io::Result<()> {
        let fd = descriptor_of(&source);
        if self.keys.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} is already registered"),
            ));
        }

        let entry = self.registrations.vacant_entry();
        let key = entry.key();
        // SAFETY: `source` is open for this call. The registration is
        // deleted from the poller in `deregister` or `destroy`, and owners
        // deregister before closing.
        #[allow(unsafe_code)]
        unsafe {
            self.poller.add(fd, interest.to_event(key))?;
        }
        entry.insert(Registration { fd, interest });
        self.keys.insert(fd, key);

        debug!(fd, key, ?interest, "descriptor registered");
        Ok(())
    }

    fn deregister(&mut self, fd: RawDescriptor) -> io::Result<()> {
        let key = self.keys.remove(&fd).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {fd} is not registered"),
            )
        })?;
        self.registrations.remove(key);
        debug!(fd, key, "descriptor deregistered");
        self.delete_from_poller(fd)
    }

    fn is_registered(&self, fd: RawDescriptor) -> bool {
        self.keys.contains_key(&fd)
    }

    fn registered(&self) -> usize {
        self.registrations.len()
    }

    fn destroy(mut self: Box<Self>) -> io::Result<()> {
        let mut first_err = None;
        for (_, reg) in self.registrations.iter() {
            if let Err(e) = self.delete_from_poller(reg.fd) {
                debug!(fd = reg.fd, error = %e, "stale registration at destroy");
                first_err.get_or_insert(e);
            }
        }

        let dropped = self.registrations.len();
        self.registrations.clear();
        self.keys.clear();
        debug!(backend = %self.backend, dropped, "event multiplexer destroyed");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use super::*;

    fn socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").unwrap()
    }

    #[test]
    fn test_compiled_backend_matches_target() {
        let backend = EventBackend::compiled();
        if cfg!(target_os = "linux") {
            assert_eq!(backend, EventBackend::Epoll);
        } else if cfg!(target_os = "macos") {
            assert_eq!(backend, EventBackend::Kqueue);
        }
        assert_ne!(backend, EventBackend::Unknown);
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(EventBackend::Unknown.to_string(), "unknown");
        assert_eq!(EventBackend::Epoll.to_string(), "epoll");
        assert_eq!(EventBackend::Kqueue.to_string(), "kqueue");
        assert_eq!(EventBackend::Select.to_string(), "select");
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let result = PollMultiplexer::new(EventBackend::Unknown);
        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(io::ErrorKind::Unsupported)
        );
    }

    #[test]
    fn test_register_and_deregister() {
        let mut mux = PollMultiplexer::new(EventBackend::compiled()).unwrap();
        let sock = socket();
        let fd = descriptor_of(&sock);

        mux.register(borrow_descriptor(&sock), Interest::READABLE).unwrap();
        assert!(mux.is_registered(fd));
        assert_eq!(mux.registered(), 1);
        assert_eq!(mux.interest(fd), Some(Interest::READABLE));

        mux.deregister(fd).unwrap();
        assert!(!mux.is_registered(fd));
        assert_eq!(mux.registered(), 0);
    }

    #[test]
    fn test_double_register_is_rejected() {
        let mut mux = PollMultiplexer::new(EventBackend::compiled()).unwrap();
        let sock = socket();
        let fd = descriptor_of(&sock);

        mux.register(borrow_descriptor(&sock), Interest::READABLE).unwrap();
        let err = mux
            .register(borrow_descriptor(&sock), Interest::BOTH)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(mux.interest(fd), Some(Interest::READABLE));
        mux.deregister(fd).unwrap();
    }

    #[test]
    fn test_deregister_unknown_descriptor() {
        let mut mux = PollMultiplexer::new(EventBackend::compiled()).unwrap();
        let sock = socket();
        let err = mux.deregister(descriptor_of(&sock)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_destroy_drops_remaining_registrations() {
        let mut mux = PollMultiplexer::new(EventBackend::compiled()).unwrap();
        let a = socket();
        let b = socket();
        mux.register(borrow_descriptor(&a), Interest::READABLE).unwrap();
        mux.register(borrow_descriptor(&b), Interest::WRITABLE).unwrap();

        Box::new(mux).destroy().unwrap();
    }
}
