//! Recording collaborators.
//!
//! [`RecordingProvider`] builds stub subsystems that append every lifecycle
//! call to a shared [`Journal`], so tests can assert on ordering. Any stage
//! can be told to fail with [`RecordingProvider::fail_at`].
//!
//! The resolver and timer stubs wrap the real `ResolverChannel` and
//! `TimerStore`; the multiplexer keeps an in-memory registration table
//! instead of an OS poller.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netengine_config::{DnsConfig, TimerConfig, TlsConfig};
use netengine_core::entropy::EntropySource;
use netengine_core::multiplexer::descriptor_of;
use netengine_core::resolver::{ResolveCallback, ResolverChannel};
use netengine_core::timer::{TimerStore, TimerSubsystem};
use netengine_core::{
    BorrowedDescriptor, DnsResolver, EngineError, EventBackend, EventMultiplexer, Interest,
    QueryId, RawDescriptor, SubsystemProvider, TimerId, TimerKind, TlsClientContext, TlsError,
    TlsProvider,
};

/// One collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Bootstrap,
    TimersInit,
    TimersDestroyAll(usize),
    DnsLibraryInit,
    DnsLibraryCleanup,
    ResolverInit,
    ResolverCancelAll(usize),
    ResolverDestroy { sockets: usize },
    TlsLibraryInit,
    TlsLibraryDestroy,
    TlsContextCreate(u64),
    TlsShutdown(u64),
    TlsDestroy(u64),
    MultiplexerInit(EventBackend),
    Register(RawDescriptor),
    Deregister(RawDescriptor),
    MultiplexerDestroy { remaining: usize },
    EntropyOpen(PathBuf),
    EntropyClose,
}

/// Stage a [`RecordingProvider`] can be told to fail at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailAt {
    Bootstrap,
    DnsLibrary,
    Resolver,
    TlsLibrary,
    TlsContext,
    Multiplexer,
    Entropy,
}

/// Ordered, shared record of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Journal {
    pub fn record(&self, call: Call) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    /// Snapshot of every call so far.
    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Index of the first call matching `pred`.
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls().iter().position(pred)
    }

    /// Index of the first call equal to `call`.
    pub fn index_of(&self, call: &Call) -> Option<usize> {
        self.position(|c| c == call)
    }

    pub fn contains(&self, call: &Call) -> bool {
        self.index_of(call).is_some()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

/// Provider of recording stubs.
#[derive(Debug, Clone, Default)]
pub struct RecordingProvider {
    journal: Journal,
    failures: HashSet<FailAt>,
    registrations: Arc<Mutex<HashMap<RawDescriptor, Interest>>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stage` fail when the engine reaches it.
    pub fn fail_at(mut self, stage: FailAt) -> Self {
        self.failures.insert(stage);
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Descriptors currently in the stub multiplexer's table.
    pub fn registered_descriptors(&self) -> Vec<RawDescriptor> {
        self.registrations
            .lock()
            .map(|table| table.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn into_shared(self) -> Rc<dyn SubsystemProvider> {
        Rc::new(self)
    }

    fn fails(&self, stage: FailAt) -> bool {
        self.failures.contains(&stage)
    }
}

fn injected(stage: FailAt) -> io::Error {
    io::Error::other(format!("injected failure at {stage:?}"))
}

impl SubsystemProvider for RecordingProvider {
    fn name(&self) -> &str {
        "recording"
    }

    fn bootstrap(&self) -> Result<(), EngineError> {
        self.journal.record(Call::Bootstrap);
        if self.fails(FailAt::Bootstrap) {
            return Err(EngineError::PlatformBootstrap(
                injected(FailAt::Bootstrap).to_string(),
            ));
        }
        Ok(())
    }

    fn timers(&self, config: &TimerConfig) -> Box<dyn TimerSubsystem> {
        self.journal.record(Call::TimersInit);
        Box::new(RecordingTimers {
            inner: TimerStore::new(config.low_resolution),
            journal: self.journal.clone(),
        })
    }

    fn dns_library_init(&self) -> io::Result<()> {
        if self.fails(FailAt::DnsLibrary) {
            return Err(injected(FailAt::DnsLibrary));
        }
        self.journal.record(Call::DnsLibraryInit);
        Ok(())
    }

    fn resolver(&self, config: &DnsConfig) -> io::Result<Box<dyn DnsResolver>> {
        if self.fails(FailAt::Resolver) {
            return Err(injected(FailAt::Resolver));
        }
        let nameservers = config
            .socket_addrs()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.journal.record(Call::ResolverInit);
        Ok(Box::new(RecordingResolver {
            inner: ResolverChannel::new(nameservers, config.max_sockets),
            journal: self.journal.clone(),
        }))
    }

    fn dns_library_cleanup(&self) {
        self.journal.record(Call::DnsLibraryCleanup);
    }

    fn tls(&self, _config: &TlsConfig) -> Arc<dyn TlsProvider> {
        Arc::new(RecordingTls {
            journal: self.journal.clone(),
            fail_library: self.fails(FailAt::TlsLibrary),
            fail_context: self.fails(FailAt::TlsContext),
        })
    }

    fn multiplexer(&self, backend: EventBackend) -> io::Result<Box<dyn EventMultiplexer>> {
        if self.fails(FailAt::Multiplexer) {
            return Err(injected(FailAt::Multiplexer));
        }
        self.journal.record(Call::MultiplexerInit(backend));
        Ok(Box::new(RecordingMultiplexer {
            backend,
            table: Arc::clone(&self.registrations),
            journal: self.journal.clone(),
        }))
    }

    fn entropy(&self, device: &Path) -> io::Result<Box<dyn EntropySource>> {
        if self.fails(FailAt::Entropy) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", device.display()),
            ));
        }
        self.journal.record(Call::EntropyOpen(device.to_path_buf()));
        Ok(Box::new(RecordingEntropy {
            device: device.to_path_buf(),
            next: 0,
            journal: self.journal.clone(),
        }))
    }
}

// ── Stubs ───────────────────────────────────────────────────────────────

struct RecordingTimers {
    inner: TimerStore,
    journal: Journal,
}

impl TimerSubsystem for RecordingTimers {
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        self.inner.schedule(delay, kind)
    }

    fn cancel(&mut self, id: TimerId) -> bool {
        self.inner.cancel(id)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn low_resolution(&self) -> bool {
        self.inner.low_resolution()
    }

    fn destroy_all(&mut self) -> usize {
        let dropped = self.inner.destroy_all();
        self.journal.record(Call::TimersDestroyAll(dropped));
        dropped
    }
}

struct RecordingResolver {
    inner: ResolverChannel,
    journal: Journal,
}

impl DnsResolver for RecordingResolver {
    fn nameservers(&self) -> &[SocketAddr] {
        self.inner.nameservers()
    }

    fn submit(&mut self, hostname: &str, on_done: ResolveCallback) -> QueryId {
        self.inner.submit(hostname, on_done)
    }

    fn complete(&mut self, id: QueryId, addrs: Vec<IpAddr>) -> bool {
        self.inner.complete(id, addrs)
    }

    fn pending(&self) -> usize {
        self.inner.pending()
    }

    fn open_socket(
        &mut self,
        nameserver: SocketAddr,
        mux: &mut dyn EventMultiplexer,
    ) -> io::Result<RawDescriptor> {
        self.inner.open_socket(nameserver, mux)
    }

    fn sockets(&self) -> Vec<RawDescriptor> {
        self.inner.sockets()
    }

    fn cancel_all(&mut self) -> usize {
        let cancelled = self.inner.cancel_all();
        self.journal.record(Call::ResolverCancelAll(cancelled));
        cancelled
    }

    fn destroy(self: Box<Self>, mux: Option<&mut dyn EventMultiplexer>) {
        let RecordingResolver { inner, journal } = *self;
        journal.record(Call::ResolverDestroy {
            sockets: inner.sockets().len(),
        });
        Box::new(inner).destroy(mux);
    }
}

struct RecordingTls {
    journal: Journal,
    fail_library: bool,
    fail_context: bool,
}

impl TlsProvider for RecordingTls {
    fn library_init(&self) -> Result<(), TlsError> {
        if self.fail_library {
            return Err(TlsError::Library("injected failure".to_string()));
        }
        self.journal.record(Call::TlsLibraryInit);
        Ok(())
    }

    fn library_destroy(&self) {
        self.journal.record(Call::TlsLibraryDestroy);
    }

    fn create_global_client_context(&self) -> Result<TlsClientContext, TlsError> {
        if self.fail_context {
            return Err(TlsError::Library("injected client context failure".to_string()));
        }
        let ctx = TlsClientContext::detached();
        self.journal.record(Call::TlsContextCreate(ctx.id()));
        Ok(ctx)
    }

    fn shutdown(&self, ctx: &TlsClientContext) {
        self.journal.record(Call::TlsShutdown(ctx.id()));
    }

    fn destroy(&self, ctx: TlsClientContext) {
        self.journal.record(Call::TlsDestroy(ctx.id()));
    }
}

struct RecordingMultiplexer {
    backend: EventBackend,
    table: Arc<Mutex<HashMap<RawDescriptor, Interest>>>,
    journal: Journal,
}

impl RecordingMultiplexer {
    fn with_table<R>(&self, f: impl FnOnce(&mut HashMap<RawDescriptor, Interest>) -> R) -> R {
        let mut table = self
            .table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut table)
    }
}

impl EventMultiplexer for RecordingMultiplexer {
    fn backend(&self) -> EventBackend {
        self.backend
    }

    fn register(&mut self, source: BorrowedDescriptor<'_>, interest: Interest) -> io::Result<()> {
        let fd = descriptor_of(&source);
        let inserted = self.with_table(|t| t.insert(fd, interest).is_none());
        if !inserted {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} is already registered"),
            ));
        }
        self.journal.record(Call::Register(fd));
        Ok(())
    }

    fn deregister(&mut self, fd: RawDescriptor) -> io::Result<()> {
        if self.with_table(|t| t.remove(&fd)).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {fd} is not registered"),
            ));
        }
        self.journal.record(Call::Deregister(fd));
        Ok(())
    }

    fn is_registered(&self, fd: RawDescriptor) -> bool {
        self.with_table(|t| t.contains_key(&fd))
    }

    fn registered(&self) -> usize {
        self.with_table(|t| t.len())
    }

    fn destroy(self: Box<Self>) -> io::Result<()> {
        let remaining = self.with_table(|t| {
            let n = t.len();
            t.clear();
            n
        });
        self.journal.record(Call::MultiplexerDestroy { remaining });
        Ok(())
    }
}

struct RecordingEntropy {
    device: PathBuf,
    next: u8,
    journal: Journal,
}

impl EntropySource for RecordingEntropy {
    fn device(&self) -> &Path {
        &self.device
    }

    fn fill(&mut self, buf: &mut [u8]) -> io::Result<()> {
        for byte in buf {
            *byte = self.next;
            self.next = self.next.wrapping_add(1);
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.journal.record(Call::EntropyClose);
        Ok(())
    }
}
