//! The per-thread engine context: init, lookup and teardown.
//!
//! ```text
//!  init ─────────────────────────────────────────────────────────────────┐
//!  │ bootstrap → duplicate check → timers → dns library → resolver      │
//!  │   → tls library → tls client context (optional) → multiplexer      │
//!  │   → entropy → logger placeholder → register in thread slot         │
//!  └─────────────────────────────────────────────────────────────────────┘
//!  destroy ──────────────────────────────────────────────────────────────┐
//!  │ cancel queries → resolver (deregister + close sockets)             │
//!  │   → dns library → multiplexer → timers → tls context → tls library │
//!  │   → entropy → logger cleanup → clear thread slot                   │
//!  └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Acquisition goes through [`PartialEngine`]. If any step fails, dropping
//! the guard releases what was acquired so far in teardown order, so a
//! failed `init` leaves neither subsystem state nor a registry entry behind.
//!
//! The context is handed out as `Rc<EngineContext>`, which is `!Send`: a
//! context cannot be destroyed from a thread other than its owner.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use netengine_config::{ConfigError, EngineConfig};
use rustls::ClientConfig;
use serde::Serialize;
use tracing::{Level, debug, info, warn};

use crate::build_info;
use crate::entropy::EntropySource;
use crate::logging::EngineLogger;
use crate::multiplexer::{EventBackend, EventMultiplexer, RawDescriptor};
use crate::provider::{DefaultProvider, SubsystemProvider};
use crate::registry::{RegistryError, ThreadRegistry};
use crate::resolver::{DnsResolver, QueryId, ResolveCallback};
use crate::timer::{TimerId, TimerKind, TimerSubsystem};
use crate::tls::{TlsClientContext, TlsProvider};

/// Errors from the engine lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("platform bootstrap failed: {0}")]
    PlatformBootstrap(String),

    #[error("invalid engine configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{name} initialization failed: {reason}")]
    Subsystem { name: &'static str, reason: String },

    #[error("entropy source {} unavailable: {source}", .device.display())]
    EntropyUnavailable {
        device: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("this thread already owns an engine context")]
    DuplicateContext,

    #[error("TLS global client context unavailable: {0}")]
    TlsContextUnavailable(String),

    #[error("destroy precondition violated: {0}")]
    DestroyPrecondition(&'static str),

    #[error("engine context is not running")]
    NotRunning,

    #[error("engine context is in use by a running callback")]
    Busy,
}

impl EngineError {
    fn subsystem(name: &'static str, err: impl fmt::Display) -> Self {
        EngineError::Subsystem {
            name,
            reason: err.to_string(),
        }
    }
}

/// Lifecycle of one context.
///
/// `Initializing` is only visible inside `init`; a context that fails there
/// ends in `Failed` and is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Initializing,
    Running,
    Destroying,
    Destroyed,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Initializing => write!(f, "initializing"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Destroying => write!(f, "destroying"),
            LifecycleState::Destroyed => write!(f, "destroyed"),
            LifecycleState::Failed => write!(f, "failed"),
        }
    }
}

// ── Subsystems ──────────────────────────────────────────────────────────

/// The collaborators owned by a running context.
pub struct Subsystems {
    timers: Box<dyn TimerSubsystem>,
    resolver: Box<dyn DnsResolver>,
    tls: Option<Arc<dyn TlsProvider>>,
    tls_context: Option<TlsClientContext>,
    multiplexer: Box<dyn EventMultiplexer>,
    entropy: Box<dyn EntropySource>,
}

impl Subsystems {
    pub fn multiplexer(&self) -> &dyn EventMultiplexer {
        self.multiplexer.as_ref()
    }

    pub fn multiplexer_mut(&mut self) -> &mut dyn EventMultiplexer {
        self.multiplexer.as_mut()
    }

    pub fn resolver(&self) -> &dyn DnsResolver {
        self.resolver.as_ref()
    }

    pub fn resolver_mut(&mut self) -> &mut dyn DnsResolver {
        self.resolver.as_mut()
    }

    pub fn timers(&self) -> &dyn TimerSubsystem {
        self.timers.as_ref()
    }

    pub fn timers_mut(&mut self) -> &mut dyn TimerSubsystem {
        self.timers.as_mut()
    }

    pub fn entropy_mut(&mut self) -> &mut dyn EntropySource {
        self.entropy.as_mut()
    }

    pub fn tls_context(&self) -> Option<&TlsClientContext> {
        self.tls_context.as_ref()
    }

    /// Open a resolver socket and register it with this context's
    /// multiplexer.
    pub fn open_resolver_socket(&mut self, nameserver: SocketAddr) -> io::Result<RawDescriptor> {
        self.resolver
            .open_socket(nameserver, self.multiplexer.as_mut())
    }
}

fn as_dyn(mux: &mut Box<dyn EventMultiplexer>) -> &mut dyn EventMultiplexer {
    mux.as_mut()
}

/// Subsystems acquired so far. Releases them in teardown order on drop.
struct PartialEngine {
    provider: Rc<dyn SubsystemProvider>,
    timers: Option<Box<dyn TimerSubsystem>>,
    dns_library: bool,
    resolver: Option<Box<dyn DnsResolver>>,
    tls: Option<Arc<dyn TlsProvider>>,
    tls_context: Option<TlsClientContext>,
    multiplexer: Option<Box<dyn EventMultiplexer>>,
    entropy: Option<Box<dyn EntropySource>>,
}

impl PartialEngine {
    fn new(provider: Rc<dyn SubsystemProvider>) -> Self {
        Self {
            provider,
            timers: None,
            dns_library: false,
            resolver: None,
            tls: None,
            tls_context: None,
            multiplexer: None,
            entropy: None,
        }
    }

    fn from_subsystems(provider: Rc<dyn SubsystemProvider>, subsystems: Subsystems) -> Self {
        Self {
            provider,
            timers: Some(subsystems.timers),
            dns_library: true,
            resolver: Some(subsystems.resolver),
            tls: subsystems.tls,
            tls_context: subsystems.tls_context,
            multiplexer: Some(subsystems.multiplexer),
            entropy: Some(subsystems.entropy),
        }
    }

    /// Hand the acquired set over to a running context.
    fn complete(mut self) -> Result<Subsystems, EngineError> {
        match (
            self.timers.take(),
            self.resolver.take(),
            self.multiplexer.take(),
            self.entropy.take(),
        ) {
            (Some(timers), Some(resolver), Some(multiplexer), Some(entropy)) => {
                self.dns_library = false;
                Ok(Subsystems {
                    timers,
                    resolver,
                    tls: self.tls.take(),
                    tls_context: self.tls_context.take(),
                    multiplexer,
                    entropy,
                })
            }
            (timers, resolver, multiplexer, entropy) => {
                self.timers = timers;
                self.resolver = resolver;
                self.multiplexer = multiplexer;
                self.entropy = entropy;
                Err(EngineError::subsystem("engine", "subsystem set is incomplete"))
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut resolver) = self.resolver.take() {
            let cancelled = resolver.cancel_all();
            debug!(cancelled, "resolver queries cancelled");
            resolver.destroy(self.multiplexer.as_mut().map(as_dyn));
        }
        if std::mem::take(&mut self.dns_library) {
            self.provider.dns_library_cleanup();
            debug!("dns library released");
        }
        if let Some(multiplexer) = self.multiplexer.take() {
            if let Err(e) = multiplexer.destroy() {
                warn!(error = %e, "event multiplexer teardown reported an error");
            }
        }
        if let Some(mut timers) = self.timers.take() {
            let dropped = timers.destroy_all();
            debug!(dropped, "timers released");
        }
        if let Some(tls) = self.tls.take() {
            if let Some(ctx) = self.tls_context.take() {
                tls.shutdown(&ctx);
                tls.destroy(ctx);
            }
            tls.library_destroy();
            debug!("tls library released");
        }
        if let Some(entropy) = self.entropy.take() {
            if let Err(e) = entropy.close() {
                warn!(error = %e, "entropy source close reported an error");
            }
        }
    }
}

impl Drop for PartialEngine {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Engine context ──────────────────────────────────────────────────────

/// Serializable snapshot of a context, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub state: LifecycleState,
    pub backend: EventBackend,
    pub provider: String,
    pub thread: Option<String>,
    pub tls_context: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_unavailable: Option<String>,
    pub entropy_device: PathBuf,
    pub low_resolution_timers: bool,
    pub pending_timers: usize,
    pub nameservers: Vec<String>,
    pub resolver_sockets: usize,
    pub registered_descriptors: usize,
    pub failed_writes: u64,
    pub buffered_bytes: u64,
    /// Process-wide: contexts registered on any thread and not yet released.
    pub live_contexts: usize,
    /// Process-wide: successful registrations since start.
    pub total_registrations: u64,
    pub version: String,
}

/// One thread's network engine.
pub struct EngineContext {
    state: Cell<LifecycleState>,
    running: Cell<bool>,
    backend: EventBackend,
    provider: Rc<dyn SubsystemProvider>,
    subsystems: RefCell<Option<Subsystems>>,
    tls_unavailable: Option<String>,
    entropy_device: PathBuf,
    thread_name: Option<String>,
    logger: RefCell<EngineLogger>,
    failed_writes: Cell<u64>,
    buffered_bytes: Cell<u64>,
    user_context: RefCell<Option<Box<dyn Any>>>,
    on_shutdown: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl EngineContext {
    /// Create and register this thread's context with the default
    /// collaborators.
    pub fn init(config: &EngineConfig) -> Result<Rc<Self>, EngineError> {
        Self::init_with(config, DefaultProvider::shared())
    }

    /// Create and register this thread's context with collaborators from
    /// `provider`.
    pub fn init_with(
        config: &EngineConfig,
        provider: Rc<dyn SubsystemProvider>,
    ) -> Result<Rc<Self>, EngineError> {
        config.validate()?;
        provider.bootstrap()?;

        let registry = ThreadRegistry::global();
        if registry.is_occupied() {
            warn!("engine context already registered on this thread");
            return Err(EngineError::DuplicateContext);
        }

        let backend = EventBackend::compiled();
        let mut partial = PartialEngine::new(Rc::clone(&provider));

        partial.timers = Some(provider.timers(&config.timers));

        provider
            .dns_library_init()
            .map_err(|e| EngineError::subsystem("dns library", e))?;
        partial.dns_library = true;
        partial.resolver = Some(
            provider
                .resolver(&config.dns)
                .map_err(|e| EngineError::subsystem("dns resolver", e))?,
        );

        let tls_unavailable = if config.tls.enabled {
            let tls = provider.tls(&config.tls);
            match tls.library_init() {
                Ok(()) => {
                    let created = tls.create_global_client_context();
                    partial.tls = Some(tls);
                    match created {
                        Ok(ctx) => {
                            partial.tls_context = Some(ctx);
                            None
                        }
                        Err(e) => {
                            warn!(error = %e, "continuing without a TLS global client context");
                            Some(e.to_string())
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "TLS library unavailable; continuing without TLS");
                    Some(e.to_string())
                }
            }
        } else {
            debug!("TLS disabled by configuration");
            Some("disabled by configuration".to_string())
        };

        partial.multiplexer = Some(
            provider
                .multiplexer(backend)
                .map_err(|e| EngineError::subsystem("event multiplexer", e))?,
        );

        let device = config.entropy.device.clone();
        partial.entropy = Some(provider.entropy(&device).map_err(|source| {
            EngineError::EntropyUnavailable {
                device: device.clone(),
                source,
            }
        })?);

        let subsystems = partial.complete()?;
        let has_tls = subsystems.tls_context.is_some();
        let ctx = Rc::new(EngineContext {
            state: Cell::new(LifecycleState::Initializing),
            running: Cell::new(true),
            backend,
            provider: Rc::clone(&provider),
            subsystems: RefCell::new(Some(subsystems)),
            tls_unavailable,
            entropy_device: device,
            thread_name: std::thread::current().name().map(str::to_string),
            logger: RefCell::new(EngineLogger::default()),
            failed_writes: Cell::new(0),
            buffered_bytes: Cell::new(0),
            user_context: RefCell::new(None),
            on_shutdown: RefCell::new(None),
        });

        if let Err(e) = registry.register(Rc::clone(&ctx)) {
            ctx.state.set(LifecycleState::Failed);
            ctx.release_subsystems();
            warn!(error = %e, "engine context registration failed");
            return Err(match e {
                RegistryError::AlreadyRegistered => EngineError::DuplicateContext,
                RegistryError::ThreadExiting => EngineError::subsystem("thread registry", e),
            });
        }
        ctx.state.set(LifecycleState::Running);

        info!(
            backend = %backend,
            provider = provider.name(),
            tls = has_tls,
            thread = ctx.thread_name.as_deref().unwrap_or("<unnamed>"),
            version = %build_info::version_string(),
            "engine context initialized"
        );
        Ok(ctx)
    }

    /// The calling thread's context, if one is registered.
    pub fn current() -> Option<Rc<Self>> {
        ThreadRegistry::get().and_then(ThreadRegistry::lookup)
    }

    /// Tear the context down and clear the calling thread's slot.
    ///
    /// Only a running context registered on the calling thread may be
    /// destroyed; anything else is rejected with
    /// [`EngineError::DestroyPrecondition`] and changes nothing.
    /// Collaborator failures during teardown are logged, not returned.
    pub fn destroy(self: Rc<Self>) -> Result<(), EngineError> {
        match self.state.get() {
            LifecycleState::Running => {}
            LifecycleState::Destroying | LifecycleState::Destroyed => {
                return Err(EngineError::DestroyPrecondition("context already destroyed"));
            }
            LifecycleState::Initializing | LifecycleState::Failed => {
                return Err(EngineError::DestroyPrecondition("context never finished init"));
            }
        }

        let registry = ThreadRegistry::get().ok_or(EngineError::DestroyPrecondition(
            "no context has been registered in this process",
        ))?;
        let owned = registry
            .lookup()
            .is_some_and(|registered| Rc::ptr_eq(&registered, &self));
        if !owned {
            return Err(EngineError::DestroyPrecondition(
                "context is not registered on the calling thread",
            ));
        }

        // Held by a running log sink: the cleanup callback could not run.
        if self.logger.try_borrow_mut().is_err() {
            return Err(EngineError::Busy);
        }
        let subsystems = self
            .subsystems
            .try_borrow_mut()
            .map_err(|_| EngineError::Busy)?
            .take();

        self.state.set(LifecycleState::Destroying);
        self.running.set(false);

        if let Some(subsystems) = subsystems {
            PartialEngine::from_subsystems(Rc::clone(&self.provider), subsystems).release();
        }
        self.run_logger_cleanup();

        self.state.set(LifecycleState::Destroyed);
        registry.clear();
        registry.context_released();
        info!(backend = %self.backend, "engine context destroyed");
        Ok(())
    }

    fn release_subsystems(&self) {
        if let Ok(mut slot) = self.subsystems.try_borrow_mut() {
            if let Some(subsystems) = slot.take() {
                PartialEngine::from_subsystems(Rc::clone(&self.provider), subsystems).release();
            }
        }
    }

    fn run_logger_cleanup(&self) {
        match self.logger.try_borrow_mut() {
            Ok(mut logger) => {
                if std::mem::take(&mut *logger).cleanup() {
                    debug!("logger cleanup callback invoked");
                }
            }
            Err(_) => warn!("logger in use during teardown; cleanup skipped"),
        }
    }

    /// Run `f` against the live subsystems.
    pub fn with_subsystems<R>(
        &self,
        f: impl FnOnce(&mut Subsystems) -> R,
    ) -> Result<R, EngineError> {
        if self.state.get() != LifecycleState::Running {
            return Err(EngineError::NotRunning);
        }
        let mut slot = self
            .subsystems
            .try_borrow_mut()
            .map_err(|_| EngineError::Busy)?;
        let subsystems = slot.as_mut().ok_or(EngineError::NotRunning)?;
        Ok(f(subsystems))
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn backend(&self) -> EventBackend {
        self.backend
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn entropy_device(&self) -> &std::path::Path {
        &self.entropy_device
    }

    // ── Running flag ────────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Install the callback run by the first [`request_shutdown`](Self::request_shutdown).
    pub fn set_shutdown_callback(&self, callback: impl FnOnce() + 'static) {
        *self.on_shutdown.borrow_mut() = Some(Box::new(callback));
    }

    /// Clear the running flag and run the shutdown callback once.
    pub fn request_shutdown(&self) {
        if !self.running.replace(false) {
            return;
        }
        debug!("engine shutdown requested");
        let callback = self.on_shutdown.borrow_mut().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    // ── Counters ────────────────────────────────────────────────────────

    pub fn record_failed_write(&self) {
        self.failed_writes.set(self.failed_writes.get().saturating_add(1));
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.get()
    }

    pub fn add_buffered(&self, bytes: u64) {
        self.buffered_bytes
            .set(self.buffered_bytes.get().saturating_add(bytes));
    }

    pub fn release_buffered(&self, bytes: u64) {
        self.buffered_bytes
            .set(self.buffered_bytes.get().saturating_sub(bytes));
    }

    /// Total memory buffered by connections on this context.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes.get()
    }

    // ── User context ────────────────────────────────────────────────────

    /// Attach an opaque value, returning the previous one.
    ///
    /// Fails with [`EngineError::Busy`] from inside
    /// [`with_user_context`](Self::with_user_context).
    pub fn set_user_context(&self, value: impl Any) -> Result<Option<Box<dyn Any>>, EngineError> {
        let mut slot = self
            .user_context
            .try_borrow_mut()
            .map_err(|_| EngineError::Busy)?;
        Ok(slot.replace(Box::new(value)))
    }

    /// Borrow the user context as `T`. `None` if unset, of another type, or
    /// already borrowed.
    pub fn with_user_context<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.user_context.try_borrow_mut().ok()?;
        let value = slot.as_mut()?.downcast_mut::<T>()?;
        Some(f(value))
    }

    // ── Logger ──────────────────────────────────────────────────────────

    /// Replace the logger record. The previous record is dropped without
    /// running its cleanup.
    pub fn set_logger(&self, logger: EngineLogger) -> Result<(), EngineError> {
        let mut slot = self
            .logger
            .try_borrow_mut()
            .map_err(|_| EngineError::Busy)?;
        *slot = logger;
        Ok(())
    }

    pub fn log(&self, level: Level, message: &str) {
        match self.logger.try_borrow() {
            Ok(logger) => logger.log(level, message),
            Err(_) => debug!(message, "engine log line dropped: logger busy"),
        }
    }

    // ── Subsystem shortcuts ─────────────────────────────────────────────

    /// Fill `buf` from the entropy source.
    pub fn fill_random(&self, buf: &mut [u8]) -> Result<(), EngineError> {
        let device = &self.entropy_device;
        self.with_subsystems(|s| s.entropy.fill(buf))?
            .map_err(|source| EngineError::EntropyUnavailable {
                device: device.clone(),
                source,
            })
    }

    pub fn schedule_timer(&self, delay: Duration, kind: TimerKind) -> Result<TimerId, EngineError> {
        self.with_subsystems(|s| s.timers.schedule(delay, kind))
    }

    pub fn cancel_timer(&self, id: TimerId) -> Result<bool, EngineError> {
        self.with_subsystems(|s| s.timers.cancel(id))
    }

    /// Queue a lookup. The callback runs with `Cancelled` if the context is
    /// destroyed first.
    pub fn submit_query(
        &self,
        hostname: &str,
        on_done: ResolveCallback,
    ) -> Result<QueryId, EngineError> {
        self.with_subsystems(|s| s.resolver.submit(hostname, on_done))
    }

    pub fn open_resolver_socket(&self, nameserver: SocketAddr) -> Result<RawDescriptor, EngineError> {
        self.with_subsystems(|s| s.open_resolver_socket(nameserver))?
            .map_err(|e| EngineError::subsystem("dns resolver", e))
    }

    pub fn has_tls_context(&self) -> bool {
        self.with_subsystems(|s| s.tls_context.is_some())
            .unwrap_or(false)
    }

    /// Client configuration of the global TLS context.
    pub fn tls_client_config(&self) -> Result<Arc<ClientConfig>, EngineError> {
        let config = self.with_subsystems(|s| {
            s.tls_context
                .as_ref()
                .and_then(TlsClientContext::client_config)
        })?;
        config.ok_or_else(|| {
            EngineError::TlsContextUnavailable(
                self.tls_unavailable
                    .clone()
                    .unwrap_or_else(|| "no client configuration attached".to_string()),
            )
        })
    }

    /// Why the context runs without TLS, if it does.
    pub fn tls_unavailable_reason(&self) -> Option<&str> {
        self.tls_unavailable.as_deref()
    }

    pub fn summary(&self) -> EngineSummary {
        let live = self
            .with_subsystems(|s| {
                (
                    s.timers.low_resolution(),
                    s.timers.len(),
                    s.resolver
                        .nameservers()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>(),
                    s.resolver.sockets().len(),
                    s.multiplexer.registered(),
                    s.tls_context.is_some(),
                )
            })
            .ok();
        let (low_resolution_timers, pending_timers, nameservers, resolver_sockets, registered, tls) =
            live.unwrap_or_default();
        let (live_contexts, total_registrations) = ThreadRegistry::get()
            .map(|r| (r.live_contexts(), r.total_registrations()))
            .unwrap_or_default();

        EngineSummary {
            state: self.state.get(),
            backend: self.backend,
            provider: self.provider.name().to_string(),
            thread: self.thread_name.clone(),
            tls_context: tls,
            tls_unavailable: self.tls_unavailable.clone(),
            entropy_device: self.entropy_device.clone(),
            low_resolution_timers,
            pending_timers,
            nameservers,
            resolver_sockets,
            registered_descriptors: registered,
            failed_writes: self.failed_writes.get(),
            buffered_bytes: self.buffered_bytes.get(),
            live_contexts,
            total_registrations,
            version: build_info::version_string(),
        }
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("state", &self.state.get())
            .field("backend", &self.backend)
            .field("provider", &self.provider.name())
            .field("running", &self.running.get())
            .finish_non_exhaustive()
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        // Reached with Running only when the thread exits with its context
        // still registered.
        if self.state.get() != LifecycleState::Running {
            return;
        }
        warn!(
            thread = self.thread_name.as_deref().unwrap_or("<unnamed>"),
            "engine context dropped without destroy; releasing subsystems"
        );
        self.state.set(LifecycleState::Destroying);
        self.release_subsystems();
        self.run_logger_cleanup();
        self.state.set(LifecycleState::Destroyed);
        if let Some(registry) = ThreadRegistry::get() {
            registry.context_released();
        }
    }
}
