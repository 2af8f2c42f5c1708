//! Subsystem provider: the factory the engine context builds its
//! collaborators from.
//!
//! [`DefaultProvider`] wires the real implementations. Tests substitute a
//! provider that records every call and fails on demand.

use std::io;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use netengine_config::{DnsConfig, TimerConfig, TlsConfig};

use crate::engine::EngineError;
use crate::entropy::{DeviceEntropy, EntropySource};
use crate::multiplexer::{EventBackend, EventMultiplexer, PollMultiplexer};
use crate::platform;
use crate::resolver::{self, DnsResolver, ResolverChannel};
use crate::timer::{TimerStore, TimerSubsystem};
use crate::tls::{RustlsProvider, TlsProvider};

/// Builds the collaborators of one engine context.
///
/// Methods are called by `EngineContext::init` in acquisition order, and
/// each acquired piece is handed back to its own teardown call.
pub trait SubsystemProvider {
    /// Human-readable name used in log output.
    fn name(&self) -> &str;

    /// Process-level platform setup. Must be idempotent.
    fn bootstrap(&self) -> Result<(), EngineError>;

    fn timers(&self, config: &TimerConfig) -> Box<dyn TimerSubsystem>;

    /// Take a reference on the process-wide resolver state.
    fn dns_library_init(&self) -> io::Result<()>;

    fn resolver(&self, config: &DnsConfig) -> io::Result<Box<dyn DnsResolver>>;

    /// Drop a reference on the process-wide resolver state.
    fn dns_library_cleanup(&self);

    fn tls(&self, config: &TlsConfig) -> Arc<dyn TlsProvider>;

    fn multiplexer(&self, backend: EventBackend) -> io::Result<Box<dyn EventMultiplexer>>;

    fn entropy(&self, device: &Path) -> io::Result<Box<dyn EntropySource>>;
}

/// The production collaborators: `polling`, [`ResolverChannel`], rustls
/// and a device-backed entropy source.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProvider;

impl DefaultProvider {
    pub fn shared() -> Rc<dyn SubsystemProvider> {
        Rc::new(DefaultProvider)
    }
}

impl SubsystemProvider for DefaultProvider {
    fn name(&self) -> &str {
        "default"
    }

    fn bootstrap(&self) -> Result<(), EngineError> {
        platform::bootstrap()
    }

    fn timers(&self, config: &TimerConfig) -> Box<dyn TimerSubsystem> {
        Box::new(TimerStore::new(config.low_resolution))
    }

    fn dns_library_init(&self) -> io::Result<()> {
        resolver::library_init();
        Ok(())
    }

    fn resolver(&self, config: &DnsConfig) -> io::Result<Box<dyn DnsResolver>> {
        let configured = config
            .socket_addrs()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let nameservers = if configured.is_empty() {
            resolver::system_nameservers()
        } else {
            configured
        };
        Ok(Box::new(ResolverChannel::new(nameservers, config.max_sockets)))
    }

    fn dns_library_cleanup(&self) {
        resolver::library_cleanup();
    }

    fn tls(&self, config: &TlsConfig) -> Arc<dyn TlsProvider> {
        Arc::new(RustlsProvider::new(config.ca_file.clone()))
    }

    fn multiplexer(&self, backend: EventBackend) -> io::Result<Box<dyn EventMultiplexer>> {
        Ok(Box::new(PollMultiplexer::new(backend)?))
    }

    fn entropy(&self, device: &Path) -> io::Result<Box<dyn EntropySource>> {
        Ok(Box::new(DeviceEntropy::open(device)?))
    }
}
