#![deny(unsafe_code)]

//! Per-thread network engine context.
//!
//! An [`EngineContext`] owns the subsystems one thread's event loop is built
//! around: the I/O event multiplexer, the DNS resolver channel with its
//! sockets, the TLS global client context, timer state, an entropy source,
//! and an optional logger record. This crate defines how that context is
//! created ([`EngineContext::init`]), found again from anywhere on the same
//! thread ([`EngineContext::current`]), and torn down
//! ([`EngineContext::destroy`]), along with the ordering guarantees between
//! those subsystems.
//!
//! ```ignore
//! let ctx = EngineContext::init(&EngineConfig::default())?;
//! assert!(Rc::ptr_eq(&ctx, &EngineContext::current().unwrap()));
//! ctx.destroy()?;
//! ```

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Engine context lifecycle and error taxonomy.
pub mod engine;
/// Entropy source trait and the device-backed implementation.
pub mod entropy;
/// Refcounted process-wide library state.
pub mod library;
/// Caller-installed logger record.
pub mod logging;
/// Event backend selection and descriptor registration.
pub mod multiplexer;
/// One-time process bootstrap.
pub mod platform;
/// Factory for an engine context's collaborators.
pub mod provider;
/// Per-thread context slot.
pub mod registry;
/// DNS resolver channel and socket set.
pub mod resolver;
/// Timer lists.
pub mod timer;
/// TLS library and global client context.
pub mod tls;

pub use engine::{EngineContext, EngineError, EngineSummary, LifecycleState, Subsystems};
pub use logging::EngineLogger;
pub use multiplexer::{
    BorrowedDescriptor, EventBackend, EventMultiplexer, Interest, RawDescriptor,
};
pub use provider::{DefaultProvider, SubsystemProvider};
pub use registry::{RegistryError, ThreadRegistry};
pub use resolver::{DnsResolver, QueryId, ResolveOutcome};
pub use timer::{TimerId, TimerKind};
pub use tls::{TlsClientContext, TlsError, TlsProvider};
