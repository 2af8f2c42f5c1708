//! TLS library state and the per-context global client context.
//!
//! Two scopes with independent lifetimes:
//!
//! - the **library** (crypto provider), shared by every context in the
//!   process and refcounted through [`SharedLibrary`];
//! - the **global client context**, one per engine context, created after
//!   the library and destroyed before it.
//!
//! A context that fails to get a client context keeps running without one;
//! callers see `None` from
//! [`EngineContext::tls_context`](crate::engine::EngineContext::tls_context).

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::library::SharedLibrary;

/// Errors from the TLS collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS library initialization failed: {0}")]
    Library(String),

    #[error("failed to read CA bundle {path}: {source}")]
    CaFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CA bundle {0} contains no usable certificates")]
    NoCertificates(PathBuf),

    #[error("TLS client context creation failed: {0}")]
    ClientContext(#[from] rustls::Error),
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a global client context.
///
/// Owned by exactly one engine context and handed back to the provider for
/// shutdown and destruction.
#[derive(Debug)]
pub struct TlsClientContext {
    id: u64,
    config: Option<Arc<ClientConfig>>,
}

impl TlsClientContext {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            config: Some(config),
        }
    }

    /// A context with no client configuration attached, for providers that
    /// manage TLS state elsewhere.
    pub fn detached() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            config: None,
        }
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Client configuration for new connections.
    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.config.clone()
    }
}

impl fmt::Display for TlsClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tls-ctx#{}", self.id)
    }
}

/// Lifecycle contract for the TLS collaborator.
///
/// The engine calls these in a fixed order: `library_init`, then
/// `create_global_client_context` at init; `shutdown`, `destroy`, then
/// `library_destroy` at teardown.
pub trait TlsProvider: Send + Sync {
    /// Take a reference on the process-wide library state.
    fn library_init(&self) -> Result<(), TlsError>;

    /// Drop a reference on the process-wide library state.
    fn library_destroy(&self);

    /// Create the global client context for one engine context.
    fn create_global_client_context(&self) -> Result<TlsClientContext, TlsError>;

    /// Stop handing out sessions from `ctx`.
    fn shutdown(&self, ctx: &TlsClientContext);

    /// Destroy `ctx`.
    fn destroy(&self, ctx: TlsClientContext);
}

// ── rustls provider ─────────────────────────────────────────────────────

static TLS_LIBRARY: SharedLibrary<Arc<CryptoProvider>> = SharedLibrary::new("tls");
static LIVE_CLIENT_CONTEXTS: AtomicUsize = AtomicUsize::new(0);

/// [`TlsProvider`] backed by rustls with the `ring` crypto provider.
#[derive(Debug, Clone, Default)]
pub struct RustlsProvider {
    ca_file: Option<PathBuf>,
}

impl RustlsProvider {
    /// `ca_file`, when set, is a PEM bundle of trust anchors for the client
    /// context. Without it the trust store starts empty.
    pub fn new(ca_file: Option<PathBuf>) -> Self {
        Self { ca_file }
    }

    /// Client contexts created by this provider type and not yet destroyed,
    /// across the whole process.
    pub fn live_client_contexts() -> usize {
        LIVE_CLIENT_CONTEXTS.load(Ordering::SeqCst)
    }

    /// Engine contexts currently holding the TLS library.
    pub fn library_users() -> usize {
        TLS_LIBRARY.users()
    }

    fn root_store(&self) -> Result<RootCertStore, TlsError> {
        let mut roots = RootCertStore::empty();
        if let Some(path) = &self.ca_file {
            let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
            debug!(ca_file = %path.display(), added, ignored, "loaded TLS trust anchors");
            if added == 0 {
                return Err(TlsError::NoCertificates(path.clone()));
            }
        }
        Ok(roots)
    }
}

fn load_certs(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TlsError> {
    let ca_err = |source| TlsError::CaFile {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(ca_err)?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(ca_err)
}

impl TlsProvider for RustlsProvider {
    fn library_init(&self) -> Result<(), TlsError> {
        TLS_LIBRARY.acquire(|| {
            Ok::<_, TlsError>(Arc::new(rustls::crypto::ring::default_provider()))
        })?;
        Ok(())
    }

    fn library_destroy(&self) {
        if TLS_LIBRARY.release().is_some() {
            let live = Self::live_client_contexts();
            if live > 0 {
                warn!(live, "TLS library released while client contexts are alive");
            }
        }
    }

    fn create_global_client_context(&self) -> Result<TlsClientContext, TlsError> {
        let provider = TLS_LIBRARY
            .current()
            .ok_or_else(|| TlsError::Library("library is not initialized".to_string()))?;
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.root_store()?)
            .with_no_client_auth();

        LIVE_CLIENT_CONTEXTS.fetch_add(1, Ordering::SeqCst);
        let ctx = TlsClientContext::new(Arc::new(config));
        debug!(%ctx, "TLS client context created");
        Ok(ctx)
    }

    fn shutdown(&self, ctx: &TlsClientContext) {
        debug!(%ctx, "TLS client context shut down");
    }

    fn destroy(&self, ctx: TlsClientContext) {
        if ctx.config.is_some() {
            let _ = LIVE_CLIENT_CONTEXTS
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
        debug!(%ctx, "TLS client context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_client_context_lifecycle() {
        let provider = RustlsProvider::default();
        provider.library_init().unwrap();

        let ctx = provider.create_global_client_context().unwrap();
        assert!(ctx.client_config().is_some());
        assert!(RustlsProvider::live_client_contexts() >= 1);

        provider.shutdown(&ctx);
        provider.destroy(ctx);
        provider.library_destroy();
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = TlsClientContext::detached();
        let b = TlsClientContext::detached();
        assert_ne!(a.id(), b.id());
        assert!(a.client_config().is_none());
        assert_eq!(a.to_string(), format!("tls-ctx#{}", a.id()));
    }

    #[test]
    fn test_missing_ca_file() {
        let provider = RustlsProvider::new(Some(PathBuf::from("/nonexistent/ca.pem")));
        provider.library_init().unwrap();
        let err = provider.create_global_client_context().unwrap_err();
        assert!(matches!(err, TlsError::CaFile { .. }));
        provider.library_destroy();
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "# not a certificate bundle").unwrap();

        let provider = RustlsProvider::new(Some(tmp.path().to_path_buf()));
        provider.library_init().unwrap();
        let err = provider.create_global_client_context().unwrap_err();
        assert!(matches!(err, TlsError::NoCertificates(_)));
        provider.library_destroy();
    }

    #[test]
    fn test_error_display() {
        let err = TlsError::Library("no provider".into());
        assert_eq!(err.to_string(), "TLS library initialization failed: no provider");
    }
}
