//! One-time process bootstrap for network I/O.
//!
//! On unix this ignores `SIGPIPE` so a write to a closed peer returns
//! `EPIPE` instead of terminating the process. On windows it forces the
//! socket library to start. Both run at most once per process; later calls
//! return the cached outcome.

use std::io;
use std::sync::OnceLock;

use tracing::debug;

use crate::engine::EngineError;

static BOOTSTRAP: OnceLock<Result<(), String>> = OnceLock::new();

/// Run the platform bootstrap if no thread has yet.
pub fn bootstrap() -> Result<(), EngineError> {
    BOOTSTRAP
        .get_or_init(|| platform_bootstrap().map_err(|e| e.to_string()))
        .clone()
        .map_err(EngineError::PlatformBootstrap)
}

/// Whether a bootstrap has completed successfully in this process.
pub fn is_bootstrapped() -> bool {
    matches!(BOOTSTRAP.get(), Some(Ok(())))
}

#[cfg(unix)]
fn platform_bootstrap() -> io::Result<()> {
    // SAFETY: SIG_IGN installs no handler code, so there is nothing that
    // could run concurrently with the rest of the process.
    #[allow(unsafe_code)]
    let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if previous == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    debug!("SIGPIPE disposition set to ignore");
    Ok(())
}

#[cfg(windows)]
fn platform_bootstrap() -> io::Result<()> {
    // The standard library starts Winsock on first socket creation.
    std::net::UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0))?;
    debug!("socket library started");
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn platform_bootstrap() -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_is_idempotent() {
        bootstrap().unwrap();
        bootstrap().unwrap();
        assert!(is_bootstrapped());
    }
}
