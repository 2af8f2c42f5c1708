//! Build-time metadata embedded by the build script.
//!
//! Reported by the CLI and attached to the context-init log line so a trace
//! can be matched to the binary that produced it.

/// The git commit hash at build time (short form).
pub const GIT_HASH: &str = env!("NETENGINE_GIT_HASH");

/// The build timestamp as a Unix epoch string.
pub const BUILD_TIMESTAMP: &str = env!("NETENGINE_BUILD_TIMESTAMP");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("NETENGINE_BUILD_PROFILE");

/// The target triple the crate was compiled for.
pub const TARGET: &str = env!("NETENGINE_TARGET");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Return a formatted version string including git hash, profile and target.
///
/// Example: `"0.1.0 (abc1234, debug, x86_64-unknown-linux-gnu)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE}, {TARGET})")
}
