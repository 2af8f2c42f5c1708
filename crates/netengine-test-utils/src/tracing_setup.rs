//! Tracing initialisation helpers for tests.
//!
//! Call [`init_test_tracing`] at the top of any test that emits tracing events
//! and wants them shown by the test harness. The subscriber is installed at
//! most once per process.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber writing to the test-harness writer.
///
/// Honors `RUST_LOG`, defaulting to `debug` for netengine crates. Later
/// calls are ignored.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,netengine=debug,netengine_core=debug")),
        )
        .with_test_writer()
        .try_init();
}
