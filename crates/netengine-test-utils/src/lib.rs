#![deny(unsafe_code)]

//! Shared test utilities for the netengine workspace.
//!
//! Provides recording collaborator stubs, config builders, and tracing
//! helpers so that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! netengine-test-utils = { workspace = true }
//! ```

pub mod capture;
pub mod config;
pub mod fixtures;
pub mod provider;
pub mod tracing_setup;

pub use capture::{CapturedEvent, LogCapture};
pub use config::TestConfigBuilder;
pub use provider::{Call, FailAt, Journal, RecordingProvider};
pub use tracing_setup::init_test_tracing;
