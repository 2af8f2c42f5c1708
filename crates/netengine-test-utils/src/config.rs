//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`EngineConfig`] values
//! without repeating boilerplate across crate boundaries.

use std::path::PathBuf;

use netengine_config::EngineConfig;

/// Fluent builder for [`EngineConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .tls_enabled(false)
///     .nameserver("127.0.0.1")
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: EngineConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn entropy_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.entropy.device = path.into();
        self
    }

    pub fn tls_enabled(mut self, enabled: bool) -> Self {
        self.config.tls.enabled = enabled;
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.ca_file = Some(path.into());
        self
    }

    pub fn nameserver(mut self, addr: &str) -> Self {
        self.config.dns.nameservers.push(addr.to_string());
        self
    }

    pub fn max_sockets(mut self, n: usize) -> Self {
        self.config.dns.max_sockets = n;
        self
    }

    pub fn low_resolution_timers(mut self, enabled: bool) -> Self {
        self.config.timers.low_resolution = enabled;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
