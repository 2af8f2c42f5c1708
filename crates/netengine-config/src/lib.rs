#![deny(unsafe_code)]

//! Configuration loading and validation for netengine.
//!
//! Loads TOML configuration files describing how each thread's engine
//! context should provision its subsystems. Every field has a default, so an
//! empty file (or no file at all) yields a usable [`EngineConfig`].
//!
//! The event backend is not configured here; it is fixed when the core crate
//! is compiled.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Port used for nameserver entries that omit one.
pub const DNS_PORT: u16 = 53;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level engine configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Entropy device configuration.
    #[serde(default)]
    pub entropy: EntropyConfig,

    /// TLS global client context configuration.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Asynchronous resolver configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Timer subsystem configuration.
    #[serde(default)]
    pub timers: TimerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Entropy source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntropyConfig {
    /// Path of the randomness device opened by each engine context.
    #[serde(default = "default_entropy_device")]
    pub device: PathBuf,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            device: default_entropy_device(),
        }
    }
}

fn default_entropy_device() -> PathBuf {
    PathBuf::from("/dev/urandom")
}

/// TLS configuration.
///
/// ## TOML Example
///
/// ```toml
/// [tls]
/// enabled = true
/// ca_file = "/etc/ssl/certs/ca-certificates.crt"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Whether each context creates a TLS global client context.
    #[serde(default = "default_tls_enabled")]
    pub enabled: bool,

    /// PEM bundle of trust anchors for the client context. When unset the
    /// client context starts with an empty root store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: default_tls_enabled(),
            ca_file: None,
        }
    }
}

fn default_tls_enabled() -> bool {
    true
}

/// Resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Nameservers as `ip` or `ip:port`. Empty means use the system
    /// resolver configuration.
    #[serde(default)]
    pub nameservers: Vec<String>,

    /// Upper bound on the resolver's socket set.
    #[serde(default = "default_dns_max_sockets")]
    pub max_sockets: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            max_sockets: default_dns_max_sockets(),
        }
    }
}

fn default_dns_max_sockets() -> usize {
    16
}

impl DnsConfig {
    /// Resolve the configured nameserver strings to socket addresses.
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.nameservers
            .iter()
            .enumerate()
            .map(|(i, ns)| {
                parse_nameserver(ns).ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "dns.nameservers[{i}] is not an IP address or socket address: {ns:?}"
                    ))
                })
            })
            .collect()
    }
}

/// Parse a nameserver written as `ip`, `ip:port` or `[ipv6]:port`.
pub fn parse_nameserver(s: &str) -> Option<SocketAddr> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    s.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
}

/// Timer subsystem configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Run timers in low-resolution mode.
    #[serde(default)]
    pub low_resolution: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "engine configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entropy.device.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "entropy.device must not be empty".to_string(),
            ));
        }

        if let Some(ca_file) = &self.tls.ca_file {
            if ca_file.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "tls.ca_file must not be empty when set".to_string(),
                ));
            }
        }

        self.dns.socket_addrs()?;
        if self.dns.max_sockets == 0 {
            return Err(ConfigError::Validation(
                "dns.max_sockets must be at least 1".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.entropy.device, PathBuf::from("/dev/urandom"));
        assert!(config.tls.enabled);
        assert!(config.tls.ca_file.is_none());
        assert!(config.dns.nameservers.is_empty());
        assert_eq!(config.dns.max_sockets, 16);
        assert!(!config.timers.low_resolution);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config.dns.max_sockets, 16);
        assert!(config.tls.enabled);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [entropy]
            device = "/dev/random"

            [tls]
            enabled = false
            ca_file = "/etc/ssl/ca.pem"

            [dns]
            nameservers = ["9.9.9.9", "[2620:fe::fe]:5353"]
            max_sockets = 4

            [timers]
            low_resolution = true

            [logging]
            level = "debug"
        "#;
        let config = EngineConfig::parse(toml).unwrap();
        assert_eq!(config.entropy.device, PathBuf::from("/dev/random"));
        assert!(!config.tls.enabled);
        assert_eq!(config.tls.ca_file, Some(PathBuf::from("/etc/ssl/ca.pem")));
        assert_eq!(config.dns.max_sockets, 4);
        assert!(config.timers.low_resolution);
        assert_eq!(config.logging.level, "debug");

        let addrs = config.dns.socket_addrs().unwrap();
        assert_eq!(addrs[0], "9.9.9.9:53".parse::<SocketAddr>().unwrap());
        assert_eq!(addrs[1], "[2620:fe::fe]:5353".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_validation_rejects_empty_device() {
        let toml = r#"
            [entropy]
            device = ""
        "#;
        assert!(EngineConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_nameserver() {
        let toml = r#"
            [dns]
            nameservers = ["8.8.8.8", "dns.example.com"]
        "#;
        let err = EngineConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("dns.nameservers[1]"));
    }

    #[test]
    fn test_validation_rejects_zero_max_sockets() {
        let toml = r#"
            [dns]
            max_sockets = 0
        "#;
        assert!(EngineConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        let toml = r#"
            [logging]
            level = "verbose"
        "#;
        assert!(EngineConfig::parse(toml).is_err());
    }

    #[test]
    fn test_parse_nameserver_forms() {
        assert_eq!(
            parse_nameserver("1.1.1.1"),
            Some("1.1.1.1:53".parse().unwrap())
        );
        assert_eq!(
            parse_nameserver(" 1.1.1.1:5300 "),
            Some("1.1.1.1:5300".parse().unwrap())
        );
        assert_eq!(parse_nameserver("::1"), Some("[::1]:53".parse().unwrap()));
        assert_eq!(parse_nameserver("localhost"), None);
    }

    // ── File-based loading ────────────────────────────────────────────

    #[test_log::test]
    fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("netengine.toml");
        std::fs::write(&path, b"[dns]\nmax_sockets = 2\n\n[timers]\nlow_resolution = true\n")
            .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.dns.max_sockets, 2);
        assert!(config.timers.low_resolution);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = EngineConfig::load(Path::new("/nonexistent/netengine.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, b"not valid toml [[[").unwrap();

        let result = EngineConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = EngineConfig::default();
        config.dns.nameservers = vec!["10.0.0.53".to_string()];
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = EngineConfig::parse(&text).unwrap();
        assert_eq!(parsed.dns.nameservers, config.dns.nameservers);
        assert_eq!(parsed.entropy.device, config.entropy.device);
    }
}
