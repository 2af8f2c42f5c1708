//! File-backed config fixtures.

use std::path::PathBuf;

use netengine_config::EngineConfig;
use tempfile::TempDir;

/// A config file in a test-scoped temp directory.
///
/// The directory is deleted when this value is dropped, even on panic.
pub struct TestConfigFile {
    pub config: EngineConfig,
    pub config_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestConfigFile {
    /// Write `toml_content` to a temp file and load it.
    pub fn with_toml(toml_content: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config_path = temp_dir.path().join("netengine.toml");
        std::fs::write(&config_path, toml_content).expect("failed to write test config");

        let config = EngineConfig::load(&config_path).expect("failed to parse test config");

        Self {
            config,
            config_path,
            _temp_dir: temp_dir,
        }
    }

    /// Serialize `config` to a temp file.
    pub fn from_config(config: &EngineConfig) -> Self {
        let content = toml::to_string(config).expect("failed to serialize test config");
        Self::with_toml(&content)
    }

    /// Overwrite the temp config file.
    pub fn write(&self, toml_content: &str) {
        std::fs::write(&self.config_path, toml_content).expect("failed to write updated config");
    }
}
