//! Configuration system for Tandem
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/dev.tandem.tandem/config.toml
//! - Linux: ~/.config/tandem/config.toml
//! - Windows: %APPDATA%/tandem/tandem/config/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chunk::TransferKind;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay (signaling) settings
    pub relay: RelayConfig,
    /// Session settings
    pub session: SessionConfig,
    /// Workspace scanning settings
    pub workspace: WorkspaceConfig,
    /// Chunked transfer settings
    pub transfer: TransferConfig,
    /// ICE settings
    pub ice: IceConfig,
}

/// Relay connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the relay
    pub url: String,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:6789".into(),
            connect_timeout_secs: 10,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Display name announced in the greeting (hostname if unset)
    pub username: Option<String>,
    /// How long to wait for the peer to finish negotiation
    pub negotiation_timeout_secs: u64,
    /// Liveness ping interval while the channel is open
    pub ping_interval_secs: u64,
    /// Incomplete transfers older than this are dropped
    pub transfer_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: None,
            negotiation_timeout_secs: 30,
            ping_interval_secs: 15,
            transfer_ttl_secs: 60,
        }
    }
}

/// Workspace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Shared directory (required when initiating)
    pub root: Option<PathBuf>,
    /// Change polling interval in seconds
    pub poll_interval_secs: u64,
    /// Extra gitignore-style exclude patterns
    pub exclude: Vec<String>,
    /// Where received files are materialized (system temp dir if None)
    pub scratch_dir: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            poll_interval_secs: 5,
            exclude: Vec::new(),
            scratch_dir: None,
        }
    }
}

/// Fragment size ceilings per transfer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub workspace_fragment_size: usize,
    pub file_fragment_size: usize,
    pub edit_fragment_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workspace_fragment_size: crate::WORKSPACE_FRAGMENT_SIZE,
            file_fragment_size: crate::FILE_FRAGMENT_SIZE,
            edit_fragment_size: crate::EDIT_FRAGMENT_SIZE,
        }
    }
}

impl TransferConfig {
    /// Fragment ceiling for a transfer kind
    pub fn fragment_size(&self, kind: TransferKind) -> usize {
        match kind {
            TransferKind::WorkspaceSnapshot => self.workspace_fragment_size,
            TransferKind::FileContent => self.file_fragment_size,
            TransferKind::Edit => self.edit_fragment_size,
        }
    }
}

/// ICE configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".into()],
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "tandem", "tandem")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values the session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        for (name, size) in [
            ("workspace_fragment_size", t.workspace_fragment_size),
            ("file_fragment_size", t.file_fragment_size),
            ("edit_fragment_size", t.edit_fragment_size),
        ] {
            if size == 0 {
                return Err(ConfigError::InvalidFragmentSize(name));
            }
        }
        if self.workspace.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval("poll_interval_secs"));
        }
        if self.session.ping_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval("ping_interval_secs"));
        }
        if self.session.transfer_ttl_secs == 0 {
            return Err(ConfigError::InvalidInterval("transfer_ttl_secs"));
        }
        Ok(())
    }

    /// Directory where received files are written
    pub fn scratch_dir(&self, session_id: &str) -> PathBuf {
        self.workspace
            .scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("tandem"))
            .join(session_id)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.session.negotiation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.workspace.poll_interval_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.session.ping_interval_secs)
    }

    pub fn transfer_ttl(&self) -> Duration {
        Duration::from_secs(self.session.transfer_ttl_secs)
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {0}: fragment size must be greater than zero")]
    InvalidFragmentSize(&'static str),

    #[error("invalid {0}: interval must be greater than zero")]
    InvalidInterval(&'static str),

    #[error("a workspace root is required to initiate a session")]
    MissingWorkspace,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.workspace.poll_interval_secs, 5);
        assert_eq!(config.transfer.workspace_fragment_size, 14 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [relay]
            url = "ws://relay.example:9000"

            [transfer]
            edit_fragment_size = 64
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.relay.url, "ws://relay.example:9000");
        assert_eq!(config.transfer.edit_fragment_size, 64);
        // Other values should be defaults
        assert_eq!(config.transfer.file_fragment_size, crate::FILE_FRAGMENT_SIZE);
        assert_eq!(config.session.negotiation_timeout_secs, 30);
    }

    #[test]
    fn test_zero_fragment_size_rejected() {
        let mut config = Config::default();
        config.transfer.file_fragment_size = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidFragmentSize("file_fragment_size"))
        );
    }

    #[test]
    fn test_fragment_size_per_kind() {
        let t = TransferConfig {
            workspace_fragment_size: 3,
            file_fragment_size: 2,
            edit_fragment_size: 1,
        };
        assert_eq!(t.fragment_size(TransferKind::WorkspaceSnapshot), 3);
        assert_eq!(t.fragment_size(TransferKind::FileContent), 2);
        assert_eq!(t.fragment_size(TransferKind::Edit), 1);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[relay]"));
        assert!(sample.contains("[workspace]"));
        assert!(sample.contains("[transfer]"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.session.username = Some("ada".into());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.session.username.as_deref(), Some("ada"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.relay.connect_timeout_secs, 10);
    }
}
