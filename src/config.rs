//! Configuration management for kbucket
//!
//! Settings are read from `~/.config/kbucket/config.toml` (or an explicit path)
//! and can be overridden per field from the command line or environment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Application name for config directory
const APP_NAME: &str = "kbucket";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Invalid port range: {0:?}")]
    InvalidPortRange(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Debug level logging
    #[serde(default)]
    pub debug: bool,

    /// Optional log file; receives debug output regardless of `debug`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub share: ShareConfig,
}

/// Settings of the hub process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Externally visible base URL, used to build download URLs
    pub url: String,
    /// Port of the HTTP surface
    pub listen_port: u16,
    /// Port shares connect their tunnels to
    pub tunnel_port: u16,
    /// Directory holding the hub's own raw store (`<data_dir>/raw/<sha1>`)
    pub data_dir: Option<PathBuf>,
    pub max_shares: usize,
    /// Advisory limit; exceeding it is logged, not refused
    pub max_files_per_share: usize,
    /// Time a share gets to send response headers for a tunnelled request
    pub response_timeout_secs: u64,
    /// Time each share gets to answer during a locate fan-out
    pub locate_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3240".to_string(),
            listen_port: 3240,
            tunnel_port: 3241,
            data_dir: None,
            max_shares: 1000,
            max_files_per_share: 10_000,
            response_timeout_secs: 60,
            locate_timeout_secs: 5,
        }
    }
}

impl HubConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn locate_timeout(&self) -> Duration {
        Duration::from_secs(self.locate_timeout_secs)
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

/// Settings of the share process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShareConfig {
    /// `host:port` of the hub's tunnel listener
    pub hub_address: String,
    /// Protocol advertised for direct downloads
    pub protocol: String,
    /// Host advertised for direct downloads
    pub host: String,
    /// Ports the local content server may bind, `lo-hi` or a single port
    pub port_range: String,
    /// External fingerprint program used instead of the built-in hasher
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint_tool: Option<String>,
    /// Static web interface served under `/<share_id>/web`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_dir: Option<PathBuf>,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            hub_address: "localhost:3241".to_string(),
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port_range: "12000-13000".to_string(),
            fingerprint_tool: None,
            web_dir: None,
        }
    }
}

impl ShareConfig {
    pub fn ports(&self) -> ConfigResult<(u16, u16)> {
        parse_port_range(&self.port_range)
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the config file path
    ///
    /// Returns ~/.config/kbucket/config.toml on Linux
    pub fn config_path() -> ConfigResult<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    pub fn config_dir() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME))
    }

    /// Load configuration from the default location
    ///
    /// Returns default config if the file doesn't exist
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save configuration to an explicit path, creating parent directories
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Hub data directory, defaulting to the platform data dir
    pub fn hub_data_dir(&self) -> ConfigResult<PathBuf> {
        match self.hub.data_dir {
            Some(ref dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join(APP_NAME).join("hub"))
                .ok_or(ConfigError::NoConfigDir),
        }
    }
}

/// Parse a port range such as `12000-13000` or `12000`.
pub fn parse_port_range(range: &str) -> ConfigResult<(u16, u16)> {
    let invalid = || ConfigError::InvalidPortRange(range.to_string());
    let parts: Vec<&str> = range.trim().split('-').collect();

    let (low, high) = match parts.as_slice() {
        [single] => {
            let port = single.trim().parse::<u16>().map_err(|_| invalid())?;
            (port, port)
        }
        [low, high] => (
            low.trim().parse::<u16>().map_err(|_| invalid())?,
            high.trim().parse::<u16>().map_err(|_| invalid())?,
        ),
        _ => return Err(invalid()),
    };

    if low == 0 || low > high {
        return Err(invalid());
    }
    Ok((low, high))
}

/// Format the configuration for display
pub fn format_config(config: &Config) -> String {
    let mut lines = Vec::new();

    lines.push("Current configuration:".to_string());
    lines.push(String::new());
    lines.push(format!("  debug = {}", config.debug));
    match config.log_file {
        Some(ref path) => lines.push(format!("  log_file = {:?}", path.display().to_string())),
        None => lines.push("  log_file = (not set)".to_string()),
    }

    lines.push(String::new());
    lines.push("  [hub]".to_string());
    lines.push(format!("  url = \"{}\"", config.hub.url));
    lines.push(format!("  listen_port = {}", config.hub.listen_port));
    lines.push(format!("  tunnel_port = {}", config.hub.tunnel_port));
    match config.hub.data_dir {
        Some(ref dir) => lines.push(format!("  data_dir = {:?}", dir.display().to_string())),
        None => lines.push("  data_dir = (not set, using platform data dir)".to_string()),
    }
    lines.push(format!("  max_shares = {}", config.hub.max_shares));
    lines.push(format!(
        "  max_files_per_share = {}",
        config.hub.max_files_per_share
    ));

    lines.push(String::new());
    lines.push("  [share]".to_string());
    lines.push(format!("  hub_address = \"{}\"", config.share.hub_address));
    lines.push(format!(
        "  advertised = {}://{} ports {}",
        config.share.protocol, config.share.host, config.share.port_range
    ));
    match config.share.fingerprint_tool {
        Some(ref tool) => lines.push(format!("  fingerprint_tool = \"{}\"", tool)),
        None => lines.push("  fingerprint_tool = (not set, built-in sha1)".to_string()),
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.debug);
        assert_eq!(config.hub.listen_port, 3240);
        assert_eq!(config.hub.max_shares, 1000);
        assert_eq!(config.share.ports().unwrap(), (12000, 13000));
        assert_eq!(config.hub.locate_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_deserialize_partial() {
        let toml_str = r#"
            debug = true

            [hub]
            url = "https://hub.example.org/"
            max_shares = 3
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.debug);
        assert_eq!(config.hub.base_url(), "https://hub.example.org");
        assert_eq!(config.hub.max_shares, 3);
        assert_eq!(config.hub.tunnel_port, 3241);
        assert_eq!(config.share, ShareConfig::default());
    }

    #[test]
    fn test_config_deserialize_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_serialize_roundtrip_skips_unset() {
        let config = Config::new();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(!toml_str.contains("fingerprint_tool"));
        assert!(!toml_str.contains("log_file"));
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("12000-13000").unwrap(), (12000, 13000));
        assert_eq!(parse_port_range("8080").unwrap(), (8080, 8080));
        assert_eq!(parse_port_range(" 10 - 20 ").unwrap(), (10, 20));
        for bad in ["", "abc", "1-2-3", "20-10", "0-10", "70000"] {
            assert!(
                matches!(parse_port_range(bad), Err(ConfigError::InvalidPortRange(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::new();
        config.hub.data_dir = Some(temp_dir.path().join("data"));
        config.share.fingerprint_tool = Some("ml-prv".to_string());
        config.save_to(&config_path).unwrap();

        let loaded = Config::load_from(&config_path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.hub_data_dir().unwrap(), temp_dir.path().join("data"));
    }

    #[test]
    fn test_load_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "hub = 5").unwrap();
        assert!(matches!(
            Config::load_from(&config_path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_format_config() {
        let output = format_config(&Config::default());
        assert!(output.contains("listen_port = 3240"));
        assert!(output.contains("log_file = (not set)"));
        assert!(output.contains("fingerprint_tool = (not set, built-in sha1)"));
    }

    #[test]
    fn test_config_path() {
        if let Ok(path) = Config::config_path() {
            assert!(path.to_string_lossy().contains("kbucket"));
            assert!(path.to_string_lossy().ends_with("config.toml"));
        }
    }
}
