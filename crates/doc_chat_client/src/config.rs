//! Client config load/save for `~/.doc-chat/config.yaml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::connection::endpoint_url;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:8000/ws/chat";

/// Server section (url, token).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ServerSection {
    /// Endpoint with the token as query parameter. Fails on a malformed `url`.
    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        endpoint_url(
            self.url.as_deref().unwrap_or(DEFAULT_URL),
            self.token.as_deref(),
        )
    }
}

/// What happens to pending requests when the socket drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonPolicy {
    /// Fail them locally with a `connection_lost` error.
    #[default]
    FailPending,
    /// Leave them pending; the caller applies its own deadline.
    KeepPending,
}

/// Connection section (reconnect backoff, timeouts, abandon policy).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub max_retries: u8,
    pub max_backoff_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub abandon_policy: AbandonPolicy,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_backoff_secs: 30,
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
            abandon_policy: AbandonPolicy::FailPending,
        }
    }
}

impl ConnectionSection {
    /// How long `open` waits for the handshake.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// How long the CLI waits for an answer before disposing the request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Retrieval defaults for outgoing messages. Sent as-is.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub k_vec: u32,
    pub k_text: u32,
    pub use_text: bool,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            k_vec: 6,
            k_text: 6,
            use_text: false,
        }
    }
}

/// Full config.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
}

/// Returns the default config file path: `~/.doc-chat/config.yaml` (platform-specific).
pub fn default_config_path() -> Option<PathBuf> {
    let home = home_dir()?;
    Some(home.join(".doc-chat").join("config.yaml"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

/// Load config from a YAML file. The server URL is validated here.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.server.endpoint()?;
    Ok(config)
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Config load/save error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid server URL: {0}")]
    Url(#[from] url::ParseError),
}
