//! Application configuration for ctirelay.
//!
//! User config lives at `~/.ctirelay/ctirelay.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CtiRelayError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "ctirelay.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".ctirelay";

/// Highest accepted confidence/score.
pub const MAX_CONFIDENCE: u8 = 100;

// ---------------------------------------------------------------------------
// Config structs (matching ctirelay.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Connector identity and polling behaviour.
    #[serde(default)]
    pub connector: ConnectorConfig,

    /// Durable queue location.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Object graph options.
    #[serde(default)]
    pub graph: GraphConfig,

    /// Producer identity stamped on every object.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Downstream sink.
    #[serde(default)]
    pub sink: SinkConfig,
}

/// `[connector]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Source name used in work labels.
    #[serde(default = "default_connector_name")]
    pub name: String,

    /// Default confidence, also the score for records that carry none.
    #[serde(default = "default_confidence")]
    pub confidence_level: u8,

    /// Seconds between polling cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Ask the sink to overwrite existing objects.
    #[serde(default)]
    pub update_existing_data: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: default_connector_name(),
            confidence_level: default_confidence(),
            poll_interval_secs: default_poll_interval(),
            update_existing_data: false,
        }
    }
}

fn default_connector_name() -> String {
    "ctirelay".into()
}
fn default_confidence() -> u8 {
    50
}
fn default_poll_interval() -> u64 {
    10
}

/// `[queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Directory holding one queue file per client.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.ctirelay/data".into()
}

/// `[graph]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Emit an indicator (plus based-on edge) for every observable.
    #[serde(default = "default_true")]
    pub create_indicators: bool,

    /// TLP marking applied to every object: white, clear, green, amber, red.
    #[serde(default = "default_marking")]
    pub default_marking: String,

    /// Labels appended to every record's own labels.
    #[serde(default)]
    pub default_labels: Vec<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            create_indicators: true,
            default_marking: default_marking(),
            default_labels: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_marking() -> String {
    "white".into()
}

/// `[identity]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Organization name.
    #[serde(default = "default_identity_name")]
    pub name: String,

    /// Free-text description.
    #[serde(default = "default_identity_description")]
    pub description: String,

    /// STIX identity class.
    #[serde(default = "default_identity_class")]
    pub identity_class: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            description: default_identity_description(),
            identity_class: default_identity_class(),
        }
    }
}

fn default_identity_name() -> String {
    "ctirelay".into()
}
fn default_identity_description() -> String {
    "Threat intelligence relay".into()
}
fn default_identity_class() -> String {
    "organization".into()
}

/// Which sink implementation receives bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Write bundles into a local outbox directory.
    Directory,
    /// POST bundles to an HTTP endpoint.
    Http,
}

/// `[sink]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Sink implementation.
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,

    /// Outbox directory for the directory sink.
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: String,

    /// Base URL for the HTTP sink.
    #[serde(default)]
    pub url: String,

    /// Name of the env var holding the sink bearer token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Upper bound for each sink call.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            outbox_dir: default_outbox_dir(),
            url: String::new(),
            token_env: default_token_env(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_sink_kind() -> SinkKind {
    SinkKind::Directory
}
fn default_outbox_dir() -> String {
    "~/.ctirelay/outbox".into()
}
fn default_token_env() -> String {
    "CTIRELAY_SINK_TOKEN".into()
}
fn default_timeout() -> u64 {
    30
}

impl AppConfig {
    /// Reject settings the relay cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.connector.name.trim().is_empty() {
            return Err(CtiRelayError::config("connector.name must not be empty"));
        }
        if self.connector.confidence_level > MAX_CONFIDENCE {
            return Err(CtiRelayError::config(format!(
                "connector.confidence_level must be at most {MAX_CONFIDENCE}, got {}",
                self.connector.confidence_level
            )));
        }
        if self.connector.poll_interval_secs == 0 {
            return Err(CtiRelayError::config(
                "connector.poll_interval_secs must be greater than zero",
            ));
        }
        if self.sink.timeout_secs == 0 {
            return Err(CtiRelayError::config(
                "sink.timeout_secs must be greater than zero",
            ));
        }
        if self.sink.kind == SinkKind::Http && self.sink.url.trim().is_empty() {
            return Err(CtiRelayError::config(
                "sink.url is required when sink.kind = \"http\"",
            ));
        }
        if self.identity.name.trim().is_empty() {
            return Err(CtiRelayError::config("identity.name must not be empty"));
        }
        Ok(())
    }

    /// Resolved queue directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.queue.data_dir)
    }

    /// Resolved outbox directory.
    pub fn outbox_dir(&self) -> Result<PathBuf> {
        expand_home(&self.sink.outbox_dir)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Expand a leading `~` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let home = dirs::home_dir()
                .ok_or_else(|| CtiRelayError::config("could not determine home directory"))?;
            Ok(home.join(rest.trim_start_matches('/')))
        }
        _ => Ok(PathBuf::from(path)),
    }
}

/// Get the path to the config directory (`~/.ctirelay/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CtiRelayError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.ctirelay/ctirelay.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CtiRelayError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        CtiRelayError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Write a default config file to `path` (or the default location).
/// Returns the path to the created file.
pub fn init_config(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| CtiRelayError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CtiRelayError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CtiRelayError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
