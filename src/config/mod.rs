//! Host configuration (TOML file > defaults).
//!
//! ```toml
//! enabled = true
//!
//! [dispatch]
//! max_in_flight = 8
//! call_timeout_ms = 20000
//!
//! [servers.search]
//! endpoint = "https://search.example.com/mcp"
//! instruction = "Web search over the public internet."
//! headers = { Authorization = "Bearer ${SEARCH_TOKEN}" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ToolHostError};

/// Environment variable that overrides the default config path.
pub const CONFIG_PATH_ENV: &str = "ROCI_TOOLHOST_CONFIG";

const CONFIG_FILE_NAME: &str = "toolhost.toml";

/// Top-level tool host configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Master switch for the whole subsystem.
    pub enabled: bool,
    pub dispatch: DispatchConfig,
    pub connections: ConnectionConfig,
    pub catalog: CatalogConfig,
    /// Capability servers keyed by name.
    pub servers: BTreeMap<String, ServerEntry>,
}

/// Fan-out limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Ceiling on remote calls in flight across all requests.
    pub max_in_flight: usize,
    /// Deadline for a single per-server call.
    pub call_timeout_ms: u64,
    /// Caller-level deadline for a whole request, if any.
    pub request_timeout_ms: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            call_timeout_ms: 30_000,
            request_timeout_ms: None,
        }
    }
}

impl DispatchConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Connection lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Connect every server at startup instead of on first use.
    pub connect_eagerly: bool,
    pub handshake_timeout_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_eagerly: false,
            handshake_timeout_ms: 10_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Reconnect backoff for degraded servers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Catalog refresh settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// Periodic re-sync interval; `0` disables the timer.
    pub refresh_interval_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
        }
    }
}

impl CatalogConfig {
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

/// Raw, unvalidated entry for one capability server.
///
/// Header values may contain `${VAR}` (or `<VAR>`) placeholders that are
/// resolved when the descriptor store loads the entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    pub endpoint: String,
    #[serde(default)]
    pub headers: toml::Table,
    #[serde(default)]
    pub instruction: String,
}

impl ServerEntry {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers: toml::Table::new(),
            instruction: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into(), toml::Value::String(value.into()));
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }
}

impl HostConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Load `.env`, then the config file named by `ROCI_TOOLHOST_CONFIG` or
    /// `~/.roci/toolhost.toml`. Returns `None` when no file exists.
    pub fn load_default() -> Result<Option<Self>> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let path = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => PathBuf::from(path),
            None => default_config_path(),
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no tool host config file");
            return Ok(None);
        }
        Self::from_file(&path).map(Some)
    }

    /// Register a server entry.
    pub fn with_server(mut self, name: impl Into<String>, entry: ServerEntry) -> Self {
        self.servers.insert(name.into(), entry);
        self
    }

    /// Reject settings the host cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_in_flight == 0 {
            return Err(ToolHostError::Configuration(
                "dispatch.max_in_flight must be at least 1".into(),
            ));
        }
        if self.dispatch.call_timeout_ms == 0 {
            return Err(ToolHostError::Configuration(
                "dispatch.call_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.dispatch.request_timeout_ms == Some(0) {
            return Err(ToolHostError::Configuration(
                "dispatch.request_timeout_ms must be greater than 0 when set".into(),
            ));
        }
        let backoff = &self.connections.backoff;
        if backoff.initial_ms == 0 || backoff.max_ms < backoff.initial_ms {
            return Err(ToolHostError::Configuration(
                "connections.backoff requires 0 < initial_ms <= max_ms".into(),
            ));
        }
        if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
            return Err(ToolHostError::Configuration(
                "connections.backoff.multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Default config location: `~/.roci/toolhost.toml`.
pub fn default_config_path() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".roci"))
        .unwrap_or_else(|| PathBuf::from(".roci"))
        .join(CONFIG_FILE_NAME)
}
