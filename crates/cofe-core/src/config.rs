//! Configuration resolution for the Cofe relay.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/cofe/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (applied by the binary, highest priority)
//!
//! Settings files may be partial: each layer is deep-merged over the
//! previous one before deserializing.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::correlator::CorrelatorConfig;
use crate::error::{Error, Result};

/// Complete relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub workflow: WorkflowConfig,
    pub correlator: CorrelatorSettings,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub delivery_mode: DeliveryMode,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            delivery_mode: DeliveryMode::LongPoll,
            log_level: "info".to_string(),
        }
    }
}

/// How the gateway answers a prompt submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// Hold the submission open until the answer arrives or the wait times out.
    #[default]
    LongPoll,
    /// Return the request id immediately; the client polls for the answer.
    AsyncAck,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LongPoll => write!(f, "long-poll"),
            Self::AsyncAck => write!(f, "async-ack"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "long-poll" | "longpoll" => Ok(Self::LongPoll),
            "async-ack" | "async" => Ok(Self::AsyncAck),
            other => Err(Error::Config(format!("Unknown delivery mode: {other}"))),
        }
    }
}

/// Outbound workflow webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Webhook that receives `{ prompt, requestId }`. `None` means not wired yet.
    pub webhook_url: Option<String>,
    /// Timeout for the outbound forward call (seconds).
    pub forward_timeout_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            forward_timeout_secs: 10,
        }
    }
}

/// Pending-request bookkeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CorrelatorSettings {
    /// Longest a submission or poll is held open (seconds).
    pub await_timeout_secs: u64,
    /// How long any entry may stay in the registry (seconds).
    pub retention_secs: u64,
    /// Age at which a still-pending entry is expired (seconds).
    pub max_pending_age_secs: u64,
    /// Period of the background sweep (seconds).
    pub sweep_interval_secs: u64,
    /// Concurrent waiters allowed per request id.
    pub max_waiters: usize,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            await_timeout_secs: 120,
            retention_secs: 600,
            max_pending_age_secs: 300,
            sweep_interval_secs: 30,
            max_waiters: 4,
        }
    }
}

impl Config {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let c = &self.correlator;
        if c.await_timeout_secs == 0 {
            return Err(Error::Config("await_timeout_secs must be > 0".into()));
        }
        if c.sweep_interval_secs == 0 {
            return Err(Error::Config("sweep_interval_secs must be > 0".into()));
        }
        if c.max_pending_age_secs == 0 {
            return Err(Error::Config("max_pending_age_secs must be > 0".into()));
        }
        if c.max_pending_age_secs > c.retention_secs {
            return Err(Error::Config(format!(
                "max_pending_age_secs ({}) must not exceed retention_secs ({})",
                c.max_pending_age_secs, c.retention_secs
            )));
        }
        if c.max_waiters == 0 {
            return Err(Error::Config("max_waiters must be > 0".into()));
        }
        if self.workflow.forward_timeout_secs == 0 {
            return Err(Error::Config("forward_timeout_secs must be > 0".into()));
        }
        if let Some(url) = &self.workflow.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "webhook_url must be an http(s) URL: {url}"
                )));
            }
        }
        Ok(())
    }

    /// Correlator settings in the form the registry consumes.
    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            retention: Duration::from_secs(self.correlator.retention_secs),
            max_pending_age: Duration::from_secs(self.correlator.max_pending_age_secs),
            max_waiters: self.correlator.max_waiters,
        }
    }

    pub const fn await_timeout(&self) -> Duration {
        Duration::from_secs(self.correlator.await_timeout_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.correlator.sweep_interval_secs)
    }

    pub const fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow.forward_timeout_secs)
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` must exist when given; the global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_config(&mut merged, load_config_file(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        merge_config(&mut merged, load_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("cofe").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`. Objects merge per key, anything else replaces.
fn merge_config(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_config(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply environment overrides read through `lookup`.
///
/// `PORT` and `N8N_WEBHOOK_URL` are honoured for compatibility with the
/// Node backend's `.env` files; the `COFE_*` names take precedence.
pub fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(val) = lookup("PORT") {
        let port: u16 = val
            .parse()
            .map_err(|_| Error::Config(format!("Invalid PORT: {val}")))?;
        config.server.listen_addr.set_port(port);
    }
    if let Some(val) = lookup("COFE_LISTEN_ADDR") {
        config.server.listen_addr = val
            .parse()
            .map_err(|_| Error::Config(format!("Invalid COFE_LISTEN_ADDR: {val}")))?;
    }
    if let Some(val) = lookup("COFE_DELIVERY_MODE") {
        config.server.delivery_mode = val.parse()?;
    }
    if let Some(val) = lookup("COFE_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if let Some(val) = lookup("COFE_WEBHOOK_URL").or_else(|| lookup("N8N_WEBHOOK_URL")) {
        config.workflow.webhook_url = Some(val).filter(|v| !v.trim().is_empty());
    }
    if let Some(val) = lookup("COFE_AWAIT_TIMEOUT_SECS") {
        config.correlator.await_timeout_secs = val.parse().map_err(|_| {
            Error::Config(format!("Invalid COFE_AWAIT_TIMEOUT_SECS: {val}"))
        })?;
    }
    Ok(())
}
