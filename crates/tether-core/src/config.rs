//! Configuration resolution for Tether.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/tether/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`TETHER_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete Tether configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address agents connect to.
    pub listen_addr: String,
    pub database_path: Option<PathBuf>,
    /// Depth of each agent's outbound message queue.
    pub outbound_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5120".to_string(),
            database_path: None,
            outbound_queue_depth: 128,
        }
    }
}

/// Command and script dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long an ad-hoc command waits for the agent's reply.
    pub command_timeout_secs: u64,
    /// Lifetime of the capability token handed to agents with each instruction.
    pub token_ttl_minutes: i64,
    /// How often unread correlation entries are swept.
    pub reap_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
            token_ttl_minutes: 30,
            reap_interval_secs: 60,
        }
    }
}

impl DispatchConfig {
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Recurring schedule trigger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub tick_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 30,
        }
    }
}

/// Chunked file transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Directory received files land in. Defaults to `<data dir>/tether/shared`.
    pub base_dir: Option<PathBuf>,
    /// Payload size of each outbound chunk, in bytes.
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            chunk_size: 64 * 1024,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// When set, logs are also written to `<log_dir>/<component>/LogFile_<date>.log`.
    pub log_dir: Option<PathBuf>,
    pub json: bool,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        let overlay = load_config_file(path)?;
        merge_config(&mut config, overlay);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".tether").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/tether/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("tether").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.server.database_path.is_some() {
        base.server.database_path = overlay.server.database_path;
    }
    base.server.listen_addr = overlay.server.listen_addr;
    base.server.outbound_queue_depth = overlay.server.outbound_queue_depth;

    base.dispatch = overlay.dispatch;
    base.schedule = overlay.schedule;

    if overlay.transfer.base_dir.is_some() {
        base.transfer.base_dir = overlay.transfer.base_dir;
    }
    base.transfer.chunk_size = overlay.transfer.chunk_size;

    if overlay.logging.log_dir.is_some() {
        base.logging.log_dir = overlay.logging.log_dir;
    }
    base.logging.json = overlay.logging.json;
}

/// Apply `TETHER_*` overrides. `lookup` resolves a variable name to its value.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("TETHER_LISTEN_ADDR") {
        config.server.listen_addr = val;
    }
    if let Some(val) = lookup("TETHER_DB_PATH") {
        config.server.database_path = Some(PathBuf::from(val));
    }
    if let Some(n) = lookup("TETHER_COMMAND_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.dispatch.command_timeout_secs = n;
    }
    if let Some(n) = lookup("TETHER_TOKEN_TTL_MINUTES").and_then(|v| v.parse().ok()) {
        config.dispatch.token_ttl_minutes = n;
    }
    if let Some(n) = lookup("TETHER_SCHEDULE_TICK_SECS").and_then(|v| v.parse().ok()) {
        config.schedule.tick_interval_secs = n;
    }
    if let Some(val) = lookup("TETHER_TRANSFER_DIR") {
        config.transfer.base_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("TETHER_LOG_DIR") {
        config.logging.log_dir = Some(PathBuf::from(val));
    }
}
