use crate::errors::{DaemonError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_API_BASE_URL: &str = "https://www.apinfautprd.com";
pub const DEFAULT_API_BIND_ADDR: &str = "127.0.0.1:8044";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub version: String,
    pub api_base_url: String,
    pub printer_name: Option<String>,
    pub auth_token: Option<String>,
    pub api_bind_addr: String,
    /// Start listening as soon as the daemon boots (requires `printer_name`).
    pub autostart: bool,
    pub timings: QueueTimings,
}

/// Intervals, retry bounds and timeouts used by the queue loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTimings {
    /// Sleep between fetches when the remote queue is empty
    pub idle_poll_ms: u64,
    /// Spooler poll interval while watching a job
    pub watch_poll_ms: u64,
    /// Deadline after which a pending submission is assumed spooled
    pub dispatch_race_ms: u64,
    /// Pause between dispatch and the first spooler lookup
    pub settle_delay_ms: u64,
    pub discovery_attempts: u32,
    pub discovery_delay_ms: u64,
    pub api_timeout_ms: u64,
    pub os_query_timeout_ms: u64,
}

impl Default for QueueTimings {
    fn default() -> Self {
        Self {
            idle_poll_ms: 2000,
            watch_poll_ms: 1000,
            dispatch_race_ms: 2500,
            settle_delay_ms: 600,
            discovery_attempts: 6,
            discovery_delay_ms: 700,
            api_timeout_ms: 15_000,
            os_query_timeout_ms: 8_000,
        }
    }
}

impl QueueTimings {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_millis(self.watch_poll_ms)
    }

    pub fn dispatch_race(&self) -> Duration {
        Duration::from_millis(self.dispatch_race_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn discovery_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_delay_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn os_query_timeout(&self) -> Duration {
        Duration::from_millis(self.os_query_timeout_ms)
    }
}

impl AppConfig {
    /// Per-user configuration directory for the relay
    pub fn config_dir() -> PathBuf {
        let base = if cfg!(target_os = "macos") {
            dirs::home_dir()
                .map(|p| p.join("Library/Application Support/print-queue-relay"))
        } else if cfg!(target_os = "windows") {
            dirs::config_dir().map(|p| p.join("Print Queue Relay"))
        } else {
            dirs::config_dir().map(|p| p.join("print-queue-relay"))
        };

        base.unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    pub fn log_dir() -> PathBuf {
        Self::config_dir().join("logs")
    }

    /// Load config from the default location, then apply env overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env();
        Ok(config)
    }

    /// Load config from a JSON file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&raw).map_err(|e| {
            warn!("Config file {:?} is invalid: {}", path, e);
            DaemonError::Config(format!("invalid config file {}: {}", path.display(), e))
        })?;

        debug!("Config loaded from {:?}", path);
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Config saved to {:?}", path);
        Ok(())
    }

    /// Override file settings with `PRINT_RELAY_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Some(url) = env_non_empty("PRINT_RELAY_API_URL") {
            self.api_base_url = url;
        }
        if let Some(printer) = env_non_empty("PRINT_RELAY_PRINTER") {
            self.printer_name = Some(printer);
        }
        if let Some(token) = env_non_empty("PRINT_RELAY_TOKEN") {
            self.auth_token = Some(token);
        }
        if let Some(addr) = env_non_empty("PRINT_RELAY_BIND") {
            self.api_bind_addr = addr;
        }
        if let Some(flag) = env_non_empty("PRINT_RELAY_AUTOSTART") {
            self.autostart = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        self.api_base_url = normalize_base_url(&self.api_base_url);
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            printer_name: None,
            auth_token: None,
            api_bind_addr: DEFAULT_API_BIND_ADDR.to_string(),
            autostart: false,
            timings: QueueTimings::default(),
        }
    }
}

/// Trim trailing slashes; an empty value falls back to the default API.
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_API_BASE_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
