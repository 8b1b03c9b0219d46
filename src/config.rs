//! ==============================================================================
//! config.rs - Agent Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `agent.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - DeviceConfig: identity string shared by both backends.
//!     - NetworkConfig: wifi credentials, connect timeout, poll and retry cadence.
//!     - BackendConfig: REST endpoint for the primary sink.
//!     - RealtimeConfig: realtime database api key, credentials, project.
//!     - StorageConfig: where the durable energy total lives.
//!     - TelemetryConfig: tick rate and save cadence.
//!     - StatusConfig / LoggingConfig: local status api and log verbosity.
//!
//! ==============================================================================

use crate::error::{AgentError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 5_000;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { id: "energy-meter-01".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ssid: String,
    pub password: String,
    /// "simulated" or "nmcli"
    pub radio: String,
    /// interface checked by the nmcli radio
    pub interface: String,
    pub connect_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            radio: "simulated".to_string(),
            interface: "wlan0".to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/api/energy/".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub api_key: String,
    pub email: String,
    pub password: String,
    pub project_id: String,
    /// overrides the url derived from `project_id` (emulators, tests)
    pub database_url: Option<String>,
    /// overrides the identity endpoint base
    pub identity_url: Option<String>,
    pub request_timeout_ms: u64,
    pub stream_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            email: String::new(),
            password: String::new(),
            project_id: String::new(),
            database_url: None,
            identity_url: None,
            request_timeout_ms: 10_000,
            stream_timeout_ms: 45_000,
        }
    }
}

impl RealtimeConfig {
    /// base url of the database, always with a trailing slash
    pub fn database_url(&self) -> String {
        let base = match &self.database_url {
            Some(url) => url.clone(),
            None => format!("https://{}.firebaseio.com/", self.project_id),
        };
        if base.ends_with('/') {
            base
        } else {
            format!("{}/", base)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub namespace: String,
    pub key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data").join("energy.json"),
            namespace: "energyData".to_string(),
            key: "energy_generated".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    pub tick_interval_ms: u64,
    /// save the running total every n ticks
    pub save_interval_ticks: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { tick_interval_ms: 1_000, save_interval_ticks: 10 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { enabled: true, bind: "0.0.0.0:3000".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_measurements: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_measurements: false }
    }
}

impl AgentConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AgentError::Config(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: AgentConfig = toml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    ///
    /// `AGENT_CONFIG` wins when set; a broken explicit path is an error,
    /// a broken well-known path is only a warning.
    pub fn load_or_default() -> Result<Self> {
        if let Ok(explicit) = std::env::var("AGENT_CONFIG") {
            let config = Self::load(&explicit)?;
            info!(path = %explicit, "config loaded");
            return Ok(config);
        }

        let paths = [
            PathBuf::from("config").join("agent.toml"),
            PathBuf::from("..").join("config").join("agent.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        info!(path = %path.display(), "config loaded");
                        return Ok(config);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to load config");
                    }
                }
            }
        }

        warn!("no config file found - using defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// secrets can stay out of the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AGENT_WIFI_PASSWORD") {
            self.network.password = v;
        }
        if let Ok(v) = std::env::var("AGENT_DB_API_KEY") {
            self.realtime.api_key = v;
        }
        if let Ok(v) = std::env::var("AGENT_DB_PASSWORD") {
            self.realtime.password = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.id.trim().is_empty() {
            return Err(AgentError::Config("device.id must not be empty".into()));
        }
        if self.telemetry.tick_interval_ms == 0 {
            return Err(AgentError::Config("telemetry.tick_interval_ms must be > 0".into()));
        }
        if self.telemetry.save_interval_ticks == 0 {
            return Err(AgentError::Config("telemetry.save_interval_ticks must be > 0".into()));
        }
        if self.network.poll_interval_ms == 0 {
            return Err(AgentError::Config("network.poll_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Log configuration summary (no secrets)
    pub fn print_summary(&self) {
        info!("┌─────────────────────────────────────────┐");
        info!("│          AGENT CONFIGURATION            │");
        info!("├─────────────────────────────────────────┤");
        info!("│ Device: {}", self.device.id);
        info!("│ SSID: {} (radio: {})", self.network.ssid, self.network.radio);
        info!(
            "│ WiFi timeout/retry: {}ms / {}ms",
            self.network.connect_timeout_ms, self.network.retry_interval_ms
        );
        info!("│ Backend: {}", self.backend.url);
        if self.realtime.enabled {
            info!("│ Realtime DB: {}", self.realtime.database_url());
        } else {
            info!("│ Realtime DB: disabled");
        }
        info!("│ Store: {}", self.storage.path.display());
        info!(
            "│ Tick: {}ms, save every {} ticks",
            self.telemetry.tick_interval_ms, self.telemetry.save_interval_ticks
        );
        info!("└─────────────────────────────────────────┘");
    }
}
