use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{BreakerError, BreakerResult};
use crate::models::{Breaker, BreakerId, Endpoint, MonitorConfig};

pub const CONFIG_ENV: &str = "BREAKER_CONFIG";
const CONFIG_CANDIDATES: [&str; 2] = ["breaker_config.json", "config/breaker_config.json"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub monitor_dial_ms: u64,
    pub monitor_read_ms: u64,
    pub control_dial_ms: u64,
    pub control_read_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            monitor_dial_ms: 1000,
            monitor_read_ms: 2000,
            control_dial_ms: 3000,
            control_read_ms: 5000,
        }
    }
}

impl TimeoutSettings {
    pub fn monitor(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.monitor_dial_ms),
            Duration::from_millis(self.monitor_read_ms),
        )
    }

    pub fn control(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.control_dial_ms),
            Duration::from_millis(self.control_read_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub confirm_attempts: u32,
    pub confirm_interval_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            confirm_attempts: 10,
            confirm_interval_ms: 1000,
        }
    }
}

impl ControlSettings {
    pub fn confirm_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Vendor management port of the serial gateway, if it has one.
    pub management_port: Option<u16>,
    pub management_command: String,
    /// MODBUS ports to flush; empty means the breaker's own port.
    pub flush_ports: Vec<u16>,
    pub flush_connections: usize,
    pub settle_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            management_port: None,
            management_command: "AT+Z\r\n".to_string(),
            flush_ports: Vec::new(),
            flush_connections: 5,
            settle_ms: 2000,
        }
    }
}

impl GatewaySettings {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Breaker as provisioned in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSeed {
    pub id: BreakerId,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub station_id: u8,
    #[serde(default = "default_true")]
    pub controllable: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    502
}

fn default_true() -> bool {
    true
}

impl BreakerSeed {
    pub fn to_breaker(&self) -> Breaker {
        let mut breaker = Breaker::new(
            self.id,
            self.name.clone(),
            Endpoint::new(self.host.clone(), self.port, self.station_id),
        );
        breaker.is_controllable = self.controllable;
        breaker.is_enabled = self.enabled;
        breaker
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen: String,
    pub store_path: PathBuf,
    /// Finished control operations kept in the store.
    pub operation_history: usize,
    pub monitor: MonitorConfig,
    pub timeouts: TimeoutSettings,
    pub control: ControlSettings,
    pub gateway: GatewaySettings,
    pub breakers: Vec<BreakerSeed>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            store_path: PathBuf::from("breaker_state.json"),
            operation_history: crate::store::DEFAULT_OPERATION_HISTORY,
            monitor: MonitorConfig::default(),
            timeouts: TimeoutSettings::default(),
            control: ControlSettings::default(),
            gateway: GatewaySettings::default(),
            breakers: Vec::new(),
        }
    }
}

impl AppConfig {
    /// `$BREAKER_CONFIG`, then the working directory, then `config/`.
    /// No file at all yields the defaults; an unreadable one is an error.
    pub async fn load() -> BreakerResult<Self> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(path));
        }
        candidates.extend(CONFIG_CANDIDATES.iter().map(PathBuf::from));

        for path in candidates {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => return Self::from_json(&text, &path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(BreakerError::InvalidConfig(format!("read {}: {}", path.display(), e)))
                }
            }
        }
        info!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_json(text: &str, origin: &Path) -> BreakerResult<Self> {
        let config: AppConfig = serde_json::from_str(text)
            .map_err(|e| BreakerError::InvalidConfig(format!("{}: {}", origin.display(), e)))?;
        config.validate()?;
        info!("Configuration loaded from {}", origin.display());
        Ok(config)
    }

    pub fn validate(&self) -> BreakerResult<()> {
        if self.monitor.interval_secs == 0 {
            return Err(BreakerError::InvalidConfig("monitor.interval_secs must be at least 1".into()));
        }
        if self.operation_history == 0 {
            return Err(BreakerError::InvalidConfig("operation_history must be at least 1".into()));
        }
        if self.control.confirm_attempts == 0 {
            return Err(BreakerError::InvalidConfig("control.confirm_attempts must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for seed in &self.breakers {
            if !seen.insert(seed.id) {
                return Err(BreakerError::InvalidConfig(format!("duplicate breaker id {}", seed.id)));
            }
            if seed.station_id == 0 {
                return Err(BreakerError::InvalidConfig(format!(
                    "breaker {} uses broadcast station id 0",
                    seed.id
                )));
            }
        }
        Ok(())
    }
}
