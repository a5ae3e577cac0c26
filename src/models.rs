use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BreakerError, ErrorKind};

pub type BreakerId = u32;

/// Switch state as mirrored in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BreakerStatus {
    On,
    Off,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// MODBUS unit id of the breaker behind the gateway.
    pub station_id: u8,
}

fn default_modbus_port() -> u16 {
    502
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, station_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            station_id,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Thresholds programmed into the device. Read at provisioning, not per poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectricalConfig {
    pub rated_voltage: u16,
    pub rated_current: f64,
    pub alarm_current: f64,
    pub over_voltage: u16,
    pub under_voltage: u16,
    pub leakage_threshold_ma: u16,
    pub over_temperature_c: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub frequency_hz: f64,
    pub leakage_ma: u16,
    pub temperature_c: i16,
    pub voltage_v: u16,
    pub current_a: f64,
    pub active_power_w: u16,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breaker {
    pub id: BreakerId,
    pub name: String,
    pub endpoint: Endpoint,
    pub is_controllable: bool,
    pub is_enabled: bool,
    /// Remote lock. Authoritative in storage, never re-derived from a poll.
    pub is_locked: bool,
    /// Physical lock bit from the last decoded status word.
    #[serde(default)]
    pub local_lock: bool,
    #[serde(default)]
    pub status: BreakerStatus,
    /// False once the monitor could not read the device, until the next good read.
    #[serde(default)]
    pub reachable: bool,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub electrical: Option<ElectricalConfig>,
}

impl Breaker {
    pub fn new(id: BreakerId, name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            id,
            name: name.into(),
            endpoint,
            is_controllable: true,
            is_enabled: true,
            is_locked: false,
            local_lock: false,
            status: BreakerStatus::Unknown,
            reachable: false,
            last_update: None,
            electrical: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    On,
    Off,
    Toggle,
}

impl std::str::FromStr for ControlAction {
    type Err = BreakerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "close" => Ok(ControlAction::On),
            "off" | "open" => Ok(ControlAction::Off),
            "toggle" => Ok(ControlAction::Toggle),
            other => Err(BreakerError::UnsupportedOperation(format!("unknown action '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// Terminal state of the safe operation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOutcome {
    AlreadyAtTarget,
    Succeeded,
    Locked,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlOperation {
    pub control_id: String,
    pub breaker_id: BreakerId,
    pub action: ControlAction,
    pub status: OperationStatus,
    pub outcome: Option<ControlOutcome>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub success: bool,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Confirmation polls used before the operation terminated.
    pub confirm_attempts: u32,
    pub elapsed_ms: Option<u64>,
}

impl ControlOperation {
    pub fn new(breaker_id: BreakerId, action: ControlAction) -> Self {
        Self {
            control_id: uuid::Uuid::new_v4().to_string(),
            breaker_id,
            action,
            status: OperationStatus::Pending,
            outcome: None,
            start_time: Utc::now(),
            end_time: None,
            success: false,
            error_message: None,
            error_kind: None,
            confirm_attempts: 0,
            elapsed_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, OperationStatus::Completed | OperationStatus::Failed)
    }

    pub fn begin(&mut self) {
        self.status = OperationStatus::Executing;
    }

    pub fn complete(&mut self, outcome: ControlOutcome, attempts: u32) {
        self.status = OperationStatus::Completed;
        self.outcome = Some(outcome);
        self.success = true;
        self.confirm_attempts = attempts;
        self.finish();
    }

    pub fn fail(&mut self, err: &BreakerError) {
        self.status = OperationStatus::Failed;
        self.outcome = Some(match err {
            BreakerError::DeviceLocked { .. } => ControlOutcome::Locked,
            BreakerError::OperationTimedOut { attempts } => {
                self.confirm_attempts = *attempts;
                ControlOutcome::TimedOut
            }
            _ => ControlOutcome::Failed,
        });
        self.success = false;
        self.error_message = Some(err.to_string());
        self.error_kind = Some(err.kind());
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.elapsed_ms = Some((now - self.start_time).num_milliseconds().max(0) as u64);
        self.end_time = Some(now);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub max_retries: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_retries: 1,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Answer to "read current breaker status". A failed read is reported as
/// `Unknown` next to the last mirrored state, never as a guessed value.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub breaker_id: BreakerId,
    pub status: BreakerStatus,
    pub locally_locked: Option<bool>,
    pub remotely_locked: bool,
    pub reachable: bool,
    pub raw_status: Option<u16>,
    pub last_known: BreakerStatus,
    pub last_update: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
