//! LX47LE-125 register map and status word decoding.

use chrono::Utc;
use serde::Serialize;

use crate::error::{BreakerError, BreakerResult};
use crate::models::{BreakerStatus, ElectricalConfig, Measurements};

/// Input registers (function 0x04).
pub mod input {
    pub const STATUS: u16 = 0x0000;
    pub const TRIP_REASON: u16 = 0x0001;
    pub const FREQUENCY: u16 = 0x0002;
    pub const LEAKAGE_CURRENT: u16 = 0x0003;
    pub const TEMPERATURE: u16 = 0x0004;
    pub const VOLTAGE: u16 = 0x0005;
    pub const CURRENT: u16 = 0x0006;
    pub const ACTIVE_POWER: u16 = 0x0007;

    pub const MEASUREMENT_START: u16 = FREQUENCY;
    pub const MEASUREMENT_COUNT: u16 = ACTIVE_POWER - FREQUENCY + 1;
}

/// Holding registers (function 0x03).
pub mod holding {
    pub const OVER_VOLTAGE: u16 = 0x0002;
    pub const UNDER_VOLTAGE: u16 = 0x0003;
    pub const RATED_CURRENT: u16 = 0x0004;
    pub const LEAKAGE_THRESHOLD: u16 = 0x0005;
    pub const OVER_TEMPERATURE: u16 = 0x0006;
    pub const ALARM_CURRENT: u16 = 0x0007;

    pub const THRESHOLD_START: u16 = OVER_VOLTAGE;
    pub const THRESHOLD_COUNT: u16 = ALARM_CURRENT - OVER_VOLTAGE + 1;
}

/// Coils (function 0x05).
pub mod coil {
    pub const REMOTE_SWITCH: u16 = 0x0001;
    pub const REMOTE_LOCK: u16 = 0x0002;
    /// Reboots the breaker controller for roughly ten seconds.
    pub const DEVICE_RESET: u16 = 0x0003;
}

pub const NOMINAL_VOLTAGE: u16 = 230;

const SWITCH_CLOSED: u8 = 0xF0;
const SWITCH_OPEN: u8 = 0x0F;
const LOCAL_LOCKED: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    Closed,
    Open,
    /// Any other low byte, seen while the controller powers up.
    Unknown(u8),
}

impl From<SwitchState> for BreakerStatus {
    fn from(state: SwitchState) -> Self {
        match state {
            SwitchState::Closed => BreakerStatus::On,
            SwitchState::Open => BreakerStatus::Off,
            SwitchState::Unknown(_) => BreakerStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodedStatus {
    pub raw: u16,
    pub switch: SwitchState,
    pub locally_locked: bool,
}

impl DecodedStatus {
    /// `None` while the switch state is indeterminate.
    pub fn closed(&self) -> Option<bool> {
        match self.switch {
            SwitchState::Closed => Some(true),
            SwitchState::Open => Some(false),
            SwitchState::Unknown(_) => None,
        }
    }

    pub fn status(&self) -> BreakerStatus {
        self.switch.into()
    }
}

/// High byte carries the local lock flag, low byte the switch position.
pub fn decode(word: u16) -> DecodedStatus {
    let [high, low] = word.to_be_bytes();
    let switch = match low {
        SWITCH_CLOSED => SwitchState::Closed,
        SWITCH_OPEN => SwitchState::Open,
        other => SwitchState::Unknown(other),
    };
    DecodedStatus {
        raw: word,
        switch,
        locally_locked: high == LOCAL_LOCKED,
    }
}

fn expect_len(registers: &[u16], count: u16, what: &str) -> BreakerResult<()> {
    if registers.len() < count as usize {
        return Err(BreakerError::malformed(format!(
            "{} block needs {} registers, got {}",
            what,
            count,
            registers.len()
        )));
    }
    Ok(())
}

/// Decode the FC04 block starting at [`input::MEASUREMENT_START`].
pub fn decode_measurements(registers: &[u16]) -> BreakerResult<Measurements> {
    expect_len(registers, input::MEASUREMENT_COUNT, "measurement")?;
    let at = |addr: u16| registers[(addr - input::MEASUREMENT_START) as usize];
    Ok(Measurements {
        frequency_hz: at(input::FREQUENCY) as f64 / 10.0,
        leakage_ma: at(input::LEAKAGE_CURRENT),
        temperature_c: at(input::TEMPERATURE) as i16,
        voltage_v: at(input::VOLTAGE),
        current_a: at(input::CURRENT) as f64 / 100.0,
        active_power_w: at(input::ACTIVE_POWER),
        read_at: Utc::now(),
    })
}

/// Decode the FC03 threshold block starting at [`holding::THRESHOLD_START`].
pub fn decode_electrical_config(registers: &[u16]) -> BreakerResult<ElectricalConfig> {
    expect_len(registers, holding::THRESHOLD_COUNT, "threshold")?;
    let at = |addr: u16| registers[(addr - holding::THRESHOLD_START) as usize];
    Ok(ElectricalConfig {
        rated_voltage: NOMINAL_VOLTAGE,
        rated_current: at(holding::RATED_CURRENT) as f64 / 100.0,
        alarm_current: at(holding::ALARM_CURRENT) as f64 / 100.0,
        over_voltage: at(holding::OVER_VOLTAGE),
        under_voltage: at(holding::UNDER_VOLTAGE),
        leakage_threshold_ma: at(holding::LEAKAGE_THRESHOLD),
        over_temperature_c: at(holding::OVER_TEMPERATURE),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_iff_low_byte_is_f0() {
        for high in [0x00u16, 0x01, 0x7F, 0xFF] {
            for low in 0u16..=0xFF {
                let decoded = decode(high << 8 | low);
                match low {
                    0xF0 => assert_eq!(decoded.closed(), Some(true)),
                    0x0F => assert_eq!(decoded.closed(), Some(false)),
                    _ => {
                        assert_eq!(decoded.closed(), None);
                        assert_eq!(decoded.switch, SwitchState::Unknown(low as u8));
                        assert_eq!(decoded.status(), BreakerStatus::Unknown);
                    }
                }
            }
        }
    }

    #[test]
    fn high_byte_carries_local_lock() {
        assert!(decode(0x01F0).locally_locked);
        assert!(decode(0x010F).locally_locked);
        assert!(!decode(0x00F0).locally_locked);
        assert!(!decode(0x020F).locally_locked);
    }

    #[test]
    fn measurement_block_scaling() {
        let block = [500, 12, 41, 229, 1575, 3600];
        let m = decode_measurements(&block).unwrap();
        assert_eq!(m.frequency_hz, 50.0);
        assert_eq!(m.leakage_ma, 12);
        assert_eq!(m.temperature_c, 41);
        assert_eq!(m.voltage_v, 229);
        assert_eq!(m.current_a, 15.75);
        assert_eq!(m.active_power_w, 3600);
        assert!(decode_measurements(&block[..3]).is_err());
    }

    #[test]
    fn threshold_block_maps_by_address() {
        let block = [275, 165, 12500, 30, 85, 10000];
        let cfg = decode_electrical_config(&block).unwrap();
        assert_eq!(cfg.over_voltage, 275);
        assert_eq!(cfg.under_voltage, 165);
        assert_eq!(cfg.rated_current, 125.0);
        assert_eq!(cfg.leakage_threshold_ma, 30);
        assert_eq!(cfg.over_temperature_c, 85);
        assert_eq!(cfg.alarm_current, 100.0);
        assert_eq!(cfg.rated_voltage, NOMINAL_VOLTAGE);
    }
}
