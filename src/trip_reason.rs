//! Trip record decoding and operator remediation hints.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripCause {
    Local,
    Overcurrent,
    Leakage,
    OverTemperature,
    Overload,
    OverVoltage,
    UnderVoltage,
    Remote,
    ModuleFault,
    PowerLoss,
    Lock,
    EnergyLimit,
    Reserved(u8),
    NoTrip,
}

const CODE_TABLE: [TripCause; 16] = [
    TripCause::Local,
    TripCause::Overcurrent,
    TripCause::Leakage,
    TripCause::OverTemperature,
    TripCause::Overload,
    TripCause::OverVoltage,
    TripCause::UnderVoltage,
    TripCause::Remote,
    TripCause::ModuleFault,
    TripCause::PowerLoss,
    TripCause::Lock,
    TripCause::EnergyLimit,
    TripCause::Reserved(0xC),
    TripCause::Reserved(0xD),
    TripCause::Reserved(0xE),
    TripCause::NoTrip,
];

impl TripCause {
    pub fn from_code(code: u8) -> Self {
        CODE_TABLE[(code & 0x0F) as usize]
    }

    /// Label as printed in the device manual.
    pub fn label(self) -> &'static str {
        match self {
            TripCause::Local => "本地操作",
            TripCause::Overcurrent => "过流保护",
            TripCause::Leakage => "漏电保护",
            TripCause::OverTemperature => "过温保护",
            TripCause::Overload => "过载保护",
            TripCause::OverVoltage => "过压保护",
            TripCause::UnderVoltage => "欠压保护",
            TripCause::Remote => "远程操作",
            TripCause::ModuleFault => "模块故障",
            TripCause::PowerLoss => "掉电",
            TripCause::Lock => "锁扣",
            TripCause::EnergyLimit => "电量限制",
            TripCause::Reserved(_) => "保留",
            TripCause::NoTrip => "无跳闸记录",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TripCause::Local => "local",
            TripCause::Overcurrent => "overcurrent",
            TripCause::Leakage => "leakage",
            TripCause::OverTemperature => "over-temperature",
            TripCause::Overload => "overload",
            TripCause::OverVoltage => "over-voltage",
            TripCause::UnderVoltage => "under-voltage",
            TripCause::Remote => "remote",
            TripCause::ModuleFault => "module fault",
            TripCause::PowerLoss => "power loss",
            TripCause::Lock => "lock",
            TripCause::EnergyLimit => "energy limit",
            TripCause::Reserved(_) => "reserved",
            TripCause::NoTrip => "no trip record",
        }
    }

    pub fn suggestions(self) -> &'static [&'static str] {
        match self {
            TripCause::Local => &["Confirm with site staff why the breaker was operated by hand"],
            TripCause::Overcurrent => &[
                "Check downstream load for a short circuit",
                "Compare load current against the rated current setting",
                "Inspect cabling and terminals before re-closing",
            ],
            TripCause::Leakage => &[
                "Check insulation of the downstream circuit",
                "Look for moisture or damaged cable sheathing",
                "Disconnect loads one by one to isolate the leaking device",
            ],
            TripCause::OverTemperature => &[
                "Check cabinet ventilation and ambient temperature",
                "Re-torque terminals, loose contacts heat up",
                "Reduce load until the breaker has cooled down",
            ],
            TripCause::Overload => &[
                "Reduce or redistribute the connected load",
                "Review whether the rated current matches the circuit",
            ],
            TripCause::OverVoltage => &[
                "Measure supply voltage at the incoming feeder",
                "Check the over-voltage threshold setting",
            ],
            TripCause::UnderVoltage => &[
                "Measure supply voltage at the incoming feeder",
                "Check for heavy motor starts on the same supply",
                "Check the under-voltage threshold setting",
            ],
            TripCause::Remote => &["Review the control operation log for the opening command"],
            TripCause::ModuleFault => &[
                "Run an explicit device reset during a maintenance window",
                "Replace the control module if the fault persists",
            ],
            TripCause::PowerLoss => &["Check upstream supply and the control power of the module"],
            TripCause::Lock => &["Release the lock before attempting a remote close"],
            TripCause::EnergyLimit => &["Check the energy quota configured on the device"],
            TripCause::Reserved(_) => &["Record the raw code and consult the vendor"],
            TripCause::NoTrip => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TripDiagnosis {
    pub raw: u16,
    pub composite: bool,
    pub causes: Vec<TripCause>,
    pub reasons: Vec<&'static str>,
    pub suggestions: Vec<&'static str>,
}

impl TripDiagnosis {
    pub fn tripped(&self) -> bool {
        self.causes.iter().any(|c| *c != TripCause::NoTrip)
    }
}

/// Values up to 0xF are a single code; larger values are a bitmask where bit
/// `n` stands for code `n`.
pub fn decode_trip(raw: u16) -> TripDiagnosis {
    let composite = raw > 0x0F;
    let causes: Vec<TripCause> = if composite {
        (0u8..16)
            .filter(|bit| raw & (1 << bit) != 0)
            .map(TripCause::from_code)
            .filter(|cause| *cause != TripCause::NoTrip)
            .collect()
    } else {
        vec![TripCause::from_code(raw as u8)]
    };

    let reasons = causes.iter().map(|c| c.label()).collect();
    let mut suggestions: Vec<&'static str> = Vec::new();
    for cause in &causes {
        for hint in cause.suggestions() {
            if !suggestions.contains(hint) {
                suggestions.push(hint);
            }
        }
    }

    TripDiagnosis {
        raw,
        composite,
        causes,
        reasons,
        suggestions,
    }
}
