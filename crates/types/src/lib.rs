#![allow(dead_code)]

use std::fmt;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Classification of a single command exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    None,
    Crc,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::None => 0,
            ErrorKind::Crc => 1,
            ErrorKind::Timeout => 2,
            ErrorKind::Unknown => 3,
        }
    }

    /// Codes outside the table (the dispatch-level `-1` included) are `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ErrorKind::None,
            1 => ErrorKind::Crc,
            2 => ErrorKind::Timeout,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn is_success(self) -> bool {
        self == ErrorKind::None
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::None => "NONE",
            ErrorKind::Crc => "CRC",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Availability of the inverter link as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    #[default]
    Offline,
    Online,
    Uncertain,
}

impl LinkHealth {
    pub fn is_available(self) -> bool {
        matches!(self, LinkHealth::Online | LinkHealth::Uncertain)
    }
}

impl fmt::Display for LinkHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkHealth::Offline => "OFFLINE",
            LinkHealth::Online => "ONLINE",
            LinkHealth::Uncertain => "UNCERTAIN",
        };
        f.write_str(name)
    }
}

/// One acquisition cycle worth of measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: NaiveDateTime,
    pub grid_power_w: f64,
    pub daily_energy_wh: f64,
    pub grid_voltage_v: f64,
    pub inverter_temp_c: f64,
}

/// Serial link and device addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwSettings {
    pub serial_port: String,
    pub baud_rate: u32,
    pub inverter_address: u8,
}

impl Default for HwSettings {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19_200,
            inverter_address: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub poll_interval_secs: f64,
    /// Publish the locally accumulated energy instead of the raw counter.
    pub energy_estimation: bool,
}

impl MonitorSettings {
    /// Falls back to one second when the configured value is not a positive finite number.
    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_secs)
            .ok()
            .filter(|interval| !interval.is_zero())
            .unwrap_or(Duration::from_secs(1))
    }

    pub fn is_valid(&self) -> bool {
        self.poll_interval_secs.is_finite() && self.poll_interval_secs > 0.0
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10.0,
            energy_estimation: false,
        }
    }
}

/// Events published by the monitor for downstream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    Started,
    Telemetry(TelemetrySample),
    LinkStatus {
        health: LinkHealth,
        online: bool,
    },
    DailyPeakPower {
        value_w: f64,
        timestamp: NaiveDateTime,
    },
    SettingsChanged(HwSettings),
}
