//! Framing for the Aurora inverter serial protocol.
//!
//! Every exchange is a fixed 10 byte request answered by a fixed 8 byte
//! response. Both frames end with a CRC-16/X-25 over the preceding bytes,
//! low byte first.

use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use crc16::{State, X_25};
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

pub const REQUEST_LEN: usize = 10;
pub const RESPONSE_LEN: usize = 8;

const BODY_LEN: usize = RESPONSE_LEN - 2;
/// 2000-01-01T00:00:00Z, the origin of the inverter clock.
const AURORA_EPOCH_UNIX: i64 = 946_684_800;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected frame length: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("checksum mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    Checksum { received: u16, computed: u16 },
    #[error("command rejected by device, transmission state {0}")]
    Rejected(u8),
}

impl CodecError {
    /// Length and checksum failures mean the frame cannot be trusted at all.
    pub fn is_integrity(&self) -> bool {
        matches!(self, CodecError::Truncated { .. } | CodecError::Checksum { .. })
    }
}

/// DSP measurement selectors for opcode 59.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DspMeasure {
    GridVoltage = 1,
    GridCurrent = 2,
    GridPower = 3,
    Frequency = 4,
    VBulk = 5,
    ILeakDcDc = 6,
    ILeakInverter = 7,
    Pin1 = 8,
    Pin2 = 9,
    InverterTemperature = 21,
    BoosterTemperature = 22,
    Input1Voltage = 23,
    Input1Current = 25,
    Input2Voltage = 26,
    Input2Current = 27,
    GridVoltageDcDc = 28,
    GridFrequencyDcDc = 29,
    IsolationResistance = 30,
    VBulkDcDc = 31,
    AverageGridVoltage = 32,
    VBulkMid = 33,
    PowerPeak = 34,
    PowerPeakToday = 35,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EnergyPeriod {
    Daily = 0,
    Weekly = 1,
    // 2 is not assigned by the firmware
    Monthly = 3,
    Yearly = 4,
    Total = 5,
    Partial = 6,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CounterKind {
    Total = 0,
    Partial = 1,
    Grid = 2,
    ResetPartial = 3,
}

/// Protocol operations understood by the inverter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Request {
    State,
    ProductNumber,
    SerialNumber,
    VersionId,
    DspValue(DspMeasure),
    ManufacturingDate,
    ActualTime,
    FirmwareVersion,
    SystemConfig,
    CumulatedEnergy(EnergyPeriod),
    TimeCounter(CounterKind),
    LastAlarms,
}

impl Request {
    pub fn opcode(&self) -> u8 {
        match self {
            Request::State => 50,
            Request::ProductNumber => 52,
            Request::VersionId => 58,
            Request::DspValue(_) => 59,
            Request::SerialNumber => 63,
            Request::ManufacturingDate => 65,
            Request::ActualTime => 70,
            Request::FirmwareVersion => 72,
            Request::SystemConfig => 77,
            Request::CumulatedEnergy(_) => 78,
            Request::TimeCounter(_) => 80,
            Request::LastAlarms => 86,
        }
    }

    fn params(&self) -> [u8; 6] {
        let mut params = [0u8; 6];
        match self {
            Request::DspValue(measure) => {
                params[0] = *measure as u8;
                // 0 selects the module reading rather than the global one
                params[1] = 0;
            }
            Request::CumulatedEnergy(period) => params[0] = *period as u8,
            Request::TimeCounter(kind) => params[0] = *kind as u8,
            _ => {}
        }
        params
    }

    /// Product and serial number answers are six bytes of text with no state header.
    fn has_state_header(&self) -> bool {
        !matches!(self, Request::ProductNumber | Request::SerialNumber)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub global: u8,
    pub inverter: u8,
    pub dc1: u8,
    pub dc2: u8,
    pub alarm: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub model: char,
    pub grid_standard: char,
    pub transformer: char,
    pub source: char,
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transformer = match self.transformer {
            'T' => "transformer",
            'N' => "transformerless",
            _ => "unknown transformer",
        };
        let source = match self.source {
            'W' => "wind",
            'N' => "photovoltaic",
            _ => "unknown source",
        };
        write!(
            f,
            "model {}, grid standard {}, {transformer}, {source}",
            self.model, self.grid_standard
        )
    }
}

/// Decoded body of a successful response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    State(DeviceState),
    Text(String),
    Version(VersionInfo),
    Measure(f32),
    ManufacturingDate { week: String, year: String },
    Timestamp(NaiveDateTime),
    Firmware(String),
    SystemConfig(u8),
    /// Watt-hours.
    Energy(u32),
    /// Seconds.
    Counter(u32),
    Alarms([u8; 4]),
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::State(state) => write!(
                f,
                "global={}, inverter={}, dc1={}, dc2={}, alarm={}",
                state.global, state.inverter, state.dc1, state.dc2, state.alarm
            ),
            Payload::Text(text) | Payload::Firmware(text) => f.write_str(text),
            Payload::Version(version) => write!(f, "{version}"),
            // shortest round-trip form, always with a fractional part
            Payload::Measure(value) => write!(f, "{value:?}"),
            Payload::ManufacturingDate { week, year } => write!(f, "week {week}, year {year}"),
            Payload::Timestamp(time) => write!(f, "{}", time.format("%Y-%m-%d %H:%M:%S")),
            Payload::SystemConfig(code) => write!(f, "{code}"),
            Payload::Energy(wh) => write!(f, "{:.1}", f64::from(*wh)),
            Payload::Counter(seconds) => write!(f, "{seconds}"),
            Payload::Alarms(codes) => write!(f, "{codes:?}"),
        }
    }
}

pub fn crc(data: &[u8]) -> u16 {
    State::<X_25>::calculate(data)
}

pub fn encode(address: u8, request: &Request) -> [u8; REQUEST_LEN] {
    let mut frame = [0u8; REQUEST_LEN];
    frame[0] = address;
    frame[1] = request.opcode();
    frame[2..8].copy_from_slice(&request.params());
    let checksum = crc(&frame[..8]).to_le_bytes();
    frame[8] = checksum[0];
    frame[9] = checksum[1];
    trace!(address, opcode = frame[1], ?frame, "encoded request");
    frame
}

/// Appends the checksum to a response body, producing what a device would send.
pub fn build_response(body: [u8; BODY_LEN]) -> [u8; RESPONSE_LEN] {
    let mut frame = [0u8; RESPONSE_LEN];
    frame[..BODY_LEN].copy_from_slice(&body);
    let checksum = crc(&body).to_le_bytes();
    frame[BODY_LEN] = checksum[0];
    frame[BODY_LEN + 1] = checksum[1];
    frame
}

pub fn decode(request: &Request, frame: &[u8]) -> Result<Payload, CodecError> {
    if frame.len() != RESPONSE_LEN {
        return Err(CodecError::Truncated {
            expected: RESPONSE_LEN,
            actual: frame.len(),
        });
    }

    let (body, trailer) = frame.split_at(BODY_LEN);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let computed = crc(body);
    if received != computed {
        return Err(CodecError::Checksum { received, computed });
    }

    if request.has_state_header() && body[0] != 0 {
        return Err(CodecError::Rejected(body[0]));
    }

    let payload = match request {
        Request::State => Payload::State(DeviceState {
            global: body[1],
            inverter: body[2],
            dc1: body[3],
            dc2: body[4],
            alarm: body[5],
        }),
        Request::ProductNumber | Request::SerialNumber => Payload::Text(ascii(body)),
        Request::VersionId => Payload::Version(VersionInfo {
            model: char::from(body[2]),
            grid_standard: char::from(body[3]),
            transformer: char::from(body[4]),
            source: char::from(body[5]),
        }),
        Request::DspValue(_) => Payload::Measure(f32::from_be_bytes(data_word(body))),
        Request::ManufacturingDate => Payload::ManufacturingDate {
            week: ascii(&body[2..4]),
            year: ascii(&body[4..6]),
        },
        Request::ActualTime => {
            let seconds = u32::from_be_bytes(data_word(body));
            Payload::Timestamp(
                DateTime::from_timestamp(AURORA_EPOCH_UNIX + i64::from(seconds), 0)
                    .map(|time| time.naive_utc())
                    .unwrap_or_default(),
            )
        }
        Request::FirmwareVersion => Payload::Firmware(
            body[2..6]
                .iter()
                .map(|byte| char::from(*byte).to_string())
                .collect::<Vec<_>>()
                .join("."),
        ),
        Request::SystemConfig => Payload::SystemConfig(body[2]),
        Request::CumulatedEnergy(_) => Payload::Energy(u32::from_be_bytes(data_word(body))),
        Request::TimeCounter(_) => Payload::Counter(u32::from_be_bytes(data_word(body))),
        Request::LastAlarms => Payload::Alarms([body[2], body[3], body[4], body[5]]),
    };

    trace!(opcode = request.opcode(), %payload, "decoded response");
    Ok(payload)
}

fn data_word(body: &[u8]) -> [u8; 4] {
    [body[2], body[3], body[4], body[5]]
}

fn ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|ch: char| ch == '\0' || ch.is_whitespace())
        .to_string()
}
