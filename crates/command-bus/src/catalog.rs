//! Symbolic command names and the requests they select.
//!
//! Names match exactly and are case-sensitive. Anything not listed here
//! becomes [`Command::Unsupported`].

use aurora_codec::{CounterKind, DspMeasure, EnergyPeriod, Request};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Acquire { address: u8, request: Request },
    Unsupported { opcode: String, subcode: String },
}

const ENERGY_PERIODS: &[(&str, EnergyPeriod)] = &[
    ("daily", EnergyPeriod::Daily),
    ("weekly", EnergyPeriod::Weekly),
    ("monthly", EnergyPeriod::Monthly),
    ("yearly", EnergyPeriod::Yearly),
    ("total", EnergyPeriod::Total),
    ("partial", EnergyPeriod::Partial),
];

const DSP_MEASURES: &[(&str, DspMeasure)] = &[
    ("gridVoltageAll", DspMeasure::GridVoltage),
    ("gridCurrentAll", DspMeasure::GridCurrent),
    ("gridPowerAll", DspMeasure::GridPower),
    ("frequencyAll", DspMeasure::Frequency),
    ("vBulk", DspMeasure::VBulk),
    ("iLeakDcDc", DspMeasure::ILeakDcDc),
    ("iLeakInverter", DspMeasure::ILeakInverter),
    ("pin1", DspMeasure::Pin1),
    ("pin2", DspMeasure::Pin2),
    ("inverterTemp", DspMeasure::InverterTemperature),
    ("boosterTemp", DspMeasure::BoosterTemperature),
    ("input1Voltage", DspMeasure::Input1Voltage),
    ("input1Current", DspMeasure::Input1Current),
    ("input2Voltage", DspMeasure::Input2Voltage),
    ("input2Current", DspMeasure::Input2Current),
    ("gridVoltageDcDc", DspMeasure::GridVoltageDcDc),
    ("gridFrequencyDcDc", DspMeasure::GridFrequencyDcDc),
    ("isolationResistance", DspMeasure::IsolationResistance),
    ("vBulkDcDc", DspMeasure::VBulkDcDc),
    ("averageGridVoltage", DspMeasure::AverageGridVoltage),
    ("vBulkMid", DspMeasure::VBulkMid),
    ("powerPeak", DspMeasure::PowerPeak),
    ("powerPeakToday", DspMeasure::PowerPeakToday),
];

const TIME_COUNTERS: &[(&str, CounterKind)] = &[
    ("", CounterKind::Total),
    ("total", CounterKind::Total),
    ("partial", CounterKind::Partial),
    ("grid", CounterKind::Grid),
    ("resetPartial", CounterKind::ResetPartial),
];

/// Opcodes that take no subcode; whatever subcode is given is ignored.
const PLAIN: &[(&str, Request)] = &[
    ("productNumber", Request::ProductNumber),
    ("serialNumber", Request::SerialNumber),
    ("versionNumber", Request::VersionId),
    ("firmwareNumber", Request::FirmwareVersion),
    ("manufacturingDate", Request::ManufacturingDate),
    ("sysConfig", Request::SystemConfig),
    ("actualTime", Request::ActualTime),
    ("lastAlarms", Request::LastAlarms),
    ("state", Request::State),
];

pub fn create(opcode: &str, subcode: &str, address: u8) -> Command {
    match lookup(opcode, subcode) {
        Some(request) => Command::Acquire { address, request },
        None => Command::Unsupported {
            opcode: opcode.to_string(),
            subcode: subcode.to_string(),
        },
    }
}

fn lookup(opcode: &str, subcode: &str) -> Option<Request> {
    match opcode {
        "cumEnergy" => find(ENERGY_PERIODS, subcode).map(Request::CumulatedEnergy),
        "dspData" => find(DSP_MEASURES, subcode).map(Request::DspValue),
        "timeCounter" => find(TIME_COUNTERS, subcode).map(Request::TimeCounter),
        _ => find(PLAIN, opcode),
    }
}

fn find<V: Copy>(table: &[(&str, V)], name: &str) -> Option<V> {
    table
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, value)| *value)
}
