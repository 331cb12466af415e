use std::time::Duration;

use chrono::NaiveDate;
use types::{ErrorKind, HwSettings, LinkHealth, MonitorEvent, MonitorSettings, TelemetrySample};

#[test]
fn error_kind_codes_and_names() {
    for (kind, code, name) in [
        (ErrorKind::None, 0, "NONE"),
        (ErrorKind::Crc, 1, "CRC"),
        (ErrorKind::Timeout, 2, "TIMEOUT"),
        (ErrorKind::Unknown, 3, "UNKNOWN"),
    ] {
        assert_eq!(kind.code(), code);
        assert_eq!(ErrorKind::from_code(code), kind);
        assert_eq!(kind.to_string(), name);
    }
    assert_eq!(ErrorKind::from_code(-1), ErrorKind::Unknown);
    assert!(ErrorKind::None.is_success());
    assert!(!ErrorKind::Crc.is_success());
}

#[test]
fn link_health_defaults_offline() {
    assert_eq!(LinkHealth::default(), LinkHealth::Offline);
    assert!(!LinkHealth::Offline.is_available());
    assert!(LinkHealth::Uncertain.is_available());
}

#[test]
fn poll_interval_falls_back_on_bad_values() {
    let mut settings = MonitorSettings::default();
    assert_eq!(settings.poll_interval(), Duration::from_secs(10));

    settings.poll_interval_secs = 0.5;
    assert_eq!(settings.poll_interval(), Duration::from_millis(500));

    for bad in [0.0, -3.0, f64::NAN] {
        settings.poll_interval_secs = bad;
        assert!(!settings.is_valid());
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
    }
}

#[test]
fn events_serialize_with_type_tag() {
    let timestamp = NaiveDate::from_ymd_opt(2024, 6, 1)
        .and_then(|day| day.and_hms_opt(13, 5, 0))
        .expect("valid time");
    let event = MonitorEvent::Telemetry(TelemetrySample {
        timestamp,
        grid_power_w: 1500.0,
        daily_energy_wh: 800.0,
        grid_voltage_v: 230.5,
        inverter_temp_c: 41.0,
    });

    let json = serde_json::to_value(&event).expect("serialize");
    assert_eq!(json["type"], "telemetry");
    assert_eq!(json["grid_power_w"], 1500.0);

    let status = serde_json::to_value(MonitorEvent::LinkStatus {
        health: LinkHealth::Uncertain,
        online: true,
    })
    .expect("serialize");
    assert_eq!(status["health"], "uncertain");

    let settings = MonitorEvent::SettingsChanged(HwSettings::default());
    let back: MonitorEvent =
        serde_json::from_str(&serde_json::to_string(&settings).expect("serialize")).expect("parse");
    assert_eq!(back, settings);
}
