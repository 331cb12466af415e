use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aurora_codec::{Payload, Request};
use aurora_driver::{DriverError, InverterDriver, Response};
use chrono::{NaiveDate, NaiveDateTime};
use command_bus::{CommandBus, Reply};
use monitor::{AcquisitionError, Monitor, MonitorHandle};
use tokio::sync::{broadcast, watch};
use types::{ErrorKind, HwSettings, LinkHealth, MonitorEvent, MonitorSettings};

#[derive(Clone)]
struct ScriptedDriver {
    script: Arc<Mutex<VecDeque<Response>>>,
    fallback: Response,
    requests: Arc<Mutex<Vec<Request>>>,
    reopened: Arc<Mutex<Vec<(String, u32)>>>,
}

impl ScriptedDriver {
    fn new(fallback: Response) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            requests: Arc::new(Mutex::new(Vec::new())),
            reopened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queues the four answers of one successful cycle.
    fn cycle(&self, power: f32, energy: u32) {
        let mut script = self.script.lock().expect("lock");
        script.push_back(Response::Value(Payload::Measure(power)));
        script.push_back(Response::Value(Payload::Energy(energy)));
        script.push_back(Response::Value(Payload::Measure(230.0)));
        script.push_back(Response::Value(Payload::Measure(41.5)));
    }

    fn fail(&self, kind: ErrorKind) {
        self.script
            .lock()
            .expect("lock")
            .push_back(Response::Failed(kind));
    }

    fn request_count(&self) -> usize {
        self.requests.lock().expect("lock").len()
    }
}

#[async_trait]
impl InverterDriver for ScriptedDriver {
    async fn execute(&self, _address: u8, request: &Request) -> Result<Response, DriverError> {
        self.requests.lock().expect("lock").push(*request);
        let next = self.script.lock().expect("lock").pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }

    async fn reopen(&self, port: &str, baud_rate: u32) -> Result<(), DriverError> {
        self.reopened
            .lock()
            .expect("lock")
            .push((port.to_string(), baud_rate));
        Ok(())
    }
}

fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .expect("valid time")
}

fn build_monitor(
    driver: &ScriptedDriver,
    settings: MonitorSettings,
) -> (
    Monitor<ScriptedDriver>,
    MonitorHandle,
    broadcast::Receiver<MonitorEvent>,
    watch::Sender<bool>,
) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bus = Arc::new(CommandBus::new(driver.clone()));
    let (monitor, handle) = Monitor::new(bus, HwSettings::default(), settings, 64, shutdown_rx);
    let events = handle.subscribe();
    (monitor, handle, events, shutdown_tx)
}

fn drain(events: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn peaks(events: &[MonitorEvent]) -> Vec<(f64, NaiveDateTime)> {
    events
        .iter()
        .filter_map(|event| match event {
            MonitorEvent::DailyPeakPower { value_w, timestamp } => Some((*value_w, *timestamp)),
            _ => None,
        })
        .collect()
}

fn telemetry_energy(events: &[MonitorEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|event| match event {
            MonitorEvent::Telemetry(sample) => Some(sample.daily_energy_wh),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn successful_cycle_publishes_sample_and_status() {
    let driver = ScriptedDriver::new(Response::Failed(ErrorKind::Timeout));
    driver.cycle(1500.0, 800);
    let (mut monitor, handle, mut events, _shutdown) = build_monitor(&driver, MonitorSettings::default());

    let sample = monitor.poll_once(at(1, 9, 0)).await.expect("sample");

    assert_eq!(sample.grid_power_w, 1500.0);
    assert_eq!(sample.daily_energy_wh, 800.0);
    assert_eq!(sample.grid_voltage_v, 230.0);
    assert_eq!(sample.inverter_temp_c, 41.5);
    assert_eq!(monitor.health(), LinkHealth::Online);
    assert!(handle.is_online());

    let events = drain(&mut events);
    assert_eq!(
        events.last(),
        Some(&MonitorEvent::LinkStatus {
            health: LinkHealth::Online,
            online: true
        })
    );
    assert_eq!(telemetry_energy(&events), vec![800.0]);
    assert!(peaks(&events).is_empty(), "no peak event before noon");
}

#[tokio::test]
async fn peak_tracks_strict_maximum_after_noon() {
    let driver = ScriptedDriver::new(Response::Failed(ErrorKind::Timeout));
    for power in [100.0, 250.0, 180.0, 250.0] {
        driver.cycle(power, 10);
    }
    let (mut monitor, _handle, mut events, _shutdown) =
        build_monitor(&driver, MonitorSettings::default());

    let times = [at(1, 13, 0), at(1, 13, 10), at(1, 13, 20), at(1, 13, 30)];
    for now in times {
        monitor.poll_once(now).await.expect("sample");
    }

    let peaks = peaks(&drain(&mut events));
    assert_eq!(peaks, vec![(100.0, times[0]), (250.0, times[1])]);
    assert_eq!(monitor.daily().peak(), Some((250.0, times[1])));
}

#[tokio::test]
async fn morning_peak_is_announced_once_after_noon() {
    let driver = ScriptedDriver::new(Response::Failed(ErrorKind::Timeout));
    driver.cycle(900.0, 10);
    driver.cycle(400.0, 10);
    driver.cycle(300.0, 10);
    let (mut monitor, _handle, mut events, _shutdown) =
        build_monitor(&driver, MonitorSettings::default());

    monitor.poll_once(at(1, 11, 0)).await.expect("sample");
    assert!(peaks(&drain(&mut events)).is_empty());

    monitor.poll_once(at(1, 12, 30)).await.expect("sample");
    assert_eq!(peaks(&drain(&mut events)), vec![(900.0, at(1, 11, 0))]);

    monitor.poll_once(at(1, 12, 40)).await.expect("sample");
    assert!(peaks(&drain(&mut events)).is_empty());
}

#[tokio::test]
async fn day_change_resets_accumulator_and_window() {
    let driver = ScriptedDriver::new(Response::Failed(ErrorKind::Timeout));
    driver.cycle(100.0, 300);
    driver.cycle(100.0, 500);
    driver.cycle(100.0, 0);
    let settings = MonitorSettings {
        energy_estimation: true,
        ..MonitorSettings::default()
    };
    let (mut monitor, _handle, mut events, _shutdown) = build_monitor(&driver, settings);

    monitor.poll_once(at(1, 10, 0)).await.expect("sample");
    monitor.poll_once(at(1, 10, 10)).await.expect("sample");
    assert_eq!(monitor.daily().cumulated_energy_wh(), 300.0 + 400.0);

    // a zero right after midnight must not be smoothed with yesterday's readings
    monitor.poll_once(at(2, 0, 5)).await.expect("sample");
    assert_eq!(monitor.daily().cumulated_energy_wh(), 0.0);
    assert_eq!(monitor.window().len(), 1);

    assert_eq!(telemetry_energy(&drain(&mut events)), vec![300.0, 700.0, 0.0]);
}

#[tokio::test]
async fn lower_peak_on_next_day_is_announced() {
    let driver = ScriptedDriver::new(Response::Failed(ErrorKind::Timeout));
    driver.cycle(900.0, 10);
    driver.cycle(300.0, 10);
    let (mut monitor, _handle, mut events, _shutdown) =
        build_monitor(&driver, MonitorSettings::default());

    monitor.poll_once(at(1, 13, 0)).await.expect("sample");
    assert_eq!(peaks(&drain(&mut events)), vec![(900.0, at(1, 13, 0))]);

    monitor.poll_once(at(2, 13, 0)).await.expect("sample");
    assert_eq!(monitor.daily().peak(), Some((300.0, at(2, 13, 0))));
    assert_eq!(peaks(&drain(&mut events)), vec![(300.0, at(2, 13, 0))]);
}

#[tokio::test]
async fn estimation_accumulates_smoothed_energy() {
    let driver = ScriptedDriver::new(Response::Failed(ErrorKind::Timeout));
    driver.cycle(100.0, 100);
    driver.cycle(100.0, 0);
    driver.cycle(100.0, 50);

    let settings = MonitorSettings {
        energy_estimation: true,
        ..MonitorSettings::default()
    };
    let (mut estimating, _handle, mut events, _shutdown) = build_monitor(&driver, settings);
    for minute in [0, 1, 2] {
        estimating.poll_once(at(1, 9, minute)).await.expect("sample");
    }
    // smoothed readings: 100, 100 (zero masked), 50
    assert_eq!(telemetry_energy(&drain(&mut events)), vec![100.0, 200.0, 250.0]);

    driver.cycle(100.0, 100);
    driver.cycle(100.0, 0);
    let (mut raw, _handle, mut events, _shutdown) = build_monitor(&driver, MonitorSettings::default());
    raw.poll_once(at(1, 9, 0)).await.expect("sample");
    raw.poll_once(at(1, 9, 1)).await.expect("sample");
    assert_eq!(telemetry_energy(&drain(&mut events)), vec![100.0, 0.0]);
    assert_eq!(raw.daily().cumulated_energy_wh(), 200.0);
}

#[tokio::test]
async fn failure_aborts_cycle_and_degrades_health() {
    let driver = ScriptedDriver::new(Response::Failed(ErrorKind::Timeout));
    driver.cycle(100.0, 10);
    let (mut monitor, handle, mut events, _shutdown) =
        build_monitor(&driver, MonitorSettings::default());

    monitor.poll_once(at(1, 9, 0)).await.expect("sample");
    assert_eq!(driver.request_count(), 4);

    driver.fail(ErrorKind::Crc);
    let err = monitor.poll_once(at(1, 9, 1)).await.unwrap_err();
    assert!(matches!(err, AcquisitionError::Crc { .. }));
    assert_eq!(driver.request_count(), 5, "remaining measurements skipped");
    assert_eq!(monitor.health(), LinkHealth::Uncertain);
    assert!(handle.is_online());

    let err = monitor.poll_once(at(1, 9, 2)).await.unwrap_err();
    assert!(matches!(err, AcquisitionError::Timeout { .. }));
    assert_eq!(monitor.health(), LinkHealth::Offline);
    assert_eq!(handle.health(), LinkHealth::Offline);

    let statuses: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            MonitorEvent::LinkStatus { health, .. } => Some(health),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![LinkHealth::Online, LinkHealth::Uncertain, LinkHealth::Offline]
    );
}

#[tokio::test]
async fn non_numeric_reply_is_a_failed_poll() {
    let driver = ScriptedDriver::new(Response::Value(Payload::Text("AURORA".to_string())));
    let (mut monitor, _handle, _events, _shutdown) = build_monitor(&driver, MonitorSettings::default());

    let err = monitor.poll_once(at(1, 9, 0)).await.unwrap_err();
    assert!(matches!(err, AcquisitionError::InvalidValue { .. }));
    assert_eq!(monitor.health(), LinkHealth::Offline);
}

#[test]
fn health_input_swaps_crc_and_timeout() {
    let crc = AcquisitionError::Crc {
        opcode: "dspData",
        subcode: "gridPowerAll",
    };
    let timeout = AcquisitionError::Timeout {
        opcode: "dspData",
        subcode: "gridPowerAll",
    };
    let rejected = AcquisitionError::Rejected {
        opcode: "cumEnergy",
        subcode: "daily",
        code: -1,
        message: "inverter link is not open".to_string(),
    };

    assert_eq!(crc.health_input(), ErrorKind::Timeout);
    assert_eq!(timeout.health_input(), ErrorKind::Crc);
    assert_eq!(rejected.health_input(), ErrorKind::Unknown);
}

#[tokio::test]
async fn handle_requests_are_served_while_running() {
    let driver = ScriptedDriver::new(Response::Value(Payload::Measure(1.0)));
    let settings = MonitorSettings {
        poll_interval_secs: 3_600.0,
        energy_estimation: false,
    };
    let (monitor, handle, mut events, _shutdown) = build_monitor(&driver, settings);
    let task = tokio::spawn(monitor.run());

    let status = handle.read_status().await.expect("status");
    assert_eq!(status, Reply::Ok("online".to_string()));

    let loaded = handle.load_hw_settings().await.expect("load");
    let hw: HwSettings = serde_json::from_str(loaded.value().expect("ok")).expect("json");
    assert_eq!(hw, HwSettings::default());

    let invalid = HwSettings {
        inverter_address: 0,
        ..HwSettings::default()
    };
    let reply = handle.save_hw_settings(invalid).await.expect("save");
    assert!(matches!(reply, Reply::Nok { code: -1, .. }));
    assert!(driver.reopened.lock().expect("lock").is_empty());

    let moved = HwSettings {
        serial_port: "/dev/ttyUSB1".to_string(),
        baud_rate: 9_600,
        inverter_address: 3,
    };
    let reply = handle.save_hw_settings(moved.clone()).await.expect("save");
    assert!(reply.is_ok());
    assert_eq!(
        driver.reopened.lock().expect("lock").as_slice(),
        &[("/dev/ttyUSB1".to_string(), 9_600)]
    );

    let reply = handle
        .update_settings(MonitorSettings {
            poll_interval_secs: 0.0,
            energy_estimation: true,
        })
        .await
        .expect("update");
    assert!(!reply.is_ok());

    handle.stop().await;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("monitor stops")
        .expect("join");

    let events = drain(&mut events);
    assert_eq!(events.first(), Some(&MonitorEvent::LinkStatus {
        health: LinkHealth::Online,
        online: true
    }));
    assert!(events.contains(&MonitorEvent::Started));
    assert!(events.contains(&MonitorEvent::SettingsChanged(moved)));
    assert!(handle.read_status().await.is_err());
}

#[tokio::test]
async fn shutdown_signal_ends_the_loop() {
    let driver = ScriptedDriver::new(Response::Value(Payload::Measure(1.0)));
    let settings = MonitorSettings {
        poll_interval_secs: 3_600.0,
        energy_estimation: false,
    };
    let (monitor, _handle, _events, shutdown) = build_monitor(&driver, settings);
    let task = tokio::spawn(monitor.run());

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.send(true).expect("send");

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("monitor stops")
        .expect("join");
}
