use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;

use aurora_driver::MAX_ADDRESS;
use serial_link::LinkConfig;
use types::{HwSettings, MonitorSettings};

const DEFAULT_INVERTER_ADDRESS: u8 = 2;
const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub link: LinkConfig,
    pub inverter_address: u8,
    pub monitor: MonitorSettings,
    pub event_capacity: usize,
    pub metrics_listen: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn hw_settings(&self) -> HwSettings {
        HwSettings {
            serial_port: self.link.port.clone(),
            baud_rate: self.link.baud_rate,
            inverter_address: self.inverter_address,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.link.port.trim().is_empty() {
            anyhow::bail!("inverter.serial_port must be non-empty");
        }
        if self.link.baud_rate == 0 {
            anyhow::bail!("inverter.baud_rate must be >= 1");
        }
        if self.inverter_address == 0 || self.inverter_address > MAX_ADDRESS {
            anyhow::bail!("inverter.address must be between 1 and {MAX_ADDRESS}");
        }
        if self.link.timeout_ms == 0 {
            anyhow::bail!("inverter.response_timeout_ms must be >= 1");
        }
        if let Some(delay) = self.link.inter_frame_delay_ms {
            if delay == 0 {
                anyhow::bail!("inverter.inter_frame_delay_ms must be >= 1 when set");
            }
        }
        if !self.monitor.is_valid() {
            anyhow::bail!("monitor.poll_interval_secs must be a positive number");
        }
        if self.event_capacity == 0 {
            anyhow::bail!("events.capacity must be >= 1");
        }
        if let Some(ref listen) = self.metrics_listen {
            listen
                .parse::<SocketAddr>()
                .with_context(|| format!("metrics.listen must be a socket address, got {listen}"))?;
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let hw = HwSettings::default();
        Self {
            link: LinkConfig {
                port: hw.serial_port,
                baud_rate: hw.baud_rate,
                ..LinkConfig::default()
            },
            inverter_address: DEFAULT_INVERTER_ADDRESS,
            monitor: MonitorSettings::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            metrics_listen: None,
        }
    }
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(value) = env::var("AURORA_SERIAL_PORT") {
        config.link.port = value;
    }

    if let Some(baud_rate) = parse_env("AURORA_BAUD_RATE") {
        config.link.baud_rate = baud_rate;
    }

    if let Some(address) = parse_env("AURORA_ADDRESS") {
        config.inverter_address = address;
    }

    if let Some(timeout_ms) = parse_env("AURORA_RESPONSE_TIMEOUT_MS") {
        config.link.timeout_ms = timeout_ms;
    }

    if let Some(delay_ms) = parse_env("AURORA_INTER_FRAME_DELAY_MS") {
        config.link.inter_frame_delay_ms = Some(delay_ms);
    }

    if let Some(interval) = parse_env("AURORA_POLL_INTERVAL_SECS") {
        config.monitor.poll_interval_secs = interval;
    }

    if let Some(enabled) = parse_env("AURORA_ENERGY_ESTIMATION") {
        config.monitor.energy_estimation = enabled;
    }

    config.event_capacity = parse_env("AURORA_EVENT_CAPACITY").unwrap_or(config.event_capacity);
    config.metrics_listen = env::var("AURORA_METRICS_LISTEN")
        .ok()
        .or(config.metrics_listen.take());
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    inverter: Option<FileInverterConfig>,
    monitor: Option<FileMonitorConfig>,
    events: Option<FileEventsConfig>,
    metrics: Option<FileMetricsConfig>,
}

#[derive(Debug, Deserialize)]
struct FileInverterConfig {
    serial_port: Option<String>,
    baud_rate: Option<u32>,
    address: Option<u8>,
    response_timeout_ms: Option<u64>,
    inter_frame_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileMonitorConfig {
    poll_interval_secs: Option<f64>,
    energy_estimation: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileEventsConfig {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FileMetricsConfig {
    listen: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("AURORA_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut AppConfig, file: FileConfig) {
    if let Some(inverter) = file.inverter {
        if let Some(port) = inverter.serial_port {
            config.link.port = port;
        }
        if let Some(baud_rate) = inverter.baud_rate {
            config.link.baud_rate = baud_rate;
        }
        if let Some(address) = inverter.address {
            config.inverter_address = address;
        }
        if let Some(timeout_ms) = inverter.response_timeout_ms {
            config.link.timeout_ms = timeout_ms;
        }
        if let Some(delay_ms) = inverter.inter_frame_delay_ms {
            config.link.inter_frame_delay_ms = Some(delay_ms);
        }
    }

    if let Some(monitor) = file.monitor {
        if let Some(interval) = monitor.poll_interval_secs {
            config.monitor.poll_interval_secs = interval;
        }
        if let Some(enabled) = monitor.energy_estimation {
            config.monitor.energy_estimation = enabled;
        }
    }

    if let Some(events) = file.events {
        if let Some(capacity) = events.capacity {
            config.event_capacity = capacity;
        }
    }

    if let Some(metrics) = file.metrics {
        if let Some(listen) = metrics.listen {
            config.metrics_listen = Some(listen);
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
