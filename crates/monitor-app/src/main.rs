use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::{info, warn};

use aurora_driver::AuroraDriver;
use command_bus::CommandBus;
use monitor::Monitor;
use monitor_app::AppConfig;
use types::MonitorEvent;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = parse_config_arg();
    let config = AppConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;

    if let Some(listen) = config.metrics_listen.as_deref() {
        install_metrics(listen).context("metrics exporter init failed")?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver = AuroraDriver::open(&config.link)
        .with_context(|| format!("open serial port {}", config.link.port))?;
    let bus = Arc::new(CommandBus::new(driver));
    let (monitor, handle) = Monitor::new(
        bus.clone(),
        config.hw_settings(),
        config.monitor.clone(),
        config.event_capacity,
        shutdown_rx.clone(),
    );

    let sink_handle = tokio::spawn(event_sink(handle.subscribe(), shutdown_rx.clone()));
    let mut monitor_task = tokio::spawn(monitor.run());

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    let monitor_finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            false
        }
        result = &mut monitor_task => {
            if let Err(err) = result {
                warn!(error = %err, "monitor task failed");
            } else {
                warn!("monitor exited before shutdown");
            }
            true
        }
    };

    let _ = shutdown_tx.send(true);
    if !monitor_finished {
        if let Err(err) = monitor_task.await {
            warn!(error = %err, "monitor task join failed");
        }
    }

    bus.driver().close().await;
    let _ = sink_handle.await;
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

fn install_metrics(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid metrics listen address {listen}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("install prometheus exporter")?;
    info!(%addr, "prometheus exporter listening");
    Ok(())
}

async fn event_sink(
    mut events: broadcast::Receiver<MonitorEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event sink lagging behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("event sink shutdown requested");
                    break;
                }
            }
        }
    }
}

fn log_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::LinkStatus { health, online } => {
            info!(%health, online, "inverter link status");
        }
        MonitorEvent::DailyPeakPower { value_w, timestamp } => {
            info!(value_w, %timestamp, "daily peak power");
        }
        other => match serde_json::to_string(other) {
            Ok(json) => info!(event = %json, "monitor event"),
            Err(err) => warn!(error = %err, "event serialization failed"),
        },
    }
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
