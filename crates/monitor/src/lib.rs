#![allow(dead_code)]

pub mod daily;
pub mod health;
pub mod window;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use aurora_driver::{DriverError, InverterDriver};
use chrono::{Local, NaiveDateTime, Timelike};
use command_bus::{CommandBus, Reply, DISPATCH_ERROR};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{debug, info, warn};
use types::{ErrorKind, HwSettings, LinkHealth, MonitorEvent, MonitorSettings, TelemetrySample};

pub use daily::{DailyState, PEAK_NOTIFY_AFTER_SECS};
pub use health::LinkHealthMachine;
pub use window::SmoothingWindow;

const REQUEST_QUEUE: usize = 16;

/// Why a poll cycle stopped before producing a sample.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AcquisitionError {
    #[error("integrity check failed on {opcode}/{subcode}")]
    Crc {
        opcode: &'static str,
        subcode: &'static str,
    },
    #[error("no response for {opcode}/{subcode}")]
    Timeout {
        opcode: &'static str,
        subcode: &'static str,
    },
    #[error("{opcode}/{subcode} failed with code {code}: {message}")]
    Rejected {
        opcode: &'static str,
        subcode: &'static str,
        code: i32,
        message: String,
    },
    #[error("{opcode}/{subcode} returned a non-numeric value {value:?}")]
    InvalidValue {
        opcode: &'static str,
        subcode: &'static str,
        value: String,
    },
}

impl AcquisitionError {
    fn from_nok(opcode: &'static str, subcode: &'static str, code: i32, message: String) -> Self {
        match ErrorKind::from_code(code) {
            ErrorKind::Crc => AcquisitionError::Crc { opcode, subcode },
            ErrorKind::Timeout => AcquisitionError::Timeout { opcode, subcode },
            _ => AcquisitionError::Rejected {
                opcode,
                subcode,
                code,
                message,
            },
        }
    }

    /// Outcome fed to the link-health machine.
    ///
    /// Integrity failures are recorded as timeouts and timeouts as integrity
    /// failures. Both count as a failed poll.
    pub fn health_input(&self) -> ErrorKind {
        match self {
            AcquisitionError::Crc { .. } => ErrorKind::Timeout,
            AcquisitionError::Timeout { .. } => ErrorKind::Crc,
            AcquisitionError::Rejected { .. } | AcquisitionError::InvalidValue { .. } => {
                ErrorKind::Unknown
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AcquisitionError::Crc { .. } => "crc",
            AcquisitionError::Timeout { .. } => "timeout",
            AcquisitionError::Rejected { .. } => "rejected",
            AcquisitionError::InvalidValue { .. } => "invalid_value",
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor task is not running")]
    Closed,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
enum MonitorRequest {
    ReadStatus(oneshot::Sender<Reply>),
    LoadHwSettings(oneshot::Sender<Reply>),
    SaveHwSettings(HwSettings, oneshot::Sender<Reply>),
    UpdateSettings(MonitorSettings, oneshot::Sender<Reply>),
    Stop,
}

enum Wake {
    Poll,
    Request(Option<MonitorRequest>),
    Shutdown(bool),
}

/// Cloneable access to a running [`Monitor`].
#[derive(Clone)]
pub struct MonitorHandle {
    requests: mpsc::Sender<MonitorRequest>,
    events: broadcast::Sender<MonitorEvent>,
    health: watch::Receiver<LinkHealth>,
}

impl MonitorHandle {
    /// Probes the inverter and answers `"online"` or `"offline"`.
    pub async fn read_status(&self) -> Result<Reply, MonitorError> {
        self.call(MonitorRequest::ReadStatus).await
    }

    pub async fn load_hw_settings(&self) -> Result<Reply, MonitorError> {
        self.call(MonitorRequest::LoadHwSettings).await
    }

    pub async fn save_hw_settings(&self, settings: HwSettings) -> Result<Reply, MonitorError> {
        self.call(|reply| MonitorRequest::SaveHwSettings(settings, reply))
            .await
    }

    pub async fn update_settings(&self, settings: MonitorSettings) -> Result<Reply, MonitorError> {
        self.call(|reply| MonitorRequest::UpdateSettings(settings, reply))
            .await
    }

    pub fn health(&self) -> LinkHealth {
        *self.health.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.health().is_available()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Asks the scheduler to exit after the current cycle.
    pub async fn stop(&self) {
        if self.requests.send(MonitorRequest::Stop).await.is_err() {
            debug!("monitor already stopped");
        }
    }

    async fn call<F>(&self, build: F) -> Result<Reply, MonitorError>
    where
        F: FnOnce(oneshot::Sender<Reply>) -> MonitorRequest,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(build(reply_tx))
            .await
            .map_err(|_| MonitorError::Closed)?;
        reply_rx.await.map_err(|_| MonitorError::Closed)
    }
}

/// Periodic acquisition task for one inverter.
///
/// Owns the daily state, smoothing window and link health; everything leaves
/// the task as a [`MonitorEvent`] or a reply to a handle request.
pub struct Monitor<D> {
    bus: Arc<CommandBus<D>>,
    hw: HwSettings,
    settings: MonitorSettings,
    health: LinkHealthMachine,
    window: SmoothingWindow,
    daily: DailyState,
    events: broadcast::Sender<MonitorEvent>,
    health_tx: watch::Sender<LinkHealth>,
    requests: mpsc::Receiver<MonitorRequest>,
    shutdown: watch::Receiver<bool>,
}

impl<D: InverterDriver + 'static> Monitor<D> {
    pub fn new(
        bus: Arc<CommandBus<D>>,
        hw: HwSettings,
        settings: MonitorSettings,
        event_capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, MonitorHandle) {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (health_tx, health_rx) = watch::channel(LinkHealth::default());
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);

        let monitor = Self {
            bus,
            hw,
            settings,
            health: LinkHealthMachine::new(),
            window: SmoothingWindow::default(),
            daily: DailyState::new(),
            events: events.clone(),
            health_tx,
            requests: request_rx,
            shutdown,
        };
        let handle = MonitorHandle {
            requests: request_tx,
            events,
            health: health_rx,
        };
        (monitor, handle)
    }

    pub fn health(&self) -> LinkHealth {
        self.health.state()
    }

    pub fn daily(&self) -> &DailyState {
        &self.daily
    }

    pub fn window(&self) -> &SmoothingWindow {
        &self.window
    }

    pub async fn run(mut self) {
        info!(
            port = %self.hw.serial_port,
            address = self.hw.inverter_address,
            interval_secs = self.settings.poll_interval_secs,
            "monitor started"
        );
        self.check_status().await;
        self.publish(MonitorEvent::Started);

        let mut requests_open = true;
        let mut shutdown_open = true;

        'cycle: loop {
            if *self.shutdown.borrow() {
                info!("monitor shutdown requested");
                break;
            }

            let cycle_start = Instant::now();
            let now = Local::now().naive_local();
            let outcome = self.poll_once(now).await;
            debug!(
                elapsed_ms = cycle_start.elapsed().as_millis(),
                ok = outcome.is_ok(),
                health = %self.health.state(),
                "poll cycle complete"
            );

            let wake_at = TokioInstant::now() + self.settings.poll_interval();
            loop {
                let wake = tokio::select! {
                    _ = sleep_until(wake_at) => Wake::Poll,
                    request = self.requests.recv(), if requests_open => Wake::Request(request),
                    changed = self.shutdown.changed(), if shutdown_open => Wake::Shutdown(changed.is_ok()),
                };

                match wake {
                    Wake::Poll => break,
                    Wake::Request(Some(request)) => {
                        if self.handle_request(request).await.is_break() {
                            break 'cycle;
                        }
                    }
                    Wake::Request(None) => requests_open = false,
                    Wake::Shutdown(true) => {
                        if *self.shutdown.borrow() {
                            info!("monitor shutdown requested");
                            break 'cycle;
                        }
                    }
                    Wake::Shutdown(false) => shutdown_open = false,
                }
            }
        }
    }

    /// Runs one acquisition cycle as if the local time were `now`.
    pub async fn poll_once(
        &mut self,
        now: NaiveDateTime,
    ) -> Result<TelemetrySample, AcquisitionError> {
        if self.daily.roll_over(now.date()) {
            self.window.clear();
            info!(day = %now.date(), "new day, daily energy reset");
        }

        let outcome = self.acquire(now).await;
        match &outcome {
            Ok(sample) => {
                self.health.update(ErrorKind::None);
                metrics::counter!("monitor_polls_total", "outcome" => "ok").increment(1);
                self.record(sample.clone(), now);
            }
            Err(err) => {
                warn!(error = %err, "telemetry acquisition failed");
                self.health.update(err.health_input());
                metrics::counter!("monitor_polls_total", "outcome" => err.label()).increment(1);
            }
        }

        self.publish_link_status();
        outcome
    }

    async fn acquire(&self, now: NaiveDateTime) -> Result<TelemetrySample, AcquisitionError> {
        let grid_power_w = self.measure("dspData", "gridPowerAll").await?;
        let daily_energy_wh = self.measure("cumEnergy", "daily").await?;
        let grid_voltage_v = self.measure("dspData", "gridVoltageAll").await?;
        let inverter_temp_c = self.measure("dspData", "inverterTemp").await?;

        Ok(TelemetrySample {
            timestamp: now,
            grid_power_w,
            daily_energy_wh,
            grid_voltage_v,
            inverter_temp_c,
        })
    }

    async fn measure(
        &self,
        opcode: &'static str,
        subcode: &'static str,
    ) -> Result<f64, AcquisitionError> {
        match self
            .bus
            .request(opcode, subcode, self.hw.inverter_address)
            .await
        {
            Reply::Ok(value) => value
                .parse::<f64>()
                .map_err(|_| AcquisitionError::InvalidValue {
                    opcode,
                    subcode,
                    value,
                }),
            Reply::Nok { code, message } => {
                Err(AcquisitionError::from_nok(opcode, subcode, code, message))
            }
        }
    }

    fn record(&mut self, sample: TelemetrySample, now: NaiveDateTime) {
        let new_peak = self
            .daily
            .observe_power(sample.grid_power_w, sample.timestamp);
        if self
            .daily
            .take_peak_notification(now.num_seconds_from_midnight(), new_peak)
        {
            if let Some((value_w, timestamp)) = self.daily.peak() {
                info!(value_w, %timestamp, "daily peak power");
                self.publish(MonitorEvent::DailyPeakPower { value_w, timestamp });
            }
        }

        self.window.push(sample.clone());
        let smoothed = self
            .window
            .fixed_average()
            .map(|fixed| fixed.daily_energy_wh)
            .unwrap_or_default();
        let estimated = self.daily.accumulate(smoothed);
        debug!(
            measured_wh = sample.daily_energy_wh,
            smoothed_wh = smoothed,
            estimated_wh = estimated,
            "energy estimation"
        );

        let mut outgoing = sample;
        if self.settings.energy_estimation {
            outgoing.daily_energy_wh = estimated;
        }
        metrics::gauge!("monitor_daily_energy_wh").set(outgoing.daily_energy_wh);
        self.publish(MonitorEvent::Telemetry(outgoing));
    }

    /// Answers one handle request. `Break` means the scheduler should exit.
    async fn handle_request(&mut self, request: MonitorRequest) -> ControlFlow<()> {
        let (reply, reply_tx) = match request {
            MonitorRequest::ReadStatus(reply_tx) => (self.check_status().await, reply_tx),
            MonitorRequest::LoadHwSettings(reply_tx) => (self.load_hw_settings(), reply_tx),
            MonitorRequest::SaveHwSettings(settings, reply_tx) => {
                (self.save_hw_settings(settings).await, reply_tx)
            }
            MonitorRequest::UpdateSettings(settings, reply_tx) => {
                (self.update_settings(settings), reply_tx)
            }
            MonitorRequest::Stop => {
                info!("monitor stop requested");
                return ControlFlow::Break(());
            }
        };
        if reply_tx.send(reply).is_err() {
            debug!("requester went away before the reply");
        }
        ControlFlow::Continue(())
    }

    async fn check_status(&mut self) -> Reply {
        let reply = self
            .bus
            .request("versionNumber", "", self.hw.inverter_address)
            .await;
        let outcome = match &reply {
            Reply::Ok(_) => ErrorKind::None,
            Reply::Nok { code, .. } => ErrorKind::from_code(*code),
        };
        self.health.update(outcome);
        self.publish_link_status();

        let status = if self.health.is_available() {
            "online"
        } else {
            "offline"
        };
        info!(status, "inverter status checked");
        Reply::Ok(status.to_string())
    }

    fn load_hw_settings(&self) -> Reply {
        match serde_json::to_string(&self.hw) {
            Ok(json) => Reply::Ok(json),
            Err(err) => Reply::nok(DISPATCH_ERROR, err.to_string()),
        }
    }

    async fn save_hw_settings(&mut self, settings: HwSettings) -> Reply {
        match self.apply_hw_settings(settings).await {
            Ok(json) => Reply::Ok(json),
            Err(err) => {
                warn!(error = %err, "hardware settings rejected");
                Reply::nok(
                    DISPATCH_ERROR,
                    format!("could not apply hardware settings: {err}"),
                )
            }
        }
    }

    async fn apply_hw_settings(&mut self, settings: HwSettings) -> Result<String, MonitorError> {
        validate_hw_settings(&settings)?;
        self.bus
            .reopen(&settings.serial_port, settings.baud_rate)
            .await?;
        info!(
            port = %settings.serial_port,
            baud_rate = settings.baud_rate,
            address = settings.inverter_address,
            "hardware settings applied"
        );
        self.hw = settings.clone();
        self.publish(MonitorEvent::SettingsChanged(settings));
        self.check_status().await;
        Ok(serde_json::to_string(&self.hw)?)
    }

    fn update_settings(&mut self, settings: MonitorSettings) -> Reply {
        if !settings.is_valid() {
            return Reply::nok(
                DISPATCH_ERROR,
                format!(
                    "poll interval must be positive, got {}",
                    settings.poll_interval_secs
                ),
            );
        }
        info!(
            interval_secs = settings.poll_interval_secs,
            energy_estimation = settings.energy_estimation,
            "monitor settings updated"
        );
        self.settings = settings;
        match serde_json::to_string(&self.settings) {
            Ok(json) => Reply::Ok(json),
            Err(err) => Reply::nok(DISPATCH_ERROR, err.to_string()),
        }
    }

    fn publish_link_status(&self) {
        let health = self.health.state();
        let online = health.is_available();
        self.health_tx.send_replace(health);
        metrics::gauge!("monitor_link_available").set(if online { 1.0 } else { 0.0 });
        self.publish(MonitorEvent::LinkStatus { health, online });
    }

    fn publish(&self, event: MonitorEvent) {
        if self.events.send(event).is_err() {
            debug!("no event subscribers");
        }
    }
}

pub fn validate_hw_settings(settings: &HwSettings) -> Result<(), MonitorError> {
    if settings.serial_port.trim().is_empty() {
        return Err(MonitorError::InvalidSettings(
            "serial port must not be empty".to_string(),
        ));
    }
    if settings.baud_rate == 0 {
        return Err(MonitorError::InvalidSettings(
            "baud rate must be greater than zero".to_string(),
        ));
    }
    if settings.inverter_address == 0 || settings.inverter_address > aurora_driver::MAX_ADDRESS {
        return Err(MonitorError::InvalidSettings(format!(
            "inverter address must be between 1 and {}, got {}",
            aurora_driver::MAX_ADDRESS,
            settings.inverter_address
        )));
    }
    Ok(())
}
