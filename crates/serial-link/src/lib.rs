#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{
    ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};
use tracing::{debug, info, warn};

/// Settings for the RS-485 line the inverter sits on.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Deadline for a complete response, in milliseconds.
    pub timeout_ms: u64,
    /// Optional pause after each exchange for devices that need the bus to settle.
    pub inter_frame_delay_ms: Option<u64>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19_200,
            timeout_ms: 1_000,
            inter_frame_delay_ms: None,
        }
    }
}

impl LinkConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn inter_frame_delay(&self) -> Option<Duration> {
        self.inter_frame_delay_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("serial port {port} is not open")]
    Closed { port: String },
}

/// Half-duplex byte pipe to the device.
///
/// Callers must not interleave exchanges; the driver holds the transport
/// behind a lock for the whole request/response round trip.
#[async_trait]
pub trait Transport: Send {
    /// Drops any stale input, then writes and flushes `frame`.
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Waits for exactly `expected` bytes. Partial input is discarded on timeout.
    async fn receive(&mut self, expected: usize, deadline: Duration) -> Result<Vec<u8>, LinkError>;

    async fn reopen(&mut self, port: &str, baud_rate: u32) -> Result<(), LinkError>;
}

pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    // empty only while a reopen is in progress or after a failed one
    stream: Option<SerialStream>,
}

impl SerialTransport {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let stream = open_stream(port, baud_rate)?;
        info!(port, baud_rate, "serial port opened");
        Ok(Self {
            port_name: port.to_string(),
            baud_rate,
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> Result<&mut SerialStream, LinkError> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(LinkError::Closed {
                port: self.port_name.clone(),
            }),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let stream = self.stream()?;
        if let Err(err) = stream.clear(ClearBuffer::Input) {
            warn!(error = %err, "failed to clear input buffer");
        }
        stream.write_all(frame).await?;
        stream.flush().await?;
        debug!(port = %self.port_name, len = frame.len(), "frame sent");
        Ok(())
    }

    async fn receive(&mut self, expected: usize, deadline: Duration) -> Result<Vec<u8>, LinkError> {
        let mut buf = vec![0u8; expected];
        let stream = self.stream()?;
        match timeout(deadline, stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => {
                debug!(port = %self.port_name, len = expected, "frame received");
                Ok(buf)
            }
            Ok(Err(err)) => Err(LinkError::Io(err)),
            Err(_) => Err(LinkError::Timeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
        }
    }

    async fn reopen(&mut self, port: &str, baud_rate: u32) -> Result<(), LinkError> {
        // ports are opened exclusively, so the old handle must go first
        drop(self.stream.take());

        match open_stream(port, baud_rate) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.port_name = port.to_string();
                self.baud_rate = baud_rate;
                info!(port, baud_rate, "serial port reopened");
                Ok(())
            }
            Err(err) => {
                warn!(port, baud_rate, error = %err, "reopen failed, restoring previous port");
                match open_stream(&self.port_name, self.baud_rate) {
                    Ok(previous) => self.stream = Some(previous),
                    Err(restore_err) => {
                        warn!(port = %self.port_name, error = %restore_err, "previous port could not be restored");
                    }
                }
                Err(err)
            }
        }
    }
}

fn open_stream(port: &str, baud_rate: u32) -> Result<SerialStream, LinkError> {
    tokio_serial::new(port, baud_rate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .open_native_async()
        .map_err(|source| LinkError::Open {
            port: port.to_string(),
            source,
        })
}
