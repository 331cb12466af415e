#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use aurora_codec::{decode, encode, Payload, Request, RESPONSE_LEN};
use serial_link::{LinkConfig, LinkError, SerialTransport, Transport};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use types::ErrorKind;

/// Highest RS-485 address the protocol can carry.
pub const MAX_ADDRESS: u8 = 63;

/// Result of one exchange. Protocol-level problems are reported here, not as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Value(Payload),
    Failed(ErrorKind),
}

impl Response {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Response::Value(_) => ErrorKind::None,
            Response::Failed(kind) => *kind,
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("inverter link is not open")]
    NotConnected,
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

#[async_trait]
pub trait InverterDriver: Send + Sync {
    async fn execute(&self, address: u8, request: &Request) -> Result<Response, DriverError>;

    async fn reopen(&self, port: &str, baud_rate: u32) -> Result<(), DriverError>;
}

pub struct AuroraDriver<T = SerialTransport> {
    transport: Mutex<Option<T>>,
    response_timeout: Duration,
    inter_frame_delay: Option<Duration>,
}

impl AuroraDriver<SerialTransport> {
    pub fn open(config: &LinkConfig) -> Result<Self, DriverError> {
        let transport = SerialTransport::open(&config.port, config.baud_rate)?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> AuroraDriver<T> {
    pub fn new(transport: T, config: &LinkConfig) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            response_timeout: config.response_timeout(),
            inter_frame_delay: config.inter_frame_delay(),
        }
    }

    /// Releases the transport. Later exchanges fail with `NotConnected`.
    pub async fn close(&self) {
        if self.transport.lock().await.take().is_some() {
            info!("inverter link closed");
        }
    }

    pub async fn is_open(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    async fn exchange(&self, transport: &mut T, frame: &[u8]) -> Result<Vec<u8>, LinkError> {
        transport.send(frame).await?;
        transport.receive(RESPONSE_LEN, self.response_timeout).await
    }
}

#[async_trait]
impl<T: Transport + 'static> InverterDriver for AuroraDriver<T> {
    async fn execute(&self, address: u8, request: &Request) -> Result<Response, DriverError> {
        let opcode = request.opcode();
        if address == 0 || address > MAX_ADDRESS {
            warn!(address, opcode, "inverter address out of range");
            return Ok(Response::Failed(ErrorKind::Unknown));
        }

        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(DriverError::NotConnected)?;

        let frame = encode(address, request);
        let outcome = self.exchange(transport, &frame).await;
        if let Some(delay) = self.inter_frame_delay {
            sleep(delay).await;
        }

        let response = match outcome {
            Ok(bytes) => match decode(request, &bytes) {
                Ok(payload) => {
                    debug!(address, opcode, %payload, "exchange ok");
                    Response::Value(payload)
                }
                Err(err) if err.is_integrity() => {
                    warn!(address, opcode, error = %err, "response failed integrity check");
                    Response::Failed(ErrorKind::Crc)
                }
                Err(err) => {
                    warn!(address, opcode, error = %err, "response rejected");
                    Response::Failed(ErrorKind::Unknown)
                }
            },
            Err(LinkError::Timeout { timeout_ms }) => {
                warn!(address, opcode, timeout_ms, "exchange timed out");
                Response::Failed(ErrorKind::Timeout)
            }
            Err(err) => {
                warn!(address, opcode, error = %err, "exchange failed");
                Response::Failed(ErrorKind::Unknown)
            }
        };

        Ok(response)
    }

    async fn reopen(&self, port: &str, baud_rate: u32) -> Result<(), DriverError> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(DriverError::NotConnected)?;
        transport.reopen(port, baud_rate).await?;
        Ok(())
    }
}
