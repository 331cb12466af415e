//! Single entry point for every inverter command.
//!
//! Callers describe a command by name in an [`Envelope`] and get exactly one
//! [`Reply`] back. Executions are serialised so the half-duplex line only
//! ever carries one exchange.

#![allow(dead_code)]

pub mod catalog;

use aurora_driver::{DriverError, InverterDriver, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use catalog::{create, Command};

/// Code reported for failures that happen outside the device exchange.
pub const DISPATCH_ERROR: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(String),
    Nok { code: i32, message: String },
}

impl Reply {
    pub fn nok(code: i32, message: impl Into<String>) -> Self {
        Reply::Nok {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Reply::Ok(value) => Some(value),
            Reply::Nok { .. } => None,
        }
    }
}

/// Correlation record for one command. The result slot is written once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub opcode: String,
    pub subcode: String,
    pub address: u8,
    result: Option<Reply>,
}

impl Envelope {
    pub fn new(opcode: impl Into<String>, subcode: impl Into<String>, address: u8) -> Self {
        Self {
            opcode: opcode.into(),
            subcode: subcode.into(),
            address,
            result: None,
        }
    }

    pub fn result(&self) -> Option<&Reply> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<Reply> {
        self.result
    }

    /// Returns false and keeps the first reply if the slot is already filled.
    fn complete(&mut self, reply: Reply) -> bool {
        if self.result.is_some() {
            return false;
        }
        self.result = Some(reply);
        true
    }
}

pub struct CommandBus<D> {
    driver: D,
    gate: Mutex<()>,
}

impl<D: InverterDriver> CommandBus<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            gate: Mutex::new(()),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub async fn dispatch(&self, envelope: &mut Envelope) {
        let command = create(&envelope.opcode, &envelope.subcode, envelope.address);
        let reply = self.execute(&command).await;
        if !envelope.complete(reply) {
            warn!(
                opcode = %envelope.opcode,
                subcode = %envelope.subcode,
                "envelope already answered, reply dropped"
            );
        }
    }

    /// Convenience wrapper building the envelope for the caller.
    pub async fn request(&self, opcode: &str, subcode: &str, address: u8) -> Reply {
        let mut envelope = Envelope::new(opcode, subcode, address);
        self.dispatch(&mut envelope).await;
        envelope
            .into_result()
            .unwrap_or_else(|| Reply::nok(DISPATCH_ERROR, "no reply produced"))
    }

    pub async fn execute(&self, command: &Command) -> Reply {
        let (address, request) = match command {
            Command::Acquire { address, request } => (*address, request),
            Command::Unsupported { opcode, subcode } => {
                debug!(%opcode, %subcode, "unsupported command");
                return Reply::nok(
                    DISPATCH_ERROR,
                    format!("unsupported command {opcode}/{subcode}"),
                );
            }
        };

        let _gate = self.gate.lock().await;
        match self.driver.execute(address, request).await {
            Ok(Response::Value(payload)) => Reply::Ok(payload.to_string()),
            Ok(Response::Failed(kind)) => Reply::nok(kind.code(), kind.to_string()),
            Err(err) => {
                warn!(address, opcode = request.opcode(), error = %err, "command execution failed");
                Reply::nok(DISPATCH_ERROR, err.to_string())
            }
        }
    }

    /// Moves the driver to a new port or baud rate between exchanges.
    pub async fn reopen(&self, port: &str, baud_rate: u32) -> Result<(), DriverError> {
        let _gate = self.gate.lock().await;
        self.driver.reopen(port, baud_rate).await
    }
}
