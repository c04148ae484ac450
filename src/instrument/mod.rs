//! Instrument facade.
//!
//! An [`Instrument`] binds a bench [`Role`] to a transport
//! ([`ScpiEndpoint`]) and a command dialect ([`CommandSet`]). The sweep only
//! ever talks to instruments through the named operations here; every
//! failure is converted into a [`BenchError`] that names the instrument and
//! the command.

pub mod commands;
pub mod endpoint;
pub mod mock;
pub mod registry;
pub mod response;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod tcp;
#[cfg(feature = "instrument_visa")]
pub mod visa;

use crate::error::{BenchError, BenchResult};
use commands::{CommandSet, DmmSettings, FunctionMode, MonitorKind, Pairing, SenseMode};
use endpoint::ScpiEndpoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Role an instrument plays on the bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Power supply (device under test, or source)
    Psu,
    /// Electronic load (sink)
    Eload,
    /// Digital multimeter (reference measurement)
    Dmm,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Psu => "psu",
            Role::Eload => "eload",
            Role::Dmm => "dmm",
        };
        f.write_str(name)
    }
}

/// A ready-to-use instrument session.
#[derive(Clone)]
pub struct Instrument {
    role: Role,
    endpoint: Arc<dyn ScpiEndpoint>,
    commands: Arc<dyn CommandSet>,
    channel: Option<u8>,
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("role", &self.role)
            .field("address", &self.endpoint.address())
            .field("driver", &self.commands.name())
            .field("channel", &self.channel)
            .finish()
    }
}

impl Instrument {
    /// Bind an endpoint and a command set to a role.
    pub fn new(
        role: Role,
        endpoint: Arc<dyn ScpiEndpoint>,
        commands: Arc<dyn CommandSet>,
        channel: Option<u8>,
    ) -> Self {
        Self {
            role,
            endpoint,
            commands,
            channel,
        }
    }

    /// Role of this instrument.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Command-set name.
    pub fn driver(&self) -> &'static str {
        self.commands.name()
    }

    /// Whether the driver can issue the vendor raw monitor query.
    pub fn has_raw_monitor(&self) -> bool {
        self.commands.raw_monitor(MonitorKind::Voltage, self.channel).is_some()
    }

    fn comm_error(&self, command: &str, err: anyhow::Error) -> BenchError {
        BenchError::Instrument {
            instrument: self.role.to_string(),
            command: command.to_string(),
            message: format!("{:#}", err),
        }
    }

    fn parse_error(&self, command: &str, response: &str) -> BenchError {
        BenchError::Parse {
            instrument: self.role.to_string(),
            command: command.to_string(),
            response: response.to_string(),
        }
    }

    /// Send a command that produces no reply.
    pub async fn write(&self, command: &str) -> BenchResult<()> {
        debug!(instrument = %self.role, command, "write");
        self.endpoint
            .write(command)
            .await
            .map_err(|err| self.comm_error(command, err))
    }

    /// Send a query and return the trimmed reply.
    pub async fn query(&self, command: &str) -> BenchResult<String> {
        let reply = self
            .endpoint
            .query(command)
            .await
            .map_err(|err| self.comm_error(command, err))?;
        let reply = reply.trim().to_string();
        debug!(instrument = %self.role, command, reply = %reply, "query");
        Ok(reply)
    }

    /// Send a query and decode a single numeric token.
    pub async fn query_f64(&self, command: &str) -> BenchResult<f64> {
        let reply = self.query(command).await?;
        response::parse_number(&reply).ok_or_else(|| self.parse_error(command, &reply))
    }

    /// `*RST`
    pub async fn reset(&self) -> BenchResult<()> {
        self.write("*RST").await
    }

    /// `*CLS`
    pub async fn clear_errors(&self) -> BenchResult<()> {
        self.write("*CLS").await
    }

    /// `*WAI`: barrier until pending operations finish.
    pub async fn wait(&self) -> BenchResult<()> {
        self.write("*WAI").await
    }

    /// `*OPC?`
    pub async fn operation_complete(&self) -> BenchResult<bool> {
        let value = self.query_f64("*OPC?").await?;
        Ok(value == 1.0)
    }

    /// `*IDN?`
    pub async fn identify(&self) -> BenchResult<String> {
        self.query("*IDN?").await
    }

    /// Program the output (or load) voltage.
    pub async fn set_voltage(&self, volts: f64) -> BenchResult<()> {
        self.write(&self.commands.set_voltage(volts, self.channel)).await
    }

    /// Program the output (or load) current.
    pub async fn set_current(&self, amps: f64) -> BenchResult<()> {
        self.write(&self.commands.set_current(amps, self.channel)).await
    }

    /// Enable or disable the output (input, for loads).
    pub async fn set_output(&self, enabled: bool) -> BenchResult<()> {
        self.write(&self.commands.set_output(enabled, self.channel)).await
    }

    /// Electronic-load input switch. Same subsystem as the output; the
    /// load dialect renders it as `INP`.
    pub async fn set_input(&self, enabled: bool) -> BenchResult<()> {
        self.set_output(enabled).await
    }

    /// Regulation priority (PSU) or operating mode (load).
    pub async fn set_function(&self, mode: FunctionMode) -> BenchResult<()> {
        self.write(&self.commands.set_function(mode, self.channel)).await
    }

    /// Load operating mode: CC sinks a programmed current, CV holds a
    /// programmed voltage.
    pub async fn set_load_mode(&self, mode: FunctionMode) -> BenchResult<()> {
        self.set_function(mode).await
    }

    /// Local or remote sense.
    pub async fn set_sense(&self, mode: SenseMode) -> BenchResult<()> {
        self.write(&self.commands.set_sense(mode, self.channel)).await
    }

    /// Series/parallel output pairing.
    pub async fn set_pairing(&self, pairing: Pairing) -> BenchResult<()> {
        self.write(&self.commands.set_pairing(pairing)).await
    }

    /// Apply a DMM measurement setup, one command at a time.
    pub async fn configure_dmm(&self, settings: &DmmSettings) -> BenchResult<()> {
        for command in self.commands.configure_dmm(settings) {
            self.write(&command).await?;
        }
        Ok(())
    }

    /// Read the operation-condition register as an integer bitmask.
    pub async fn status_condition(&self) -> BenchResult<u32> {
        let command = self.commands.status_condition(self.channel);
        let reply = self.query(&command).await?;
        response::parse_status(&reply).ok_or_else(|| self.parse_error(&command, &reply))
    }

    /// Arm for one triggered acquisition.
    pub async fn initiate(&self) -> BenchResult<()> {
        self.write(&self.commands.initiate(self.channel)).await
    }

    /// Software bus trigger.
    pub async fn bus_trigger(&self) -> BenchResult<()> {
        self.write(&self.commands.bus_trigger()).await
    }

    /// Fetch the last completed acquisition.
    pub async fn fetch(&self) -> BenchResult<f64> {
        self.query_f64(&self.commands.fetch(self.channel)).await
    }

    /// Instrument-reported output voltage.
    pub async fn measure_voltage(&self) -> BenchResult<f64> {
        self.query_f64(&self.commands.measure_voltage(self.channel)).await
    }

    /// Instrument-reported output current.
    pub async fn measure_current(&self) -> BenchResult<f64> {
        self.query_f64(&self.commands.measure_current(self.channel)).await
    }

    /// Vendor low-level monitor query, decoded to its first numeric field.
    pub async fn raw_monitor(&self, kind: MonitorKind) -> BenchResult<f64> {
        let command = self.commands.raw_monitor(kind, self.channel).ok_or_else(|| {
            BenchError::Configuration(format!(
                "driver '{}' on '{}' has no raw monitor query",
                self.commands.name(),
                self.role
            ))
        })?;
        let reply = self.query(&command).await?;
        response::parse_monitor_record(&reply).ok_or_else(|| self.parse_error(&command, &reply))
    }
}
