//! Command dialects.
//!
//! A [`CommandSet`] renders each subsystem operation (Voltage, Current,
//! Output, Status, Initiate, Trigger, Fetch, Measure, ...) into the command
//! text one family of instruments understands. The defaults are plain SCPI;
//! dialects override only what differs.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Regulation priority (PSU) or operating mode (load).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionMode {
    /// Constant voltage
    Voltage,
    /// Constant current
    Current,
}

/// Voltage sense wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenseMode {
    /// Sense at the output terminals
    Local,
    /// Four-wire remote sense
    Remote,
}

/// Output pairing of a multi-channel supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pairing {
    /// Independent channels
    Off,
    /// Channels in series
    Series,
    /// Channels in parallel
    Parallel,
}

/// DMM auto-zero setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoZero {
    /// Auto-zero every reading
    On,
    /// Auto-zero disabled
    Off,
    /// Zero once, then disable
    Once,
}

/// DMM input impedance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputImpedance {
    /// High impedance (>10 GOhm) on the low ranges
    Auto,
    /// Fixed 10 MOhm
    TenMegohm,
}

/// DMM range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DmmRange {
    /// Autorange
    Auto,
    /// Fixed full-scale value
    Fixed(f64),
}

/// Which quantity a raw monitor query reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    /// Output voltage monitor
    Voltage,
    /// Output current monitor
    Current,
}

/// DC voltage measurement setup for the reference DMM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DmmSettings {
    /// Integration time in power-line cycles
    pub aperture_nplc: f64,
    /// Auto-zero mode
    pub auto_zero: AutoZero,
    /// Input impedance
    pub input_impedance: InputImpedance,
    /// Measurement range
    pub range: DmmRange,
}

impl Default for DmmSettings {
    fn default() -> Self {
        Self {
            aperture_nplc: 10.0,
            auto_zero: AutoZero::On,
            input_impedance: InputImpedance::Auto,
            range: DmmRange::Auto,
        }
    }
}

fn normalized(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

impl FromStr for FunctionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "voltage" | "volt" | "cv" => Ok(FunctionMode::Voltage),
            "current" | "curr" | "cc" => Ok(FunctionMode::Current),
            other => Err(format!("unknown function mode '{}'", other)),
        }
    }
}

impl FromStr for SenseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "local" | "internal" | "int" | "2wire" => Ok(SenseMode::Local),
            "remote" | "external" | "ext" | "4wire" => Ok(SenseMode::Remote),
            other => Err(format!("unknown sense mode '{}'", other)),
        }
    }
}

impl FromStr for Pairing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "off" | "none" | "independent" => Ok(Pairing::Off),
            "series" | "ser" => Ok(Pairing::Series),
            "parallel" | "par" => Ok(Pairing::Parallel),
            other => Err(format!("unknown pairing '{}'", other)),
        }
    }
}

impl FromStr for AutoZero {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "on" | "true" | "1" => Ok(AutoZero::On),
            "off" | "false" | "0" => Ok(AutoZero::Off),
            "once" => Ok(AutoZero::Once),
            other => Err(format!("unknown auto-zero mode '{}'", other)),
        }
    }
}

impl FromStr for InputImpedance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "auto" | "high" | "10g" => Ok(InputImpedance::Auto),
            "10m" | "10meg" | "10e6" => Ok(InputImpedance::TenMegohm),
            other => Err(format!("unknown input impedance '{}'", other)),
        }
    }
}

impl FromStr for DmmRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if normalized(s) == "auto" {
            return Ok(DmmRange::Auto);
        }
        match s.trim().parse::<f64>() {
            Ok(value) if value.is_finite() && value > 0.0 => Ok(DmmRange::Fixed(value)),
            _ => Err(format!("range must be 'auto' or a positive number, got '{}'", s.trim())),
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

/// Render a setpoint as the shortest decimal that reads back as the same
/// value. Small setpoints keep every digit; negative zero prints as `0`.
pub fn format_value(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{}", value)
}

/// Capability interface every driver implements.
pub trait CommandSet: Send + Sync {
    /// Registry name of this dialect.
    fn name(&self) -> &'static str;

    /// Attach channel addressing to a rendered command.
    ///
    /// The default dialect is single-channel and ignores `channel`.
    fn scoped(&self, command: String, _channel: Option<u8>, _query: bool) -> String {
        command
    }

    /// Voltage subsystem.
    fn set_voltage(&self, volts: f64, channel: Option<u8>) -> String {
        self.scoped(format!("VOLT {}", format_value(volts)), channel, false)
    }

    /// Current subsystem.
    fn set_current(&self, amps: f64, channel: Option<u8>) -> String {
        self.scoped(format!("CURR {}", format_value(amps)), channel, false)
    }

    /// Output subsystem.
    fn set_output(&self, enabled: bool, channel: Option<u8>) -> String {
        self.scoped(format!("OUTP {}", on_off(enabled)), channel, false)
    }

    /// Function (regulation priority / load mode).
    fn set_function(&self, mode: FunctionMode, channel: Option<u8>) -> String {
        let mode = match mode {
            FunctionMode::Voltage => "VOLT",
            FunctionMode::Current => "CURR",
        };
        self.scoped(format!("FUNC {}", mode), channel, false)
    }

    /// Sense source.
    fn set_sense(&self, mode: SenseMode, channel: Option<u8>) -> String {
        let source = match mode {
            SenseMode::Local => "INT",
            SenseMode::Remote => "EXT",
        };
        self.scoped(format!("VOLT:SENS:SOUR {}", source), channel, false)
    }

    /// Output pairing (instrument-wide).
    fn set_pairing(&self, pairing: Pairing) -> String {
        let pairing = match pairing {
            Pairing::Off => "OFF",
            Pairing::Series => "SER",
            Pairing::Parallel => "PAR",
        };
        format!("OUTP:PAIR {}", pairing)
    }

    /// Status subsystem: operation condition register.
    fn status_condition(&self, channel: Option<u8>) -> String {
        self.scoped("STAT:OPER:COND?".to_string(), channel, true)
    }

    /// Initiate subsystem.
    fn initiate(&self, channel: Option<u8>) -> String {
        self.scoped("INIT".to_string(), channel, false)
    }

    /// Trigger subsystem: software bus trigger.
    fn bus_trigger(&self) -> String {
        "*TRG".to_string()
    }

    /// Fetch subsystem.
    fn fetch(&self, channel: Option<u8>) -> String {
        self.scoped("FETC?".to_string(), channel, true)
    }

    /// Measure subsystem: voltage.
    fn measure_voltage(&self, channel: Option<u8>) -> String {
        self.scoped("MEAS:VOLT?".to_string(), channel, true)
    }

    /// Measure subsystem: current.
    fn measure_current(&self, channel: Option<u8>) -> String {
        self.scoped("MEAS:CURR?".to_string(), channel, true)
    }

    /// Vendor low-level monitor query, when the dialect has one.
    fn raw_monitor(&self, _kind: MonitorKind, _channel: Option<u8>) -> Option<String> {
        None
    }

    /// Bus-triggered single DC voltage reading.
    fn configure_dmm(&self, settings: &DmmSettings) -> Vec<String> {
        let range = match settings.range {
            DmmRange::Auto => "AUTO".to_string(),
            DmmRange::Fixed(value) => format_value(value),
        };
        let auto_zero = match settings.auto_zero {
            AutoZero::On => "ON",
            AutoZero::Off => "OFF",
            AutoZero::Once => "ONCE",
        };
        let impedance = match settings.input_impedance {
            InputImpedance::Auto => "ON",
            InputImpedance::TenMegohm => "OFF",
        };
        vec![
            format!("CONF:VOLT:DC {}", range),
            format!("VOLT:DC:NPLC {}", format_value(settings.aperture_nplc)),
            format!("VOLT:DC:ZERO:AUTO {}", auto_zero),
            format!("VOLT:DC:IMP:AUTO {}", impedance),
            "TRIG:SOUR BUS".to_string(),
            "TRIG:COUN 1".to_string(),
            "SAMP:COUN 1".to_string(),
        ]
    }
}

/// Plain single-channel SCPI.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericScpi;

impl CommandSet for GenericScpi {
    fn name(&self) -> &'static str {
        "generic"
    }
}

/// Modular mainframe dialect: channel-list addressing and a diagnostic
/// monitor query that answers with a raw byte-string record.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModularScpi;

impl CommandSet for ModularScpi {
    fn name(&self) -> &'static str {
        "modular"
    }

    fn scoped(&self, command: String, channel: Option<u8>, query: bool) -> String {
        match channel {
            None => command,
            Some(ch) if query => format!("{} (@{})", command, ch),
            Some(ch) if command.contains(' ') => format!("{},(@{})", command, ch),
            Some(ch) => format!("{} (@{})", command, ch),
        }
    }

    fn raw_monitor(&self, kind: MonitorKind, channel: Option<u8>) -> Option<String> {
        let header = match kind {
            MonitorKind::Voltage => "DIAG:MON:VOLT?",
            MonitorKind::Current => "DIAG:MON:CURR?",
        };
        Some(self.scoped(header.to_string(), channel, true))
    }
}

/// Electronic load dialect: the "output" is the load input.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadScpi;

impl CommandSet for LoadScpi {
    fn name(&self) -> &'static str {
        "eload"
    }

    fn scoped(&self, command: String, channel: Option<u8>, query: bool) -> String {
        ModularScpi.scoped(command, channel, query)
    }

    fn set_output(&self, enabled: bool, channel: Option<u8>) -> String {
        self.scoped(format!("INP {}", on_off(enabled)), channel, false)
    }
}
