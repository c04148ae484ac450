//! Simulated bench for testing and dry runs.
//!
//! [`SimulatedBench`] models one supply, one electronic load and one DMM
//! wired together. It answers the same SCPI the real dialects render, keeps
//! an ordered command log for verification, and supports failure injection.
//! [`SimulatedFactory`] plugs it in wherever a [`ConnectionFactory`] is
//! expected, so a whole sweep can run without hardware.

use super::commands::FunctionMode;
use super::endpoint::{ConnectionFactory, ScpiEndpoint};
use super::Role;
use crate::config::InstrumentDefinition;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Operation-condition value while idle.
const STATUS_IDLE: u32 = 512;
/// Operation-condition value while an acquisition is in progress.
const STATUS_MEASURING: u32 = 16;

/// Tunable imperfections of the simulated bench.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedBehaviour {
    /// Added to every DMM reading
    pub dmm_offset: f64,
    /// Added to every supply `MEAS:*?` and monitor reply
    pub readback_offset: f64,
    /// Status polls that report "measuring" before completion
    pub polls_before_complete: u32,
    /// Status value reported once an acquisition completes
    pub completion_code: u32,
    /// Acquisitions never complete (exercises the poll timeout)
    pub never_complete: bool,
    /// DMM measures across a shunt of this resistance instead of the output
    pub shunt_resistance: Option<f64>,
    /// Delay applied to every exchange
    pub latency: Duration,
}

impl Default for SimulatedBehaviour {
    fn default() -> Self {
        Self {
            dmm_offset: 0.0,
            readback_offset: 0.0,
            polls_before_complete: 2,
            completion_code: 8192,
            never_complete: false,
            shunt_resistance: None,
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Output {
    voltage: f64,
    current: f64,
    enabled: bool,
    function: FunctionMode,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            voltage: 0.0,
            current: 0.0,
            enabled: false,
            function: FunctionMode::Voltage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    Armed,
    Measuring(u32),
    Complete,
}

#[derive(Debug, Default)]
struct Acquisition {
    phase: Phase,
    reading: Option<f64>,
}

#[derive(Debug, Clone)]
struct Failure {
    role: Role,
    pattern: String,
    persistent: bool,
}

#[derive(Debug, Default)]
struct BenchState {
    behaviour: SimulatedBehaviour,
    psu: Output,
    load: Output,
    acquisition: Acquisition,
    log: Vec<(Role, String)>,
    failures: Vec<Failure>,
    unreachable: HashSet<Role>,
}

impl BenchState {
    /// Voltage across the supply terminals.
    fn output_voltage(&self) -> f64 {
        if !self.psu.enabled {
            return 0.0;
        }
        if self.load.enabled && self.load.function == FunctionMode::Voltage {
            return self.load.voltage.min(self.psu.voltage);
        }
        self.psu.voltage
    }

    /// Current flowing from the supply into the load.
    fn output_current(&self) -> f64 {
        if !self.psu.enabled || !self.load.enabled {
            return 0.0;
        }
        match self.load.function {
            FunctionMode::Current => self.load.current.min(self.psu.current),
            FunctionMode::Voltage => self.psu.current,
        }
    }

    fn dmm_reading(&self) -> f64 {
        let value = match self.behaviour.shunt_resistance {
            Some(ohms) => self.output_current() * ohms,
            None => self.output_voltage(),
        };
        value + self.behaviour.dmm_offset
    }

    fn status(&mut self) -> u32 {
        let behaviour = &self.behaviour;
        match self.acquisition.phase {
            Phase::Idle => STATUS_IDLE,
            Phase::Armed => 0,
            Phase::Measuring(_) if behaviour.never_complete => STATUS_MEASURING,
            Phase::Measuring(0) => {
                self.acquisition.phase = Phase::Complete;
                behaviour.completion_code
            }
            Phase::Measuring(left) => {
                self.acquisition.phase = Phase::Measuring(left - 1);
                STATUS_MEASURING
            }
            Phase::Complete => behaviour.completion_code,
        }
    }

    fn take_failure(&mut self, role: Role, command: &str) -> bool {
        let hit = self
            .failures
            .iter()
            .position(|f| f.role == role && command.contains(&f.pattern));
        match hit {
            Some(index) => {
                if !self.failures[index].persistent {
                    self.failures.remove(index);
                }
                true
            }
            None => false,
        }
    }

    fn output_mut(&mut self, role: Role) -> Result<&mut Output> {
        match role {
            Role::Psu => Ok(&mut self.psu),
            Role::Eload => Ok(&mut self.load),
            Role::Dmm => Err(anyhow!("-113,\"Undefined header\"")),
        }
    }

    fn handle(&mut self, role: Role, raw: &str) -> Result<Option<String>> {
        let command = strip_channel(raw);
        let (header, argument) = match command.split_once(' ') {
            Some((header, argument)) => (header.to_ascii_uppercase(), Some(argument.trim())),
            None => (command.to_ascii_uppercase(), None),
        };
        let readback = self.behaviour.readback_offset;

        let reply = match (header.as_str(), argument) {
            ("*RST", None) => {
                match role {
                    Role::Psu => self.psu = Output::default(),
                    Role::Eload => self.load = Output::default(),
                    Role::Dmm => self.acquisition = Acquisition::default(),
                }
                None
            }
            ("*CLS" | "*WAI", None) => None,
            ("*OPC?", None) => Some("1".to_string()),
            ("*IDN?", None) => Some(format!("SIMULATED,{},0,1.0", role.to_string().to_uppercase())),
            ("*TRG", None) => {
                if role == Role::Dmm && self.acquisition.phase == Phase::Armed {
                    self.acquisition.reading = Some(self.dmm_reading());
                    self.acquisition.phase = Phase::Measuring(self.behaviour.polls_before_complete);
                }
                None
            }
            ("INIT", None) => {
                if role == Role::Dmm {
                    self.acquisition.phase = Phase::Armed;
                }
                None
            }
            ("STAT:OPER:COND?", None) => Some(self.status().to_string()),
            ("FETC?", None) => match (self.acquisition.phase, self.acquisition.reading) {
                (Phase::Complete, Some(value)) => {
                    self.acquisition.phase = Phase::Idle;
                    Some(format!("{:+.9E}", value))
                }
                _ => bail!("-230,\"Data corrupt or stale\""),
            },
            ("VOLT", Some(value)) => {
                self.output_mut(role)?.voltage = parse_setpoint(value)?;
                None
            }
            ("CURR", Some(value)) => {
                self.output_mut(role)?.current = parse_setpoint(value)?;
                None
            }
            ("OUTP" | "INP", Some(state)) => {
                self.output_mut(role)?.enabled = parse_switch(state)?;
                None
            }
            ("FUNC", Some(mode)) => {
                self.output_mut(role)?.function = mode
                    .parse::<FunctionMode>()
                    .map_err(|e| anyhow!("-224,\"Illegal parameter value\": {}", e))?;
                None
            }
            ("MEAS:VOLT?", None) => Some(match role {
                Role::Psu => format_reading(self.output_voltage() + readback),
                Role::Eload => format_reading(self.output_voltage()),
                Role::Dmm => format_reading(self.dmm_reading()),
            }),
            ("MEAS:CURR?", None) => Some(match role {
                Role::Psu => format_reading(self.output_current() + readback),
                _ => format_reading(self.output_current()),
            }),
            ("DIAG:MON:VOLT?", None) if role == Role::Psu => Some(format!(
                "b'{:.4},0.000,0'",
                self.output_voltage() + readback
            )),
            ("DIAG:MON:CURR?", None) if role == Role::Psu => Some(format!(
                "b'{:.4},0.000,0'",
                self.output_current() + readback
            )),
            ("OUTP:PAIR" | "VOLT:SENS:SOUR", Some(_)) if role == Role::Psu => None,
            (
                "CONF:VOLT:DC" | "VOLT:DC:NPLC" | "VOLT:DC:ZERO:AUTO" | "VOLT:DC:IMP:AUTO"
                | "TRIG:SOUR" | "TRIG:COUN" | "SAMP:COUN",
                Some(_),
            ) if role == Role::Dmm => None,
            _ => bail!("-113,\"Undefined header\": {}", raw),
        };
        Ok(reply)
    }
}

/// Remove `(@n)` channel-list addressing.
fn strip_channel(command: &str) -> String {
    match command.find("(@") {
        Some(start) => command[..start]
            .trim_end()
            .trim_end_matches(',')
            .trim_end()
            .to_string(),
        None => command.trim().to_string(),
    }
}

fn parse_setpoint(value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| anyhow!("-224,\"Illegal parameter value\": {}", value))
}

fn parse_switch(value: &str) -> Result<bool> {
    match value.to_ascii_uppercase().as_str() {
        "ON" | "1" => Ok(true),
        "OFF" | "0" => Ok(false),
        other => Err(anyhow!("-224,\"Illegal parameter value\": {}", other)),
    }
}

fn format_reading(value: f64) -> String {
    format!("{:+.6E}", value)
}

/// Shared state of a simulated supply, load and DMM.
///
/// Cloning yields another handle to the same bench.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedBench {
    /// Ideal bench: no offsets, completes after two polls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bench with the given imperfections.
    pub fn with_behaviour(behaviour: SimulatedBehaviour) -> Self {
        let bench = Self::new();
        bench.lock().behaviour = behaviour;
        bench
    }

    fn lock(&self) -> MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Change behaviour mid-run.
    pub fn update_behaviour(&self, update: impl FnOnce(&mut SimulatedBehaviour)) {
        update(&mut self.lock().behaviour);
    }

    /// Fail the next command to `role` containing `pattern`.
    pub fn fail_once(&self, role: Role, pattern: &str) {
        self.lock().failures.push(Failure {
            role,
            pattern: pattern.to_string(),
            persistent: false,
        });
    }

    /// Fail every command to `role` containing `pattern`.
    pub fn fail_always(&self, role: Role, pattern: &str) {
        self.lock().failures.push(Failure {
            role,
            pattern: pattern.to_string(),
            persistent: true,
        });
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Refuse connections for `role`.
    pub fn set_unreachable(&self, role: Role) {
        self.lock().unreachable.insert(role);
    }

    /// Every command received, in order, tagged with its instrument.
    pub fn log(&self) -> Vec<(Role, String)> {
        self.lock().log.clone()
    }

    /// Commands received by one instrument, in order.
    pub fn commands(&self, role: Role) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Clear the command log.
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Whether the supply output (or load input) is on.
    pub fn output_enabled(&self, role: Role) -> bool {
        let state = self.lock();
        match role {
            Role::Psu => state.psu.enabled,
            Role::Eload => state.load.enabled,
            Role::Dmm => false,
        }
    }

    /// Programmed (voltage, current) of the supply or load.
    pub fn setpoints(&self, role: Role) -> (f64, f64) {
        let state = self.lock();
        match role {
            Role::Psu => (state.psu.voltage, state.psu.current),
            Role::Eload => (state.load.voltage, state.load.current),
            Role::Dmm => (0.0, 0.0),
        }
    }

    /// Endpoint for one role on this bench.
    pub fn endpoint(&self, role: Role) -> SimulatedEndpoint {
        SimulatedEndpoint {
            role,
            address: format!("SIM::{}", role),
            bench: self.clone(),
        }
    }

    fn exchange(&self, role: Role, command: &str) -> Result<Option<String>> {
        let mut state = self.lock();
        state.log.push((role, command.to_string()));
        if state.take_failure(role, command) {
            bail!("injected failure on {} for '{}'", role, command);
        }
        state.handle(role, command)
    }

    fn latency(&self) -> Duration {
        self.lock().behaviour.latency
    }
}

/// One instrument's view of a [`SimulatedBench`].
#[derive(Debug, Clone)]
pub struct SimulatedEndpoint {
    role: Role,
    address: String,
    bench: SimulatedBench,
}

impl SimulatedEndpoint {
    async fn simulate_latency(&self) {
        let latency = self.bench.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ScpiEndpoint for SimulatedEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    async fn write(&self, command: &str) -> Result<()> {
        self.simulate_latency().await;
        match self.bench.exchange(self.role, command)? {
            None => Ok(()),
            Some(_) => bail!("-420,\"Query UNTERMINATED\": '{}' is a query", command),
        }
    }

    async fn query(&self, command: &str) -> Result<String> {
        self.simulate_latency().await;
        self.bench
            .exchange(self.role, command)?
            .ok_or_else(|| anyhow!("-410,\"Query INTERRUPTED\": '{}' has no reply", command))
    }
}

/// [`ConnectionFactory`] that connects every role to one simulated bench.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFactory {
    bench: SimulatedBench,
}

impl SimulatedFactory {
    /// Factory over `bench`.
    pub fn new(bench: SimulatedBench) -> Self {
        Self { bench }
    }

    /// The bench behind this factory.
    pub fn bench(&self) -> &SimulatedBench {
        &self.bench
    }
}

#[async_trait]
impl ConnectionFactory for SimulatedFactory {
    async fn open(&self, definition: &InstrumentDefinition) -> Result<Arc<dyn ScpiEndpoint>> {
        if self.bench.lock().unreachable.contains(&definition.role) {
            bail!("no response from {}", definition.address);
        }
        let mut endpoint = self.bench.endpoint(definition.role);
        endpoint.address = definition.address.clone();
        Ok(Arc::new(endpoint))
    }
}
