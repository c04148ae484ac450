//! Sweep parameter intake.
//!
//! The operator supplies a flat mapping of named parameters whose values
//! arrive as text. [`SweepConfiguration::from_params`] parses and validates
//! all of them up front so that a bad parameter is rejected before any
//! instrument is touched.

use crate::analysis::error_model::Coefficients;
use crate::error::{BenchError, BenchResult};
use crate::instrument::commands::{
    AutoZero, DmmRange, DmmSettings, FunctionMode, InputImpedance, Pairing, SenseMode,
};
use crate::sweep::readback::{MeasurementSource, SecondaryKind};
use crate::sweep::variant::AxisRange;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Immutable, validated sweep parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfiguration {
    /// Lowest current setpoint (A)
    pub min_current: f64,
    /// Highest current setpoint (A)
    pub max_current: f64,
    /// Current increment (A)
    pub current_step: f64,
    /// Lowest voltage setpoint (V)
    pub min_voltage: f64,
    /// Highest voltage setpoint (V)
    pub max_voltage: f64,
    /// Voltage increment (V)
    pub voltage_step: f64,
    /// Power ceiling (W) for the interlock
    pub power: f64,
    /// Fixed settle time after every setpoint change
    pub settle_delay: Duration,
    /// Additional operator-tunable settle time
    pub update_delay: Duration,
    /// DMM measurement setup
    pub dmm: DmmSettings,
    /// PSU regulation priority
    pub function_mode: FunctionMode,
    /// PSU sense wiring
    pub sense: SenseMode,
    /// Series/parallel output pairing
    pub pairing: Pairing,
    /// Programming error budget (gain1/offset1)
    pub programming: Coefficients,
    /// Readback error budget (gain2/offset2)
    pub readback: Coefficients,
    /// Rated full-scale voltage used by the offset term
    pub rated_voltage: f64,
    /// Rated full-scale current used by the offset term
    pub rated_current: f64,
    /// The PSU's own current ceiling, if known
    pub psu_max_current: Option<f64>,
    /// Added to an outer current that would otherwise be exactly zero
    pub offset_current: f64,
    /// How far below the PSU ceiling the load is programmed
    pub load_backoff: f64,
    /// Fixed load current for the static-load variant; unset means the load
    /// sinks the outer current
    pub static_load_current: Option<f64>,
    /// Shunt resistance (ohm) for shunt-scaled current measurements
    pub shunt_resistance: Option<f64>,
    /// Where the primary measurement comes from
    pub measurement_source: MeasurementSource,
    /// Overrides the variant's default secondary readback
    pub secondary_readback: Option<SecondaryKind>,
}

impl SweepConfiguration {
    /// Parse the flat operator mapping.
    ///
    /// Required keys: `min_current`, `max_current`, `current_step`,
    /// `min_voltage`, `max_voltage`, `voltage_step`, `power`. Everything else
    /// falls back to a default. The result is validated before returning.
    pub fn from_params(params: &HashMap<String, String>) -> BenchResult<Self> {
        let p = Params(params);

        let min_current = p.required("min_current")?;
        let max_current = p.required("max_current")?;
        let min_voltage = p.required("min_voltage")?;
        let max_voltage = p.required("max_voltage")?;

        let dmm = DmmSettings {
            aperture_nplc: p.optional("aperture")?.unwrap_or(10.0),
            auto_zero: p.parsed("auto_zero")?.unwrap_or(AutoZero::On),
            input_impedance: p.parsed("input_impedance")?.unwrap_or(InputImpedance::Auto),
            range: p.parsed("range")?.unwrap_or(DmmRange::Auto),
        };

        let config = Self {
            min_current,
            max_current,
            current_step: p.required("current_step")?,
            min_voltage,
            max_voltage,
            voltage_step: p.required("voltage_step")?,
            power: p.required("power")?,
            settle_delay: p.seconds("settle_delay")?.unwrap_or(Duration::from_millis(500)),
            update_delay: p.seconds("update_delay")?.unwrap_or(Duration::ZERO),
            dmm,
            function_mode: p.parsed("function_mode")?.unwrap_or(FunctionMode::Voltage),
            sense: p.parsed("sense")?.unwrap_or(SenseMode::Local),
            pairing: p.parsed("pairing")?.unwrap_or(Pairing::Off),
            programming: Coefficients {
                gain: p.optional("programming_gain")?.unwrap_or(0.0),
                offset: p.optional("programming_offset")?.unwrap_or(0.0),
            },
            readback: Coefficients {
                gain: p.optional("readback_gain")?.unwrap_or(0.0),
                offset: p.optional("readback_offset")?.unwrap_or(0.0),
            },
            rated_voltage: p.optional("rated_voltage")?.unwrap_or(max_voltage),
            rated_current: p.optional("rated_current")?.unwrap_or(max_current),
            psu_max_current: p.optional("psu_max_current")?,
            offset_current: p.optional("offset_current")?.unwrap_or(1.0),
            load_backoff: p.optional("load_backoff")?.unwrap_or(0.1),
            static_load_current: p.optional("static_load_current")?,
            shunt_resistance: p.optional("shunt_resistance")?,
            measurement_source: p
                .parsed("measurement_source")?
                .unwrap_or(MeasurementSource::Dmm),
            secondary_readback: p.parsed("secondary_readback")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every sweep relies on.
    pub fn validate(&self) -> BenchResult<()> {
        check_axis("current", self.min_current, self.max_current, self.current_step)?;
        check_axis("voltage", self.min_voltage, self.max_voltage, self.voltage_step)?;

        if !(self.power.is_finite() && self.power > 0.0) {
            return Err(BenchError::Configuration(format!(
                "power ceiling must be > 0, got {}",
                self.power
            )));
        }
        if self.min_current < 0.0 {
            return Err(BenchError::Configuration(format!(
                "min_current must be >= 0, got {}",
                self.min_current
            )));
        }
        check_finite("programming_gain", self.programming.gain)?;
        check_finite("programming_offset", self.programming.offset)?;
        check_finite("readback_gain", self.readback.gain)?;
        check_finite("readback_offset", self.readback.offset)?;
        check_non_negative("rated_voltage", self.rated_voltage)?;
        check_non_negative("rated_current", self.rated_current)?;
        check_positive("offset_current", self.offset_current)?;
        if let Some(ceiling) = self.psu_max_current {
            check_positive("psu_max_current", ceiling)?;
        }
        if self.settle_delay.checked_add(self.update_delay).is_none() {
            return Err(BenchError::Configuration(
                "settle_delay + update_delay is out of range".to_string(),
            ));
        }
        if let Some(shunt) = self.shunt_resistance {
            if !(shunt.is_finite() && shunt > 0.0) {
                return Err(BenchError::Configuration(format!(
                    "shunt_resistance must be > 0, got {}",
                    shunt
                )));
            }
        }
        if let Some(current) = self.static_load_current {
            if !(current.is_finite() && current >= 0.0) {
                return Err(BenchError::Configuration(format!(
                    "static_load_current must be >= 0, got {}",
                    current
                )));
            }
        }
        if !(self.load_backoff.is_finite() && self.load_backoff >= 0.0) {
            return Err(BenchError::Configuration(format!(
                "load_backoff must be >= 0, got {}",
                self.load_backoff
            )));
        }
        if self.dmm.aperture_nplc.is_nan() || self.dmm.aperture_nplc <= 0.0 {
            return Err(BenchError::Configuration(format!(
                "aperture must be > 0 NPLC, got {}",
                self.dmm.aperture_nplc
            )));
        }
        Ok(())
    }

    /// Current setpoints, before the operating-point safety rules.
    pub fn current_axis(&self) -> AxisRange {
        AxisRange::new(self.min_current, self.max_current, self.current_step)
    }

    /// Voltage setpoints.
    pub fn voltage_axis(&self) -> AxisRange {
        AxisRange::new(self.min_voltage, self.max_voltage, self.voltage_step)
    }

    /// Total settle time applied after programming a point.
    pub fn total_settle(&self) -> Duration {
        self.settle_delay.saturating_add(self.update_delay)
    }
}

fn check_finite(name: &str, value: f64) -> BenchResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(BenchError::Configuration(format!(
            "{} must be finite, got {}",
            name, value
        )))
    }
}

fn check_non_negative(name: &str, value: f64) -> BenchResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(BenchError::Configuration(format!(
            "{} must be >= 0, got {}",
            name, value
        )))
    }
}

fn check_positive(name: &str, value: f64) -> BenchResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(BenchError::Configuration(format!(
            "{} must be > 0, got {}",
            name, value
        )))
    }
}

fn check_axis(name: &str, min: f64, max: f64, step: f64) -> BenchResult<()> {
    if !(min.is_finite() && max.is_finite() && step.is_finite()) {
        return Err(BenchError::Configuration(format!(
            "{} bounds and step must be finite",
            name
        )));
    }
    if step <= 0.0 {
        return Err(BenchError::Configuration(format!(
            "{}_step must be > 0, got {}",
            name, step
        )));
    }
    if min > max {
        return Err(BenchError::Configuration(format!(
            "min_{name} ({min}) is greater than max_{name} ({max})"
        )));
    }
    Ok(())
}

struct Params<'a>(&'a HashMap<String, String>);

impl Params<'_> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &str) -> BenchResult<f64> {
        let raw = self.raw(key).ok_or_else(|| {
            BenchError::Configuration(format!("missing required parameter '{}'", key))
        })?;
        parse_number(key, raw)
    }

    fn optional(&self, key: &str) -> BenchResult<Option<f64>> {
        self.raw(key).map(|raw| parse_number(key, raw)).transpose()
    }

    fn seconds(&self, key: &str) -> BenchResult<Option<Duration>> {
        match self.optional(key)? {
            None => Ok(None),
            Some(secs) => Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
                BenchError::Configuration(format!(
                    "'{}' must be a non-negative number of seconds in range, got {}",
                    key, secs
                ))
            }),
        }
    }

    fn parsed<T>(&self, key: &str) -> BenchResult<Option<T>>
    where
        T: FromStr<Err = String>,
    {
        self.raw(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|err| {
                    BenchError::Configuration(format!("invalid value for '{}': {}", key, err))
                })
            })
            .transpose()
    }
}

fn parse_number(key: &str, raw: &str) -> BenchResult<f64> {
    raw.parse::<f64>().map_err(|_| {
        BenchError::Configuration(format!(
            "parameter '{}' is not numeric: {:?}",
            key, raw
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn minimal() -> HashMap<String, String> {
        params(&[
            ("min_current", "1"),
            ("max_current", "2"),
            ("current_step", "1"),
            ("min_voltage", "0"),
            ("max_voltage", "1"),
            ("voltage_step", "1"),
            ("power", "100"),
        ])
    }

    #[test]
    fn parses_minimal_mapping_with_defaults() {
        let config = SweepConfiguration::from_params(&minimal()).unwrap();
        assert_eq!(config.max_current, 2.0);
        assert_eq!(config.rated_voltage, 1.0);
        assert_eq!(config.offset_current, 1.0);
        assert_eq!(config.settle_delay, Duration::from_millis(500));
        assert_eq!(config.measurement_source, MeasurementSource::Dmm);
        assert_eq!(config.dmm.auto_zero, AutoZero::On);
    }

    #[test]
    fn missing_key_is_configuration_error() {
        let mut p = minimal();
        p.remove("power");
        let err = SweepConfiguration::from_params(&p).unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
        assert!(err.to_string().contains("'power'"));
    }

    #[test]
    fn non_numeric_value_is_rejected() {
        let mut p = minimal();
        p.insert("max_voltage".into(), "twelve".into());
        let err = SweepConfiguration::from_params(&p).unwrap_err();
        assert!(err.to_string().contains("not numeric"));
    }

    #[test]
    fn zero_step_fails_fast() {
        let mut p = minimal();
        p.insert("voltage_step".into(), "0".into());
        let err = SweepConfiguration::from_params(&p).unwrap_err();
        assert!(err.to_string().contains("voltage_step must be > 0"));
    }

    #[test]
    fn inverted_bounds_rejected() {
        let mut p = minimal();
        p.insert("min_current".into(), "3".into());
        let err = SweepConfiguration::from_params(&p).unwrap_err();
        assert!(err.to_string().contains("greater than max_current"));
    }

    #[test]
    fn non_positive_power_rejected() {
        let mut p = minimal();
        p.insert("power".into(), "0".into());
        assert!(SweepConfiguration::from_params(&p).is_err());
    }

    #[test]
    fn enumerated_parameters_are_parsed() {
        let mut p = minimal();
        p.insert("sense".into(), "remote".into());
        p.insert("pairing".into(), "Parallel".into());
        p.insert("range".into(), "10".into());
        p.insert("secondary_readback".into(), "load_current".into());
        let config = SweepConfiguration::from_params(&p).unwrap();
        assert_eq!(config.sense, SenseMode::Remote);
        assert_eq!(config.pairing, Pairing::Parallel);
        assert_eq!(config.dmm.range, DmmRange::Fixed(10.0));
        assert_eq!(config.secondary_readback, Some(SecondaryKind::LoadCurrent));
    }

    #[test]
    fn delays_are_seconds() {
        let mut p = minimal();
        p.insert("update_delay".into(), "0.25".into());
        p.insert("settle_delay".into(), "0".into());
        let config = SweepConfiguration::from_params(&p).unwrap();
        assert_eq!(config.total_settle(), Duration::from_millis(250));
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        for (key, value) in [
            ("offset_current", "NaN"),
            ("offset_current", "-1"),
            ("offset_current", "0"),
            ("psu_max_current", "inf"),
            ("programming_gain", "NaN"),
            ("readback_offset", "-inf"),
            ("rated_voltage", "NaN"),
            ("rated_current", "inf"),
            ("load_backoff", "inf"),
            ("min_current", "-1"),
        ] {
            let mut p = minimal();
            p.insert(key.into(), value.into());
            let err = SweepConfiguration::from_params(&p).unwrap_err();
            assert!(
                matches!(err, BenchError::Configuration(_)),
                "{key}={value} gave {err}"
            );
        }
    }

    #[test]
    fn out_of_range_delays_are_rejected() {
        let mut p = minimal();
        p.insert("settle_delay".into(), "1e30".into());
        assert!(matches!(
            SweepConfiguration::from_params(&p),
            Err(BenchError::Configuration(_))
        ));

        // each fits a Duration, the sum does not
        let mut p = minimal();
        p.insert("settle_delay".into(), "1e19".into());
        p.insert("update_delay".into(), "1e19".into());
        assert!(matches!(
            SweepConfiguration::from_params(&p),
            Err(BenchError::Configuration(_))
        ));
    }
}
