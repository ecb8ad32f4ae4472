//! Typed `@dutctl` commands and per-verb argument validation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use super::error::ProtocolError;
use crate::instrument::types::{LevelEdge, MAX_CHANNEL, Metric, Setting};

/// Marker that introduces a directive on a serial line.
pub const MARKER: &str = "@dutctl";

/// Version of the directive grammar served by this build.
pub const PROTOCOL_VERSION: u32 = 2;

/// Longest accepted `sync` token or result key.
pub const MAX_TOKEN_LEN: usize = 64;

/// Longest accepted `wait`, in milliseconds.
pub const MAX_WAIT_MS: u64 = 600_000;

// ---------------------------------------------------------------------------
// Verb
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Measure,
    Set,
    Reset,
    Sync,
    Report,
    Wait,
    Snapshot,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Measure => "measure",
            Verb::Set => "set",
            Verb::Reset => "reset",
            Verb::Sync => "sync",
            Verb::Report => "report",
            Verb::Wait => "wait",
            Verb::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "measure" => Ok(Verb::Measure),
            "set" => Ok(Verb::Set),
            "reset" => Ok(Verb::Reset),
            "sync" => Ok(Verb::Sync),
            "report" => Ok(Verb::Report),
            "wait" => Ok(Verb::Wait),
            "snapshot" => Ok(Verb::Snapshot),
            other => Err(ProtocolError::UnknownVerb(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Metric names and setpoints
// ---------------------------------------------------------------------------

/// Metric as named on the wire; the channel is resolved at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricName {
    Voltage,
    Current,
    VoltageSetpoint,
    CurrentSetpoint,
    Frequency,
    Reset,
}

impl MetricName {
    pub fn to_metric(self, channel: u8) -> Metric {
        match self {
            MetricName::Voltage => Metric::Voltage { channel },
            MetricName::Current => Metric::Current { channel },
            MetricName::VoltageSetpoint => Metric::VoltageSetpoint { channel },
            MetricName::CurrentSetpoint => Metric::CurrentSetpoint { channel },
            MetricName::Frequency => Metric::Frequency { source: channel },
            MetricName::Reset => Metric::ResetLine,
        }
    }
}

impl FromStr for MetricName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voltage" | "vol" => Ok(MetricName::Voltage),
            "current" | "cur" => Ok(MetricName::Current),
            "vset" => Ok(MetricName::VoltageSetpoint),
            "iset" => Ok(MetricName::CurrentSetpoint),
            "frequency" | "freq" => Ok(MetricName::Frequency),
            "reset" => Ok(MetricName::Reset),
            other => Err(ProtocolError::InvalidArgument {
                what: "metric",
                value: other.to_string(),
            }),
        }
    }
}

/// A validated `set` parameter and value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setpoint {
    Voltage(f64),
    Current(f64),
    Frequency(f64),
    High(f64),
    Low(f64),
    Duty(f64),
    Output(bool),
}

impl Setpoint {
    /// Typed setting for `channel` (a supply channel or generator source).
    pub fn to_setting(self, channel: u8) -> Setting {
        match self {
            Setpoint::Voltage(volts) => Setting::Voltage { channel, volts },
            Setpoint::Current(amps) => Setting::CurrentLimit { channel, amps },
            Setpoint::Frequency(hertz) => Setting::Frequency {
                source: channel,
                hertz,
            },
            Setpoint::High(volts) => Setting::Level {
                source: channel,
                edge: LevelEdge::High,
                volts,
            },
            Setpoint::Low(volts) => Setting::Level {
                source: channel,
                edge: LevelEdge::Low,
                volts,
            },
            Setpoint::Duty(percent) => Setting::Duty {
                source: channel,
                percent,
            },
            // Output switches the supply channel relay; generators use
            // `ClockOutput`, chosen at dispatch from the capability set.
            Setpoint::Output(enabled) => Setting::Output { channel, enabled },
        }
    }

    fn parse(param: &str, value: &str) -> Result<Self, ProtocolError> {
        match param {
            "voltage" => {
                let v = parse_number("voltage", value)?;
                check_range("voltage", v, (0.0..=60.0).contains(&v), "[0, 60] V")?;
                Ok(Setpoint::Voltage(v))
            }
            "current" => {
                let v = parse_number("current", value)?;
                check_range("current", v, (0.0..=10.0).contains(&v), "[0, 10] A")?;
                Ok(Setpoint::Current(v))
            }
            "frequency" => {
                let v = parse_number("frequency", value)?;
                check_range("frequency", v, v > 0.0 && v <= 1e9, "(0, 1e9] Hz")?;
                Ok(Setpoint::Frequency(v))
            }
            "high" | "low" => {
                let v = parse_number("level", value)?;
                check_range("level", v, (-20.0..=20.0).contains(&v), "[-20, 20] V")?;
                Ok(if param == "high" {
                    Setpoint::High(v)
                } else {
                    Setpoint::Low(v)
                })
            }
            "duty" => {
                let v = parse_number("duty", value)?;
                check_range("duty", v, v > 0.0 && v < 100.0, "(0, 100) %")?;
                Ok(Setpoint::Duty(v))
            }
            "output" => match value {
                "on" | "1" | "true" => Ok(Setpoint::Output(true)),
                "off" | "0" | "false" => Ok(Setpoint::Output(false)),
                other => Err(ProtocolError::InvalidArgument {
                    what: "output state",
                    value: other.to_string(),
                }),
            },
            other => Err(ProtocolError::InvalidArgument {
                what: "parameter",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Directive / Command
// ---------------------------------------------------------------------------

/// The validated meaning of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Measure {
        instrument: String,
        metric: MetricName,
        channel: Option<u8>,
    },
    Set {
        instrument: String,
        setpoint: Setpoint,
        channel: Option<u8>,
    },
    Reset {
        instrument: String,
    },
    Sync {
        token: String,
    },
    Report {
        key: String,
        value: serde_json::Value,
    },
    Wait {
        duration: Duration,
    },
    Snapshot {
        key: String,
        instrument: Option<String>,
        channel: Option<u8>,
    },
}

impl Directive {
    pub fn verb(&self) -> Verb {
        match self {
            Directive::Measure { .. } => Verb::Measure,
            Directive::Set { .. } => Verb::Set,
            Directive::Reset { .. } => Verb::Reset,
            Directive::Sync { .. } => Verb::Sync,
            Directive::Report { .. } => Verb::Report,
            Directive::Wait { .. } => Verb::Wait,
            Directive::Snapshot { .. } => Verb::Snapshot,
        }
    }

    /// Whether executing the directive changes instrument state.
    pub fn mutates_instruments(&self) -> bool {
        matches!(self, Directive::Set { .. } | Directive::Reset { .. })
    }

    /// Validate `args` for `verb`.
    ///
    /// For `report`, everything after the key forms the value.
    pub fn parse(verb: Verb, args: &[String]) -> Result<Self, ProtocolError> {
        let arity = |expected: &'static str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(ProtocolError::ArgCount {
                    verb,
                    expected,
                    got: args.len(),
                })
            }
        };

        match verb {
            Verb::Measure => {
                arity("2-3", (2..=3).contains(&args.len()))?;
                Ok(Directive::Measure {
                    instrument: instrument_name(&args[0])?,
                    metric: args[1].parse()?,
                    channel: args.get(2).map(|c| parse_channel(c)).transpose()?,
                })
            }
            Verb::Set => {
                arity("3-4", (3..=4).contains(&args.len()))?;
                Ok(Directive::Set {
                    instrument: instrument_name(&args[0])?,
                    setpoint: Setpoint::parse(&args[1], &args[2])?,
                    channel: args.get(3).map(|c| parse_channel(c)).transpose()?,
                })
            }
            Verb::Reset => {
                arity("1", args.len() == 1)?;
                Ok(Directive::Reset {
                    instrument: instrument_name(&args[0])?,
                })
            }
            Verb::Sync => {
                arity("1", args.len() == 1)?;
                Ok(Directive::Sync {
                    token: token("sync token", &args[0])?,
                })
            }
            Verb::Report => {
                arity("at least 2", args.len() >= 2)?;
                Ok(Directive::Report {
                    key: result_key(&args[0])?,
                    value: parse_literal(&args[1..].join(" ")),
                })
            }
            Verb::Wait => {
                arity("1", args.len() == 1)?;
                let ms = args[0].parse::<u64>().map_err(|_| ProtocolError::InvalidNumber {
                    what: "wait",
                    value: args[0].clone(),
                })?;
                if ms > MAX_WAIT_MS {
                    return Err(ProtocolError::OutOfRange {
                        what: "wait",
                        value: ms as f64,
                        range: "[0, 600000] ms",
                    });
                }
                Ok(Directive::Wait {
                    duration: Duration::from_millis(ms),
                })
            }
            Verb::Snapshot => {
                arity("1-3", (1..=3).contains(&args.len()))?;
                Ok(Directive::Snapshot {
                    key: result_key(&args[0])?,
                    instrument: args.get(1).map(|n| instrument_name(n)).transpose()?,
                    channel: args.get(2).map(|c| parse_channel(c)).transpose()?,
                })
            }
        }
    }
}

/// One parsed command, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub verb: Verb,
    pub args: Vec<String>,
    pub directive: Directive,
    /// Directive text exactly as received (continuations joined with `\n`).
    pub raw: String,
    /// Serial line number on which the directive started.
    pub line: u64,
    /// Delay requested before execution (legacy directives only).
    pub delay: Duration,
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn check_range(what: &'static str, value: f64, ok: bool, range: &'static str) -> Result<(), ProtocolError> {
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::OutOfRange { what, value, range })
    }
}

pub(crate) fn parse_number(what: &'static str, value: &str) -> Result<f64, ProtocolError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ProtocolError::InvalidNumber {
            what,
            value: value.to_string(),
        })
}

pub(crate) fn parse_channel(value: &str) -> Result<u8, ProtocolError> {
    let channel = value.parse::<u8>().map_err(|_| ProtocolError::InvalidNumber {
        what: "channel",
        value: value.to_string(),
    })?;
    if channel > MAX_CHANNEL {
        return Err(ProtocolError::OutOfRange {
            what: "channel",
            value: f64::from(channel),
            range: "[0, 16]",
        });
    }
    Ok(channel)
}

fn token(what: &'static str, value: &str) -> Result<String, ProtocolError> {
    let ok = !value.is_empty()
        && value.len() <= MAX_TOKEN_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(value.to_string())
    } else {
        Err(ProtocolError::InvalidArgument {
            what,
            value: value.to_string(),
        })
    }
}

pub(crate) fn instrument_name(value: &str) -> Result<String, ProtocolError> {
    token("instrument name", value)
}

/// Result keys starting with `_` are reserved for host-side measurements.
pub(crate) fn result_key(value: &str) -> Result<String, ProtocolError> {
    let key = token("result key", value)?;
    if key.starts_with('_') {
        return Err(ProtocolError::InvalidArgument {
            what: "result key",
            value: key,
        });
    }
    Ok(key)
}

/// Interpret a reported value: integers (decimal or `0x` hex), floats and
/// booleans become JSON scalars; anything else stays a string.
pub fn parse_literal(text: &str) -> serde_json::Value {
    use serde_json::Value;

    let text = text.trim();
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"));
    if let Some(digits) = hex {
        if let Ok(u) = u64::from_str_radix(digits, 16) {
            return Value::from(u);
        }
    }
    if let Ok(f) = text.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match text {
        "true" | "True" => Value::Bool(true),
        "false" | "False" => Value::Bool(false),
        _ => Value::String(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn verb_round_trip() {
        for verb in [
            Verb::Measure,
            Verb::Set,
            Verb::Reset,
            Verb::Sync,
            Verb::Report,
            Verb::Wait,
            Verb::Snapshot,
        ] {
            assert_eq!(verb.as_str().parse::<Verb>().unwrap(), verb);
        }
        assert!(matches!(
            "frobnicate".parse::<Verb>(),
            Err(ProtocolError::UnknownVerb(v)) if v == "frobnicate"
        ));
    }

    #[test]
    fn measure_with_and_without_channel() {
        let d = Directive::parse(Verb::Measure, &args(&["psu0", "current", "2"])).unwrap();
        assert_eq!(
            d,
            Directive::Measure {
                instrument: "psu0".into(),
                metric: MetricName::Current,
                channel: Some(2),
            }
        );
        let d = Directive::parse(Verb::Measure, &args(&["gen0", "frequency"])).unwrap();
        assert!(matches!(d, Directive::Measure { channel: None, .. }));
    }

    #[test]
    fn current_limit_bounds_are_inclusive() {
        for ok in ["0", "10"] {
            let d = Directive::parse(Verb::Set, &args(&["psu0", "current", ok, "1"])).unwrap();
            assert!(matches!(d, Directive::Set { .. }), "{ok}: {d:?}");
        }
        for bad in ["-0.1", "10.5"] {
            assert!(
                matches!(
                    Directive::parse(Verb::Set, &args(&["psu0", "current", bad, "1"])),
                    Err(ProtocolError::OutOfRange { what: "current", .. })
                ),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn set_validates_ranges() {
        assert!(Directive::parse(Verb::Set, &args(&["psu0", "voltage", "0.8", "1"])).is_ok());
        assert!(matches!(
            Directive::parse(Verb::Set, &args(&["psu0", "voltage", "61"])),
            Err(ProtocolError::OutOfRange { what: "voltage", .. })
        ));
        assert!(matches!(
            Directive::parse(Verb::Set, &args(&["gen0", "duty", "100"])),
            Err(ProtocolError::OutOfRange { what: "duty", .. })
        ));
        assert!(matches!(
            Directive::parse(Verb::Set, &args(&["gen0", "frequency", "abc"])),
            Err(ProtocolError::InvalidNumber { .. })
        ));
        assert!(matches!(
            Directive::parse(Verb::Set, &args(&["psu0", "wattage", "1"])),
            Err(ProtocolError::InvalidArgument { what: "parameter", .. })
        ));
        assert!(matches!(
            Directive::parse(Verb::Set, &args(&["psu0", "voltage", "NaN"])),
            Err(ProtocolError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn set_output_accepts_switch_words() {
        let d = Directive::parse(Verb::Set, &args(&["psu0", "output", "off", "2"])).unwrap();
        assert_eq!(
            d,
            Directive::Set {
                instrument: "psu0".into(),
                setpoint: Setpoint::Output(false),
                channel: Some(2),
            }
        );
        assert!(d.mutates_instruments());
    }

    #[test]
    fn channel_bounds() {
        assert!(matches!(
            Directive::parse(Verb::Measure, &args(&["psu0", "voltage", "17"])),
            Err(ProtocolError::OutOfRange { what: "channel", .. })
        ));
        assert!(matches!(
            Directive::parse(Verb::Measure, &args(&["psu0", "voltage", "-1"])),
            Err(ProtocolError::InvalidNumber { what: "channel", .. })
        ));
    }

    #[test]
    fn arity_is_checked() {
        assert!(matches!(
            Directive::parse(Verb::Reset, &args(&[])),
            Err(ProtocolError::ArgCount {
                verb: Verb::Reset,
                got: 0,
                ..
            })
        ));
        assert!(matches!(
            Directive::parse(Verb::Sync, &args(&["a", "b"])),
            Err(ProtocolError::ArgCount { verb: Verb::Sync, .. })
        ));
    }

    #[test]
    fn sync_token_limits() {
        let long = "x".repeat(MAX_TOKEN_LEN + 1);
        assert!(Directive::parse(Verb::Sync, &[long]).is_err());
        assert!(Directive::parse(Verb::Sync, &args(&["boot-1.2_ok"])).is_ok());
        assert!(Directive::parse(Verb::Sync, &args(&["bad/token"])).is_err());
    }

    #[test]
    fn wait_limits() {
        assert_eq!(
            Directive::parse(Verb::Wait, &args(&["250"])).unwrap(),
            Directive::Wait {
                duration: Duration::from_millis(250)
            }
        );
        assert!(Directive::parse(Verb::Wait, &args(&["600001"])).is_err());
    }

    #[test]
    fn report_joins_value_words() {
        let d = Directive::parse(Verb::Report, &args(&["status", "all", "tests", "passed"])).unwrap();
        assert_eq!(
            d,
            Directive::Report {
                key: "status".into(),
                value: json!("all tests passed"),
            }
        );
        assert!(Directive::parse(Verb::Report, &args(&["_standby", "1"])).is_err());
    }

    #[test]
    fn literal_typing() {
        assert_eq!(parse_literal("42"), json!(42));
        assert_eq!(parse_literal("-7"), json!(-7));
        assert_eq!(parse_literal("0xdead"), json!(0xdead));
        assert_eq!(parse_literal("1.5e3"), json!(1500.0));
        assert_eq!(parse_literal("True"), json!(true));
        assert_eq!(parse_literal("false"), json!(false));
        assert_eq!(parse_literal("cycles=12"), json!("cycles=12"));
        assert_eq!(parse_literal("inf"), json!("inf"));
    }

    #[test]
    fn setpoints_become_settings() {
        assert_eq!(
            Setpoint::High(0.9).to_setting(2),
            Setting::Level {
                source: 2,
                edge: LevelEdge::High,
                volts: 0.9
            }
        );
        assert_eq!(
            MetricName::Frequency.to_metric(1),
            Metric::Frequency { source: 1 }
        );
    }
}
