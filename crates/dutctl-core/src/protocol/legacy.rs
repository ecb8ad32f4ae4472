//! Version 1 colon-separated directives (`@dutctl:psumeas:...`).
//!
//! Older firmware still emits these; they decode into the same typed
//! [`Directive`]s as version 2 lines, plus an optional pre-execution delay.

use std::time::Duration;

use super::command::{
    Directive, MAX_WAIT_MS, Setpoint, Verb, instrument_name, parse_channel, parse_literal,
    parse_number, result_key,
};
use super::error::ProtocolError;

/// A decoded legacy directive.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyDirective {
    pub verb: Verb,
    pub args: Vec<String>,
    pub directive: Directive,
    pub delay: Duration,
}

/// Decode the text following `@dutctl:`.
pub fn decode(body: &str) -> Result<LegacyDirective, ProtocolError> {
    let body = body.trim();
    let mut parts = body.split(':');
    let name = parts.next().unwrap_or_default();
    let args: Vec<String> = parts.map(str::to_string).collect();

    match name {
        "" => Err(ProtocolError::Empty),
        "psumeas" => {
            if !(2..=4).contains(&args.len()) {
                return Err(arg_count(Verb::Snapshot, "2-4", args.len()));
            }
            let directive = Directive::Snapshot {
                key: result_key(&args[0])?,
                instrument: args.get(2).map(|n| instrument_name(n)).transpose()?,
                channel: args.get(3).map(|c| parse_channel(c)).transpose()?,
            };
            Ok(LegacyDirective {
                verb: Verb::Snapshot,
                delay: delay(&args[1])?,
                args,
                directive,
            })
        }
        "psuctl" => {
            if args.len() != 4 {
                return Err(arg_count(Verb::Set, "4", args.len()));
            }
            let volts = parse_number("voltage", &args[0])?;
            if !(0.0..=60.0).contains(&volts) {
                return Err(ProtocolError::OutOfRange {
                    what: "voltage",
                    value: volts,
                    range: "[0, 60] V",
                });
            }
            let directive = Directive::Set {
                instrument: instrument_name(&args[2])?,
                setpoint: Setpoint::Voltage(volts),
                channel: Some(parse_channel(&args[3])?),
            };
            Ok(LegacyDirective {
                verb: Verb::Set,
                delay: delay(&args[1])?,
                args,
                directive,
            })
        }
        "dutmeas" => {
            if args.len() < 2 {
                return Err(arg_count(Verb::Report, "at least 2", args.len()));
            }
            let directive = Directive::Report {
                key: result_key(&args[0])?,
                value: parse_literal(&args[1..].join(":")),
            };
            Ok(LegacyDirective {
                verb: Verb::Report,
                delay: Duration::ZERO,
                args,
                directive,
            })
        }
        other => Err(ProtocolError::UnknownVerb(other.to_string())),
    }
}

fn arg_count(verb: Verb, expected: &'static str, got: usize) -> ProtocolError {
    ProtocolError::ArgCount {
        verb,
        expected,
        got,
    }
}

fn delay(text: &str) -> Result<Duration, ProtocolError> {
    let ms = text.parse::<u64>().map_err(|_| ProtocolError::InvalidNumber {
        what: "delay",
        value: text.to_string(),
    })?;
    if ms > MAX_WAIT_MS {
        return Err(ProtocolError::OutOfRange {
            what: "delay",
            value: ms as f64,
            range: "[0, 600000] ms",
        });
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn psumeas_with_supply_and_channel() {
        let d = decode("psumeas:run_end:250:psu0:2").unwrap();
        assert_eq!(d.verb, Verb::Snapshot);
        assert_eq!(d.delay, Duration::from_millis(250));
        assert_eq!(
            d.directive,
            Directive::Snapshot {
                key: "run_end".into(),
                instrument: Some("psu0".into()),
                channel: Some(2),
            }
        );
    }

    #[test]
    fn psumeas_global() {
        let d = decode("psumeas:idle:0").unwrap();
        assert!(matches!(
            d.directive,
            Directive::Snapshot {
                instrument: None,
                channel: None,
                ..
            }
        ));
    }

    #[test]
    fn psuctl_sets_voltage() {
        let d = decode("psuctl:0.75:10:psu0:1").unwrap();
        assert_eq!(
            d.directive,
            Directive::Set {
                instrument: "psu0".into(),
                setpoint: Setpoint::Voltage(0.75),
                channel: Some(1),
            }
        );
        assert_eq!(d.delay, Duration::from_millis(10));
    }

    #[test]
    fn dutmeas_keeps_colons_in_value() {
        let d = decode("dutmeas:build:v1:2:3").unwrap();
        assert_eq!(
            d.directive,
            Directive::Report {
                key: "build".into(),
                value: json!("v1:2:3"),
            }
        );
        let d = decode("dutmeas:cycles:1234\r").unwrap();
        assert!(matches!(d.directive, Directive::Report { value, .. } if value == json!(1234)));
    }

    #[test]
    fn malformed_legacy_lines() {
        assert!(matches!(decode(""), Err(ProtocolError::Empty)));
        assert!(matches!(decode("psuzap:1"), Err(ProtocolError::UnknownVerb(_))));
        assert!(matches!(decode("psuctl:1:0:psu0"), Err(ProtocolError::ArgCount { .. })));
        assert!(matches!(decode("psumeas:k:soon"), Err(ProtocolError::InvalidNumber { .. })));
        assert!(matches!(
            decode("psuctl:99:0:psu0:1"),
            Err(ProtocolError::OutOfRange { .. })
        ));
    }
}
