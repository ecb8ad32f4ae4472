//! Lab configuration: which instruments exist, how each channel is
//! provisioned, and the timing and retry knobs of a session.
//!
//! Configuration is TOML. Every file carries a `safety_hash`: the first 16
//! hex digits of the SHA-256 of the document (without the hash key itself)
//! in canonical form. A file whose hash does not match is refused, so a
//! hand-edited voltage cannot reach the DUT without someone re-stamping
//! the file with `dutctl hash`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::instrument::retry::RetryPolicy;
use crate::instrument::types::{Endpoint, MAX_CHANNEL, PairMode, Waveform};

/// Hash value that disables the safety check.
pub const SAFETY_HASH_BYPASS: &str = "d0a515a1";

/// Key holding the hash inside the document.
pub const SAFETY_HASH_KEY: &str = "safety_hash";

const HASH_HEX_LEN: usize = 16;

/// Errors that can occur while loading or validating a lab configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Toml(String),

    #[error("configuration has no safety_hash; its contents hash to {expected}")]
    MissingSafetyHash { expected: String },

    #[error("safety hash mismatch: file says {found}, contents hash to {expected}")]
    SafetyHashMismatch { found: String, expected: String },

    #[error("{0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Toml(err.message().to_string())
    }
}

// -----------------------------------------------------------------------
// Validated model
// -----------------------------------------------------------------------

/// Outcome of the safety hash check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashCheck {
    Verified,
    /// The bypass value was used; `actual` is what the hash should be.
    Bypassed { actual: String },
}

/// A fully validated lab configuration.
#[derive(Debug, Clone)]
pub struct LabConfig {
    pub dut: DutConfig,
    pub supplies: BTreeMap<String, SupplyConfig>,
    pub clocks: BTreeMap<String, ClockConfig>,
    pub generic: BTreeMap<String, GenericConfig>,
    pub timing: TimingConfig,
    pub retry: RetryPolicy,
    pub dispatch: DispatchConfig,
    pub hash_check: HashCheck,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DutConfig {
    pub name: String,
    /// Supply whose GPIO pin drives the active-low reset line.
    pub reset: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupplyConfig {
    pub endpoint: Endpoint,
    pub reset_pin: Option<u8>,
    pub pair_mode: PairMode,
    /// Channel 0 denotes a single-output supply.
    pub channels: BTreeMap<u8, ChannelConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub voltage: f64,
    pub current: f64,
    pub voltage_min: f64,
    pub voltage_max: f64,
    pub enabled: bool,
    pub four_wire: bool,
    pub measure: bool,
    pub measure_voltage: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockConfig {
    pub endpoint: Endpoint,
    pub sources: BTreeMap<u8, SourceConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub frequency: f64,
    pub high: f64,
    pub low: f64,
    pub duty: f64,
    pub waveform: Waveform,
    pub enabled: bool,
    /// Switched off for leakage measurements.
    pub leak_off: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenericConfig {
    pub endpoint: Endpoint,
}

/// Delays used by power and reset sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    pub reset_pulse: Duration,
    pub post_reset: Duration,
    pub power_settle: Duration,
    pub standby_wait: Duration,
    pub leak_wait: Duration,
    pub drain_grace: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reset_pulse: Duration::from_millis(100),
            post_reset: Duration::from_millis(100),
            power_settle: Duration::from_millis(200),
            standby_wait: Duration::from_millis(500),
            leak_wait: Duration::from_millis(500),
            drain_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Upper bound for one dispatched instrument command.
    pub command_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
        }
    }
}

impl LabConfig {
    /// All configured instrument names, sorted.
    pub fn instrument_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .supplies
            .keys()
            .chain(self.clocks.keys())
            .chain(self.generic.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Sources to switch off before a leakage measurement.
    pub fn leak_off_sources(&self) -> Vec<(String, u8)> {
        self.clocks
            .iter()
            .flat_map(|(name, clock)| {
                clock
                    .sources
                    .iter()
                    .filter(|(_, src)| src.leak_off)
                    .map(move |(idx, _)| (name.clone(), *idx))
            })
            .collect()
    }
}

// -----------------------------------------------------------------------
// Raw TOML model
// -----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLabConfig {
    #[serde(rename = "safety_hash")]
    _safety_hash: Option<String>,
    dut: RawDut,
    #[serde(default)]
    supplies: BTreeMap<String, RawSupply>,
    #[serde(default)]
    clocks: BTreeMap<String, RawClock>,
    #[serde(default)]
    generic: BTreeMap<String, RawGeneric>,
    #[serde(default)]
    timing: RawTiming,
    #[serde(default)]
    retry: RawRetry,
    #[serde(default)]
    dispatch: RawDispatch,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDut {
    name: String,
    reset: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSupply {
    address: String,
    #[serde(alias = "reset_gpio")]
    reset_pin: Option<u8>,
    #[serde(default, alias = "opmode")]
    pair: PairMode,
    channels: BTreeMap<String, RawChannel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChannel {
    voltage: f64,
    current: f64,
    voltage_min: Option<f64>,
    voltage_max: Option<f64>,
    #[serde(default = "default_true", alias = "active")]
    enabled: bool,
    #[serde(default)]
    four_wire: bool,
    #[serde(default)]
    measure: bool,
    #[serde(default)]
    measure_voltage: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawClock {
    address: String,
    sources: BTreeMap<String, RawSource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
    frequency: f64,
    high: f64,
    low: f64,
    #[serde(default, alias = "shape")]
    waveform: Waveform,
    #[serde(default = "default_duty")]
    duty: f64,
    #[serde(default = "default_true", alias = "active")]
    enabled: bool,
    #[serde(default)]
    leak_off: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGeneric {
    address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTiming {
    reset_pulse_ms: Option<u64>,
    post_reset_ms: Option<u64>,
    power_settle_ms: Option<u64>,
    standby_wait_ms: Option<u64>,
    leak_wait_ms: Option<u64>,
    drain_grace_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetry {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    io_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDispatch {
    command_timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_duty() -> f64 {
    50.0
}

fn ms_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

// -----------------------------------------------------------------------
// Safety hash
// -----------------------------------------------------------------------

/// Compute the safety hash of a parsed document, ignoring its own
/// `safety_hash` entry.
pub fn compute_safety_hash(doc: &toml::Table) -> Result<String, ConfigError> {
    let mut doc = doc.clone();
    doc.remove(SAFETY_HASH_KEY);
    let canonical = toml::to_string(&doc).map_err(|e| ConfigError::Toml(e.to_string()))?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_HEX_LEN);
    Ok(hex)
}

/// Compute the safety hash of a TOML document given as text.
pub fn safety_hash_of(content: &str) -> Result<String, ConfigError> {
    let doc: toml::Table = toml::from_str(content)?;
    compute_safety_hash(&doc)
}

/// Return `content` with its `safety_hash` set to the correct value.
///
/// An existing top-level `safety_hash = ...` line is replaced; otherwise
/// the line is prepended.
pub fn stamp_safety_hash(content: &str) -> Result<String, ConfigError> {
    let hash = safety_hash_of(content)?;
    let line = format!("{SAFETY_HASH_KEY} = \"{hash}\"");
    let mut replaced = false;
    let mut in_root = true;
    let mut out = Vec::new();
    for raw in content.lines() {
        let trimmed = raw.trim_start();
        if trimmed.starts_with('[') {
            in_root = false;
        }
        let is_hash_line = in_root
            && trimmed
                .strip_prefix(SAFETY_HASH_KEY)
                .is_some_and(|rest| rest.trim_start().starts_with('='));
        if is_hash_line && !replaced {
            out.push(line.clone());
            replaced = true;
        } else {
            out.push(raw.to_string());
        }
    }
    if !replaced {
        out.insert(0, line);
    }
    let mut stamped = out.join("\n");
    stamped.push('\n');
    Ok(stamped)
}

fn check_safety_hash(doc: &toml::Table) -> Result<HashCheck, ConfigError> {
    let expected = compute_safety_hash(doc)?;
    let found = match doc.get(SAFETY_HASH_KEY) {
        Some(toml::Value::String(s)) => s.trim().to_ascii_lowercase(),
        Some(other) => other.to_string(),
        None => return Err(ConfigError::MissingSafetyHash { expected }),
    };
    if found == SAFETY_HASH_BYPASS {
        warn!(expected = %expected, "configuration safety hash bypassed");
        return Ok(HashCheck::Bypassed { actual: expected });
    }
    if found != expected {
        return Err(ConfigError::SafetyHashMismatch { found, expected });
    }
    Ok(HashCheck::Verified)
}

// -----------------------------------------------------------------------
// Loading
// -----------------------------------------------------------------------

/// Parse and validate a lab configuration from TOML text.
pub fn parse_lab_config(content: &str) -> Result<LabConfig, ConfigError> {
    let doc: toml::Table = toml::from_str(content)?;
    let hash_check = check_safety_hash(&doc)?;
    let raw: RawLabConfig = toml::Value::Table(doc).try_into()?;
    validate(raw, hash_check)
}

/// Read, parse and validate a lab configuration file.
pub fn load_lab_config(path: &Path) -> Result<LabConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_lab_config(&content)
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn parse_endpoint(owner: &str, address: &str) -> Result<Endpoint, ConfigError> {
    address
        .parse::<Endpoint>()
        .map_err(|e| invalid(format!("{owner}: {e}")))
}

fn parse_index(owner: &str, key: &str) -> Result<u8, ConfigError> {
    key.parse::<u8>()
        .ok()
        .filter(|idx| *idx <= MAX_CHANNEL)
        .ok_or_else(|| invalid(format!("{owner}: channel key {key:?} is not an index in 0..={MAX_CHANNEL}")))
}

fn finite(owner: &str, what: &str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(invalid(format!("{owner}: {what} must be a finite number")))
    }
}

fn validate_channel(owner: &str, raw: RawChannel) -> Result<ChannelConfig, ConfigError> {
    let voltage = finite(owner, "voltage", raw.voltage)?;
    let current = finite(owner, "current", raw.current)?;
    let voltage_min = finite(owner, "voltage_min", raw.voltage_min.unwrap_or(0.0))?;
    let voltage_max = finite(owner, "voltage_max", raw.voltage_max.unwrap_or(voltage * 1.1))?;

    if voltage < 0.0 {
        return Err(invalid(format!("{owner}: voltage must not be negative")));
    }
    if current <= 0.0 {
        return Err(invalid(format!("{owner}: current limit must be positive")));
    }
    if !(voltage_min <= voltage && voltage <= voltage_max) {
        return Err(invalid(format!(
            "{owner}: voltage {voltage} outside its own bounds [{voltage_min}, {voltage_max}]"
        )));
    }

    Ok(ChannelConfig {
        voltage,
        current,
        voltage_min,
        voltage_max,
        enabled: raw.enabled,
        four_wire: raw.four_wire,
        measure: raw.measure,
        measure_voltage: raw.measure_voltage,
    })
}

fn validate_source(owner: &str, raw: RawSource) -> Result<SourceConfig, ConfigError> {
    let frequency = finite(owner, "frequency", raw.frequency)?;
    let high = finite(owner, "high", raw.high)?;
    let low = finite(owner, "low", raw.low)?;
    let duty = finite(owner, "duty", raw.duty)?;

    if frequency <= 0.0 {
        return Err(invalid(format!("{owner}: frequency must be positive")));
    }
    if high <= low {
        return Err(invalid(format!("{owner}: high level must exceed low level")));
    }
    if !(duty > 0.0 && duty < 100.0) {
        return Err(invalid(format!("{owner}: duty cycle must be within (0, 100)")));
    }

    Ok(SourceConfig {
        frequency,
        high,
        low,
        duty,
        waveform: raw.waveform,
        enabled: raw.enabled,
        leak_off: raw.leak_off,
    })
}

fn validate(raw: RawLabConfig, hash_check: HashCheck) -> Result<LabConfig, ConfigError> {
    if raw.dut.name.trim().is_empty() {
        return Err(invalid("dut.name must not be empty"));
    }

    let mut seen = BTreeSet::new();
    let all_names = raw
        .supplies
        .keys()
        .chain(raw.clocks.keys())
        .chain(raw.generic.keys());
    for name in all_names {
        if name.trim().is_empty() {
            return Err(invalid("instrument names must not be empty"));
        }
        if !seen.insert(name.clone()) {
            return Err(invalid(format!("instrument name {name:?} is used more than once")));
        }
    }
    if seen.is_empty() {
        return Err(invalid("no instruments configured"));
    }

    let mut supplies = BTreeMap::new();
    for (name, supply) in raw.supplies {
        let endpoint = parse_endpoint(&name, &supply.address)?;
        if supply.channels.is_empty() {
            return Err(invalid(format!("{name}: supply has no channels")));
        }
        if matches!(supply.reset_pin, Some(pin) if pin == 0 || pin > 8) {
            return Err(invalid(format!("{name}: reset_pin must be within 1..=8")));
        }
        let mut channels = BTreeMap::new();
        for (key, ch) in supply.channels {
            let idx = parse_index(&name, &key)?;
            let owner = format!("{name}.channels.{key}");
            channels.insert(idx, validate_channel(&owner, ch)?);
        }
        if channels.contains_key(&0) && channels.len() > 1 {
            return Err(invalid(format!(
                "{name}: channel 0 (single output) cannot be combined with numbered channels"
            )));
        }
        supplies.insert(
            name,
            SupplyConfig {
                endpoint,
                reset_pin: supply.reset_pin,
                pair_mode: supply.pair,
                channels,
            },
        );
    }

    let mut clocks = BTreeMap::new();
    for (name, clock) in raw.clocks {
        let endpoint = parse_endpoint(&name, &clock.address)?;
        if clock.sources.is_empty() {
            return Err(invalid(format!("{name}: generator has no sources")));
        }
        let mut sources = BTreeMap::new();
        for (key, src) in clock.sources {
            let idx = parse_index(&name, &key)?;
            if idx == 0 {
                return Err(invalid(format!("{name}: source numbering starts at 1")));
            }
            let owner = format!("{name}.sources.{key}");
            sources.insert(idx, validate_source(&owner, src)?);
        }
        clocks.insert(name, ClockConfig { endpoint, sources });
    }

    let mut generic = BTreeMap::new();
    for (name, g) in raw.generic {
        let endpoint = parse_endpoint(&name, &g.address)?;
        generic.insert(name, GenericConfig { endpoint });
    }

    if let Some(reset) = &raw.dut.reset {
        match supplies.get(reset) {
            Some(supply) if supply.reset_pin.is_some() => {}
            Some(_) => {
                return Err(invalid(format!(
                    "dut.reset names {reset:?}, which has no reset_pin"
                )));
            }
            None => {
                return Err(invalid(format!(
                    "dut.reset names {reset:?}, which is not a configured supply"
                )));
            }
        }
    }

    let defaults = TimingConfig::default();
    let timing = TimingConfig {
        reset_pulse: ms_or(raw.timing.reset_pulse_ms, defaults.reset_pulse),
        post_reset: ms_or(raw.timing.post_reset_ms, defaults.post_reset),
        power_settle: ms_or(raw.timing.power_settle_ms, defaults.power_settle),
        standby_wait: ms_or(raw.timing.standby_wait_ms, defaults.standby_wait),
        leak_wait: ms_or(raw.timing.leak_wait_ms, defaults.leak_wait),
        drain_grace: ms_or(raw.timing.drain_grace_ms, defaults.drain_grace),
    };

    let retry_defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        max_attempts: raw.retry.max_attempts.unwrap_or(retry_defaults.max_attempts),
        initial_backoff: ms_or(raw.retry.initial_backoff_ms, retry_defaults.initial_backoff),
        max_backoff: ms_or(raw.retry.max_backoff_ms, retry_defaults.max_backoff),
        io_timeout: ms_or(raw.retry.io_timeout_ms, retry_defaults.io_timeout),
    };
    if retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be at least 1"));
    }
    if retry.io_timeout.is_zero() {
        return Err(invalid("retry.io_timeout_ms must be positive"));
    }

    let dispatch = DispatchConfig {
        command_timeout: ms_or(
            raw.dispatch.command_timeout_ms,
            DispatchConfig::default().command_timeout,
        ),
    };
    if dispatch.command_timeout.is_zero() {
        return Err(invalid("dispatch.command_timeout_ms must be positive"));
    }

    Ok(LabConfig {
        dut: DutConfig {
            name: raw.dut.name,
            reset: raw.dut.reset,
        },
        supplies,
        clocks,
        generic,
        timing,
        retry,
        dispatch,
        hash_check,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"
[dut]
name = "chip0"
reset = "psu0"

[supplies.psu0]
address = "10.0.0.10:5025"
reset_pin = 1

[supplies.psu0.channels.1]
voltage = 0.8
current = 0.2
measure = true
measure_voltage = true

[supplies.psu0.channels.2]
voltage = 1.8
current = 0.1
four_wire = true

[clocks.gen0]
address = "10.0.0.20"

[clocks.gen0.sources.1]
frequency = 25e6
high = 0.8
low = 0.0
leak_off = true

[timing]
reset_pulse_ms = 10
"#;

    fn stamped() -> String {
        stamp_safety_hash(BODY).unwrap()
    }

    #[test]
    fn parse_valid_config() {
        let cfg = parse_lab_config(&stamped()).unwrap();
        assert_eq!(cfg.hash_check, HashCheck::Verified);
        assert_eq!(cfg.dut.name, "chip0");
        assert_eq!(cfg.dut.reset.as_deref(), Some("psu0"));

        let psu = &cfg.supplies["psu0"];
        assert_eq!(psu.endpoint, Endpoint::new("10.0.0.10", 5025));
        assert_eq!(psu.reset_pin, Some(1));
        let ch1 = &psu.channels[&1];
        assert!(ch1.measure && ch1.measure_voltage && ch1.enabled);
        assert!((ch1.voltage_max - 0.88).abs() < 1e-9);
        assert!(psu.channels[&2].four_wire);

        let gen0 = &cfg.clocks["gen0"];
        assert_eq!(gen0.endpoint.port, 5025);
        assert_eq!(gen0.sources[&1].duty, 50.0);
        assert_eq!(gen0.sources[&1].waveform, Waveform::Square);

        assert_eq!(cfg.timing.reset_pulse, Duration::from_millis(10));
        assert_eq!(cfg.timing.post_reset, Duration::from_millis(100));
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.instrument_names(), vec!["gen0", "psu0"]);
        assert_eq!(cfg.leak_off_sources(), vec![("gen0".to_string(), 1)]);
    }

    #[test]
    fn legacy_key_names_are_accepted() {
        let legacy = BODY
            .replace("reset_pin = 1", "reset_gpio = 1\nopmode = \"series\"")
            .replace("four_wire = true", "four_wire = true\nactive = false")
            .replace("leak_off = true", "leak_off = true\nshape = \"sine\"");
        let cfg = parse_lab_config(&stamp_safety_hash(&legacy).unwrap()).unwrap();

        let psu = &cfg.supplies["psu0"];
        assert_eq!(psu.reset_pin, Some(1));
        assert_eq!(psu.pair_mode, PairMode::Series);
        assert!(!psu.channels[&2].enabled);
        assert_eq!(cfg.clocks["gen0"].sources[&1].waveform, Waveform::Sine);
        assert_eq!(cfg.dut.reset.as_deref(), Some("psu0"));
    }

    #[test]
    fn duplicate_key_spellings_are_rejected() {
        let both = BODY.replace("reset_pin = 1", "reset_pin = 1\nreset_gpio = 2");
        assert!(parse_lab_config(&stamp_safety_hash(&both).unwrap()).is_err());
    }

    #[test]
    fn hash_ignores_formatting_and_comments() {
        let reformatted = BODY.replace("voltage = 0.8", "voltage   =   0.8   # core");
        assert_eq!(safety_hash_of(BODY).unwrap(), safety_hash_of(&reformatted).unwrap());
    }

    #[test]
    fn hash_changes_with_values() {
        let changed = BODY.replace("voltage = 0.8", "voltage = 0.85");
        assert_ne!(safety_hash_of(BODY).unwrap(), safety_hash_of(&changed).unwrap());
    }

    #[test]
    fn tampered_value_is_refused() {
        let tampered = stamped().replace("voltage = 1.8", "voltage = 3.3");
        let err = parse_lab_config(&tampered).unwrap_err();
        assert!(
            matches!(err, ConfigError::SafetyHashMismatch { .. }),
            "expected SafetyHashMismatch, got: {err}"
        );
    }

    #[test]
    fn missing_hash_reports_expected_value() {
        let err = parse_lab_config(BODY).unwrap_err();
        match err {
            ConfigError::MissingSafetyHash { expected } => {
                assert_eq!(expected, safety_hash_of(BODY).unwrap());
                assert_eq!(expected.len(), 16);
            }
            other => panic!("expected MissingSafetyHash, got: {other}"),
        }
    }

    #[test]
    fn bypass_value_is_accepted() {
        let text = format!("{SAFETY_HASH_KEY} = \"{SAFETY_HASH_BYPASS}\"\n{BODY}");
        let cfg = parse_lab_config(&text).unwrap();
        assert!(matches!(cfg.hash_check, HashCheck::Bypassed { .. }));
    }

    #[test]
    fn restamp_replaces_existing_hash() {
        let once = stamped();
        let twice = stamp_safety_hash(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.matches(SAFETY_HASH_KEY).count(), 1);
    }

    fn expect_invalid(body: &str, needle: &str) {
        let text = stamp_safety_hash(body).unwrap();
        match parse_lab_config(&text) {
            Err(ConfigError::Invalid(msg)) => {
                assert!(msg.contains(needle), "message {msg:?} lacks {needle:?}")
            }
            Err(other) => panic!("expected Invalid, got: {other}"),
            Ok(_) => panic!("expected Invalid containing {needle:?}"),
        }
    }

    #[test]
    fn voltage_outside_own_bounds_rejected() {
        expect_invalid(
            &BODY.replace("voltage = 0.8", "voltage = 0.8\nvoltage_max = 0.5"),
            "outside its own bounds",
        );
    }

    #[test]
    fn reset_on_supply_without_pin_rejected() {
        expect_invalid(&BODY.replace("reset_pin = 1\n", ""), "no reset_pin");
    }

    #[test]
    fn reset_on_unknown_supply_rejected() {
        expect_invalid(
            &BODY.replace("reset = \"psu0\"", "reset = \"psu9\""),
            "not a configured supply",
        );
    }

    #[test]
    fn duplicate_names_across_tables_rejected() {
        let body = format!("{BODY}\n[generic.psu0]\naddress = \"10.0.0.30\"\n");
        expect_invalid(&body, "more than once");
    }

    #[test]
    fn bad_channel_key_rejected() {
        expect_invalid(
            &BODY.replace("[supplies.psu0.channels.2]", "[supplies.psu0.channels.x]"),
            "channel key",
        );
    }

    #[test]
    fn bad_duty_rejected() {
        expect_invalid(&BODY.replace("leak_off = true", "duty = 100"), "duty cycle");
    }

    #[test]
    fn unknown_field_is_a_toml_error() {
        let text = stamp_safety_hash(&BODY.replace("four_wire = true", "four_wires = true")).unwrap();
        assert!(matches!(parse_lab_config(&text), Err(ConfigError::Toml(_))));
    }
}
