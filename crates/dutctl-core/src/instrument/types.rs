//! Value types shared by every instrument driver: capabilities, settings,
//! metrics, measurements and cached state snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default TCP port for raw SCPI sockets.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Highest channel / source index accepted anywhere in the system.
pub const MAX_CHANNEL: u8 = 16;

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A functional capability an instrument may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Power,
    Clock,
    Reset,
}

impl Capability {
    const ALL: [Capability; 3] = [Capability::Power, Capability::Clock, Capability::Reset];

    fn bit(self) -> u8 {
        match self {
            Capability::Power => 0b001,
            Capability::Clock => 0b010,
            Capability::Reset => 0b100,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Power => "power",
            Capability::Clock => "clock",
            Capability::Reset => "reset",
        };
        f.write_str(s)
    }
}

/// Closed set of capabilities, fixed when an instrument is constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet {
    bits: u8,
}

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.bits |= capability.bit();
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.bits & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<String> = self.iter().map(|c| c.to_string()).collect();
        f.write_str(&names.join("+"))
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

// ---------------------------------------------------------------------------
// InstrumentKind
// ---------------------------------------------------------------------------

/// The driver family an instrument belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    PowerSupply,
    SignalGenerator,
    Generic,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstrumentKind::PowerSupply => "power_supply",
            InstrumentKind::SignalGenerator => "signal_generator",
            InstrumentKind::Generic => "generic",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Network address of a SCPI instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error returned when an endpoint string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEndpointError(pub String);

impl fmt::Display for ParseEndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid instrument address: {:?}", self.0)
    }
}

impl std::error::Error for ParseEndpointError {}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    /// Accepts `host` or `host:port`; the port defaults to
    /// [`DEFAULT_SCPI_PORT`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ParseEndpointError(s.to_string()))?;
                (host, port)
            }
            None => (s, DEFAULT_SCPI_PORT),
        };
        if host.is_empty() || port == 0 {
            return Err(ParseEndpointError(s.to_string()));
        }
        Ok(Endpoint::new(host, port))
    }
}

// ---------------------------------------------------------------------------
// Waveform / pairing
// ---------------------------------------------------------------------------

/// Output function of a signal generator source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    #[default]
    Square,
    Sine,
    Triangle,
    Ramp,
    Noise,
}

impl Waveform {
    /// SCPI mnemonic for `SOURce:FUNCtion`.
    pub fn scpi(&self) -> &'static str {
        match self {
            Waveform::Square => "SQU",
            Waveform::Sine => "SIN",
            Waveform::Triangle => "TRI",
            Waveform::Ramp => "RAMP",
            Waveform::Noise => "NRAN",
        }
    }
}

/// Channel pairing mode of a multi-output supply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairMode {
    #[default]
    Off,
    Parallel,
    Series,
}

impl PairMode {
    pub fn scpi(&self) -> &'static str {
        match self {
            PairMode::Off => "OFF",
            PairMode::Parallel => "PAR",
            PairMode::Series => "SER",
        }
    }
}

// ---------------------------------------------------------------------------
// Setting
// ---------------------------------------------------------------------------

/// Which level of a clock source a [`Setting::Level`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelEdge {
    High,
    Low,
}

/// A single typed change to an instrument's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "setting", rename_all = "snake_case")]
pub enum Setting {
    Voltage { channel: u8, volts: f64 },
    CurrentLimit { channel: u8, amps: f64 },
    Output { channel: u8, enabled: bool },
    Frequency { source: u8, hertz: f64 },
    Level { source: u8, edge: LevelEdge, volts: f64 },
    Duty { source: u8, percent: f64 },
    ClockOutput { source: u8, enabled: bool },
    ResetLine { asserted: bool },
}

impl Setting {
    /// The capability an instrument must offer to accept this setting.
    pub fn capability(&self) -> Capability {
        match self {
            Setting::Voltage { .. } | Setting::CurrentLimit { .. } | Setting::Output { .. } => {
                Capability::Power
            }
            Setting::Frequency { .. }
            | Setting::Level { .. }
            | Setting::Duty { .. }
            | Setting::ClockOutput { .. } => Capability::Clock,
            Setting::ResetLine { .. } => Capability::Reset,
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::Voltage { channel, volts } => write!(f, "ch{channel} voltage={volts}V"),
            Setting::CurrentLimit { channel, amps } => write!(f, "ch{channel} current={amps}A"),
            Setting::Output { channel, enabled } => write!(f, "ch{channel} output={enabled}"),
            Setting::Frequency { source, hertz } => write!(f, "src{source} frequency={hertz}Hz"),
            Setting::Level {
                source,
                edge,
                volts,
            } => {
                let edge = match edge {
                    LevelEdge::High => "high",
                    LevelEdge::Low => "low",
                };
                write!(f, "src{source} {edge}={volts}V")
            }
            Setting::Duty { source, percent } => write!(f, "src{source} duty={percent}%"),
            Setting::ClockOutput { source, enabled } => {
                write!(f, "src{source} output={enabled}")
            }
            Setting::ResetLine { asserted } => write!(f, "reset asserted={asserted}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Metric / Measurement
// ---------------------------------------------------------------------------

/// Physical unit of a [`Measurement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Volt,
    Ampere,
    Hertz,
    Logic,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Hertz => "Hz",
            Unit::Logic => "",
        }
    }
}

/// A quantity that can be read back from an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum Metric {
    Voltage { channel: u8 },
    Current { channel: u8 },
    VoltageSetpoint { channel: u8 },
    CurrentSetpoint { channel: u8 },
    Frequency { source: u8 },
    /// Logic level of the reset line: 1 when released, 0 when asserted.
    ResetLine,
}

impl Metric {
    pub fn capability(&self) -> Capability {
        match self {
            Metric::Voltage { .. }
            | Metric::Current { .. }
            | Metric::VoltageSetpoint { .. }
            | Metric::CurrentSetpoint { .. } => Capability::Power,
            Metric::Frequency { .. } => Capability::Clock,
            Metric::ResetLine => Capability::Reset,
        }
    }

    pub fn unit(&self) -> Unit {
        match self {
            Metric::Voltage { .. } | Metric::VoltageSetpoint { .. } => Unit::Volt,
            Metric::Current { .. } | Metric::CurrentSetpoint { .. } => Unit::Ampere,
            Metric::Frequency { .. } => Unit::Hertz,
            Metric::ResetLine => Unit::Logic,
        }
    }

    /// Short name used in journal records and result files.
    pub fn short_name(&self) -> &'static str {
        match self {
            Metric::Voltage { .. } => "vol",
            Metric::Current { .. } => "cur",
            Metric::VoltageSetpoint { .. } => "vset",
            Metric::CurrentSetpoint { .. } => "iset",
            Metric::Frequency { .. } => "freq",
            Metric::ResetLine => "reset",
        }
    }

    /// Channel or source index the metric addresses, if any.
    pub fn channel(&self) -> Option<u8> {
        match self {
            Metric::Voltage { channel }
            | Metric::Current { channel }
            | Metric::VoltageSetpoint { channel }
            | Metric::CurrentSetpoint { channel } => Some(*channel),
            Metric::Frequency { source } => Some(*source),
            Metric::ResetLine => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel() {
            Some(ch) => write!(f, "{}@{ch}", self.short_name()),
            None => f.write_str(self.short_name()),
        }
    }
}

/// A value read from an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub unit: Unit,
}

impl Measurement {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.symbol())
    }
}

// ---------------------------------------------------------------------------
// Cached state snapshots
// ---------------------------------------------------------------------------

/// Last commanded state of one supply channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupplyChannelState {
    pub volts: f64,
    pub amps: f64,
    pub output: bool,
    pub four_wire: bool,
}

/// Last commanded state of one signal generator source.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceState {
    pub hertz: f64,
    pub high: f64,
    pub low: f64,
    pub duty: f64,
    pub waveform: Waveform,
    pub output: bool,
}

/// Copy of an instrument's last-known state. Never a live reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstrumentState {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub supply: BTreeMap<u8, SupplyChannelState>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub sources: BTreeMap<u8, SourceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_asserted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair_mode: Option<PairMode>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_set_membership() {
        let caps = CapabilitySet::empty()
            .with(Capability::Power)
            .with(Capability::Reset);
        assert!(caps.contains(Capability::Power));
        assert!(caps.contains(Capability::Reset));
        assert!(!caps.contains(Capability::Clock));
        assert_eq!(caps.to_string(), "power+reset");
        assert_eq!(CapabilitySet::empty().to_string(), "none");
    }

    #[test]
    fn capability_set_serializes_as_list() {
        let caps: CapabilitySet = [Capability::Clock].into_iter().collect();
        assert_eq!(serde_json::to_string(&caps).unwrap(), r#"["clock"]"#);
    }

    #[test]
    fn settings_map_to_capabilities() {
        assert_eq!(
            Setting::Voltage {
                channel: 1,
                volts: 0.8
            }
            .capability(),
            Capability::Power
        );
        assert_eq!(
            Setting::Duty {
                source: 1,
                percent: 50.0
            }
            .capability(),
            Capability::Clock
        );
        assert_eq!(
            Setting::ResetLine { asserted: true }.capability(),
            Capability::Reset
        );
    }

    #[test]
    fn metric_units_and_names() {
        let m = Metric::Current { channel: 2 };
        assert_eq!(m.unit(), Unit::Ampere);
        assert_eq!(m.to_string(), "cur@2");
        assert_eq!(Metric::ResetLine.to_string(), "reset");
        assert_eq!(Metric::ResetLine.capability(), Capability::Reset);
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            "10.0.0.5:5025".parse::<Endpoint>().unwrap(),
            Endpoint::new("10.0.0.5", 5025)
        );
        assert_eq!(
            "psu.lab".parse::<Endpoint>().unwrap(),
            Endpoint::new("psu.lab", DEFAULT_SCPI_PORT)
        );
        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!(":5025".parse::<Endpoint>().is_err());
        assert!("host:0".parse::<Endpoint>().is_err());
    }
}
