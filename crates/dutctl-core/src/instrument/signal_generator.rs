//! Function/arbitrary waveform generator driver, used as the DUT clock.

use async_trait::async_trait;
use tracing::debug;

use super::error::InstrumentError;
use super::trait_def::Instrument;
use super::transport::{ScpiTransport, parse_number};
use super::types::{
    Capability, CapabilitySet, InstrumentKind, InstrumentState, LevelEdge, Measurement, Metric,
    Setting, SourceState, Waveform,
};
use crate::config::{ClockConfig, SourceConfig};

/// Output levels accepted by typical bench generators, in volts.
pub const LEVEL_LIMIT: f64 = 20.0;

/// Highest frequency accepted, in hertz.
pub const MAX_FREQUENCY: f64 = 1e9;

pub struct SignalGenerator {
    name: String,
    config: ClockConfig,
    transport: Box<dyn ScpiTransport>,
    state: InstrumentState,
}

impl SignalGenerator {
    pub fn new(name: impl Into<String>, config: ClockConfig, transport: Box<dyn ScpiTransport>) -> Self {
        let mut driver = Self {
            name: name.into(),
            config,
            transport,
            state: InstrumentState::default(),
        };
        driver.state = driver.power_on_state();
        driver
    }

    fn power_on_state(&self) -> InstrumentState {
        InstrumentState {
            sources: self
                .config
                .sources
                .keys()
                .map(|s| (*s, SourceState::default()))
                .collect(),
            ..InstrumentState::default()
        }
    }

    fn source_config(&self, source: u8) -> Result<&SourceConfig, InstrumentError> {
        self.config
            .sources
            .get(&source)
            .ok_or_else(|| InstrumentError::UnknownChannel {
                instrument: self.name.clone(),
                channel: source,
            })
    }

    fn unsupported(&self, capability: Capability) -> InstrumentError {
        InstrumentError::UnsupportedCapability {
            instrument: self.name.clone(),
            capability,
        }
    }

    fn out_of_range(&self, what: &'static str, value: f64, min: f64, max: f64) -> InstrumentError {
        InstrumentError::OutOfRange {
            instrument: self.name.clone(),
            what,
            value,
            min,
            max,
        }
    }

    fn source_state(&mut self, source: u8) -> &mut SourceState {
        self.state.sources.entry(source).or_default()
    }

    async fn set_frequency(&mut self, source: u8, hertz: f64) -> Result<(), InstrumentError> {
        self.transport
            .write(&format!("SOURCE{source}:FREQUENCY {hertz}"))
            .await?;
        self.source_state(source).hertz = hertz;
        Ok(())
    }

    async fn set_level(&mut self, source: u8, edge: LevelEdge, volts: f64) -> Result<(), InstrumentError> {
        let which = match edge {
            LevelEdge::High => "HIGH",
            LevelEdge::Low => "LOW",
        };
        self.transport
            .write(&format!("SOURCE{source}:VOLTAGE:{which} {volts}"))
            .await?;
        let state = self.source_state(source);
        match edge {
            LevelEdge::High => state.high = volts,
            LevelEdge::Low => state.low = volts,
        }
        Ok(())
    }

    async fn set_waveform(&mut self, source: u8, waveform: Waveform) -> Result<(), InstrumentError> {
        self.transport
            .write(&format!("SOURCE{source}:FUNCTION {}", waveform.scpi()))
            .await?;
        self.source_state(source).waveform = waveform;
        Ok(())
    }

    async fn set_duty(&mut self, source: u8, percent: f64) -> Result<(), InstrumentError> {
        self.transport
            .write(&format!("SOURCE{source}:FUNCTION:SQUARE:DCYCLE {percent}"))
            .await?;
        self.source_state(source).duty = percent;
        Ok(())
    }

    async fn set_output(&mut self, source: u8, enabled: bool) -> Result<(), InstrumentError> {
        let on = if enabled { "ON" } else { "OFF" };
        self.transport.write(&format!("OUTPUT{source} {on}")).await?;
        self.source_state(source).output = enabled;
        Ok(())
    }
}

#[async_trait]
impl Instrument for SignalGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> InstrumentKind {
        InstrumentKind::SignalGenerator
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::empty().with(Capability::Clock)
    }

    fn endpoint(&self) -> String {
        self.transport.describe()
    }

    fn default_channel(&self) -> u8 {
        self.config.sources.keys().next().copied().unwrap_or(1)
    }

    async fn apply(&mut self, setting: &Setting) -> Result<(), InstrumentError> {
        match *setting {
            Setting::Frequency { source, hertz } => {
                self.source_config(source)?;
                if !(hertz > 0.0 && hertz <= MAX_FREQUENCY) {
                    return Err(self.out_of_range("frequency", hertz, 0.0, MAX_FREQUENCY));
                }
                debug!(instrument = %self.name, source, hertz, "set frequency");
                self.set_frequency(source, hertz).await
            }
            Setting::Level {
                source,
                edge,
                volts,
            } => {
                self.source_config(source)?;
                if !(-LEVEL_LIMIT..=LEVEL_LIMIT).contains(&volts) {
                    return Err(self.out_of_range("level", volts, -LEVEL_LIMIT, LEVEL_LIMIT));
                }
                self.set_level(source, edge, volts).await
            }
            Setting::Duty { source, percent } => {
                self.source_config(source)?;
                if !(percent > 0.0 && percent < 100.0) {
                    return Err(self.out_of_range("duty", percent, 0.0, 100.0));
                }
                self.set_duty(source, percent).await
            }
            Setting::ClockOutput { source, enabled } => {
                self.source_config(source)?;
                self.set_output(source, enabled).await
            }
            _ => Err(self.unsupported(setting.capability())),
        }
    }

    async fn measure(&mut self, metric: Metric) -> Result<Measurement, InstrumentError> {
        match metric {
            Metric::Frequency { source } => {
                self.source_config(source)?;
                let cmd = format!("SOURCE{source}:FREQUENCY?");
                let reply = self.transport.query(&cmd).await?;
                let hertz = parse_number(&self.transport.describe(), &cmd, &reply)?;
                Ok(Measurement::new(hertz, metric.unit()))
            }
            other => Err(self.unsupported(other.capability())),
        }
    }

    async fn apply_profile(&mut self, enable_outputs: bool) -> Result<(), InstrumentError> {
        debug!(instrument = %self.name, enable_outputs, "applying generator profile");
        let sources: Vec<(u8, SourceConfig)> = self
            .config
            .sources
            .iter()
            .map(|(s, cfg)| (*s, cfg.clone()))
            .collect();
        for (source, cfg) in sources {
            self.set_waveform(source, cfg.waveform).await?;
            self.set_frequency(source, cfg.frequency).await?;
            // Raise the high level first so high > low holds at every step.
            self.set_level(source, LevelEdge::High, cfg.high).await?;
            self.set_level(source, LevelEdge::Low, cfg.low).await?;
            if cfg.waveform == Waveform::Square {
                self.set_duty(source, cfg.duty).await?;
            }
            if enable_outputs && cfg.enabled {
                self.set_output(source, true).await?;
            }
        }
        Ok(())
    }

    async fn outputs_off(&mut self) -> Result<(), InstrumentError> {
        let sources: Vec<u8> = self.config.sources.keys().copied().collect();
        for source in sources {
            self.set_output(source, false).await?;
        }
        Ok(())
    }

    async fn restore_defaults(&mut self) -> Result<(), InstrumentError> {
        self.transport.write("*RST").await?;
        self.state = self.power_on_state();
        Ok(())
    }

    async fn identify(&mut self) -> Result<String, InstrumentError> {
        self.transport.query("*IDN?").await
    }

    fn measurement_plan(&self, _channel: Option<u8>) -> Vec<Metric> {
        Vec::new()
    }

    fn state(&self) -> InstrumentState {
        self.state.clone()
    }
}
