//! Instrument registry -- the single owner of every configured instrument.
//!
//! Callers never hold a driver directly. Each operation looks an instrument
//! up by name, takes its lock for the duration of the call (including any
//! retries), and returns plain values. Two callers touching the same
//! instrument are therefore serialized, while different instruments can be
//! driven concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::LabConfig;
use crate::instrument::retry::RetryPolicy;
use crate::instrument::{
    Capability, CapabilitySet, GenericScpi, Instrument, InstrumentError, InstrumentKind,
    InstrumentState, Measurement, Metric, PowerSupply, Setting, SignalGenerator, TransportFactory,
};

/// Await `$call` again for as long as it fails transiently and the policy
/// allows. `$call` is re-evaluated on every attempt.
macro_rules! retrying {
    ($policy:expr, $label:expr, $call:expr) => {{
        let mut backoff = $policy.backoff($label);
        loop {
            match $call.await {
                Err(err) if backoff.retry(&err).await => continue,
                other => break other,
            }
        }
    }};
}

const ASSERT_RESET: Setting = Setting::ResetLine { asserted: true };
const RELEASE_RESET: Setting = Setting::ResetLine { asserted: false };

/// Timing of one reset pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTiming {
    /// How long the line is held asserted.
    pub pulse: Duration,
    /// Delay after release before the line is verified.
    pub settle: Duration,
}

/// One value read by [`InstrumentRegistry::measure_flagged`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub instrument: String,
    pub metric: Metric,
    pub measurement: Measurement,
}

/// Nest readings as `{instrument: {channel: {metric: value}}}`, the layout
/// written to `measurements.json`.
pub fn readings_to_json(readings: &[Reading]) -> serde_json::Value {
    let mut doc: BTreeMap<&str, BTreeMap<String, BTreeMap<&str, f64>>> = BTreeMap::new();
    for reading in readings {
        let channel = reading.metric.channel().unwrap_or(0).to_string();
        doc.entry(reading.instrument.as_str())
            .or_default()
            .entry(channel)
            .or_default()
            .insert(reading.metric.short_name(), reading.measurement.value);
    }
    serde_json::json!(doc)
}

struct Entry {
    kind: InstrumentKind,
    capabilities: CapabilitySet,
    default_channel: u8,
    endpoint: String,
    instrument: Arc<Mutex<Box<dyn Instrument>>>,
}

/// A collection of [`Instrument`] drivers keyed by configured name.
#[derive(Default)]
pub struct InstrumentRegistry {
    entries: HashMap<String, Entry>,
    retry: RetryPolicy,
}

impl InstrumentRegistry {
    /// Create an empty registry using `retry` for every call.
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            retry,
        }
    }

    /// Build drivers for every instrument in `config`.
    pub fn from_config(config: &LabConfig, factory: &dyn TransportFactory) -> Self {
        let timeout = config.retry.io_timeout;
        let mut registry = Self::new(config.retry);
        for (name, supply) in &config.supplies {
            let transport = factory.connect(name, &supply.endpoint, timeout);
            registry.register(PowerSupply::new(name.clone(), supply.clone(), transport));
        }
        for (name, clock) in &config.clocks {
            let transport = factory.connect(name, &clock.endpoint, timeout);
            registry.register(SignalGenerator::new(name.clone(), clock.clone(), transport));
        }
        for (name, generic) in &config.generic {
            let transport = factory.connect(name, &generic.endpoint, timeout);
            registry.register(GenericScpi::new(name.clone(), transport));
        }
        info!(instruments = registry.len(), "instrument registry ready");
        registry
    }

    /// Register an instrument under [`Instrument::name`].
    ///
    /// Returns `true` if an instrument with the same name was replaced.
    pub fn register(&mut self, instrument: impl Instrument + 'static) -> bool {
        self.register_boxed(Box::new(instrument))
    }

    pub fn register_boxed(&mut self, instrument: Box<dyn Instrument>) -> bool {
        let name = instrument.name().to_string();
        let entry = Entry {
            kind: instrument.kind(),
            capabilities: instrument.capabilities(),
            default_channel: instrument.default_channel(),
            endpoint: instrument.endpoint(),
            instrument: Arc::new(Mutex::new(instrument)),
        };
        self.entries.insert(name, entry).is_some()
    }

    /// Names of all registered instruments, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn kind(&self, name: &str) -> Result<InstrumentKind, InstrumentError> {
        self.entry(name).map(|e| e.kind)
    }

    pub fn capabilities(&self, name: &str) -> Result<CapabilitySet, InstrumentError> {
        self.entry(name).map(|e| e.capabilities)
    }

    pub fn endpoint(&self, name: &str) -> Result<String, InstrumentError> {
        self.entry(name).map(|e| e.endpoint.clone())
    }

    /// Channel used when a command does not name one.
    pub fn default_channel(&self, name: &str) -> Result<u8, InstrumentError> {
        self.entry(name).map(|e| e.default_channel)
    }

    /// Names of instruments offering `capability`, sorted.
    pub fn with_capability(&self, capability: Capability) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.capabilities.contains(capability))
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    fn entry(&self, name: &str) -> Result<&Entry, InstrumentError> {
        self.entries
            .get(name)
            .ok_or_else(|| InstrumentError::UnknownInstrument(name.to_string()))
    }

    fn require(&self, name: &str, capability: Capability) -> Result<&Entry, InstrumentError> {
        let entry = self.entry(name)?;
        if entry.capabilities.contains(capability) {
            Ok(entry)
        } else {
            Err(InstrumentError::UnsupportedCapability {
                instrument: name.to_string(),
                capability,
            })
        }
    }

    // -----------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------

    /// Apply `settings` in order while holding the instrument's lock.
    ///
    /// Every setting is checked against the capability set before any of
    /// them is sent, so an unsupported request leaves the instrument
    /// untouched.
    pub async fn configure(&self, name: &str, settings: &[Setting]) -> Result<(), InstrumentError> {
        let entry = self.entry(name)?;
        for setting in settings {
            self.require(name, setting.capability())?;
        }
        let mut guard = entry.instrument.lock().await;
        for setting in settings {
            debug!(instrument = name, %setting, "configure");
            retrying!(self.retry, name, guard.apply(setting))?;
        }
        Ok(())
    }

    /// Read one metric.
    pub async fn query(&self, name: &str, metric: Metric) -> Result<Measurement, InstrumentError> {
        let entry = self.require(name, metric.capability())?;
        let mut guard = entry.instrument.lock().await;
        retrying!(self.retry, name, guard.measure(metric))
    }

    /// Assert the reset line, hold it for `timing.pulse`, release it, wait
    /// `timing.settle`, then verify the line reads released.
    ///
    /// The whole pulse happens under one lock so no other command can slip
    /// in between assert and release.
    pub async fn reset_cycle(&self, name: &str, timing: ResetTiming) -> Result<(), InstrumentError> {
        let entry = self.require(name, Capability::Reset)?;
        let mut guard = entry.instrument.lock().await;
        info!(instrument = name, pulse_ms = timing.pulse.as_millis() as u64, "reset pulse");

        retrying!(self.retry, name, guard.apply(&ASSERT_RESET))?;
        tokio::time::sleep(timing.pulse).await;
        retrying!(self.retry, name, guard.apply(&RELEASE_RESET))?;
        tokio::time::sleep(timing.settle).await;
        self.verify_released(name, &mut **guard).await
    }

    /// Read the reset line back; re-drive the release if it is not high.
    async fn verify_released(
        &self,
        name: &str,
        instrument: &mut dyn Instrument,
    ) -> Result<(), InstrumentError> {
        let mut backoff = self.retry.backoff(name);
        loop {
            let attempt = match instrument.measure(Metric::ResetLine).await {
                Ok(level) if level.value >= 0.5 => return Ok(()),
                Ok(_) => match instrument.apply(&RELEASE_RESET).await {
                    Ok(()) => Err(InstrumentError::ResetNotReleased {
                        instrument: name.to_string(),
                    }),
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            match attempt {
                Err(err) if backoff.retry(&err).await => continue,
                other => return other,
            }
        }
    }

    /// Drive the reset line to a level without pulsing it.
    pub async fn set_reset(&self, name: &str, asserted: bool) -> Result<(), InstrumentError> {
        self.configure(name, &[Setting::ResetLine { asserted }]).await
    }

    /// Push the configured profile to the instrument.
    pub async fn apply_profile(&self, name: &str, enable_outputs: bool) -> Result<(), InstrumentError> {
        let entry = self.entry(name)?;
        let mut guard = entry.instrument.lock().await;
        retrying!(self.retry, name, guard.apply_profile(enable_outputs))
    }

    pub async fn outputs_off(&self, name: &str) -> Result<(), InstrumentError> {
        let entry = self.entry(name)?;
        let mut guard = entry.instrument.lock().await;
        retrying!(self.retry, name, guard.outputs_off())
    }

    pub async fn restore_defaults(&self, name: &str) -> Result<(), InstrumentError> {
        let entry = self.entry(name)?;
        let mut guard = entry.instrument.lock().await;
        retrying!(self.retry, name, guard.restore_defaults())
    }

    pub async fn identify(&self, name: &str) -> Result<String, InstrumentError> {
        let entry = self.entry(name)?;
        let mut guard = entry.instrument.lock().await;
        retrying!(self.retry, name, guard.identify())
    }

    /// Copy of the instrument's last commanded state.
    pub async fn snapshot(&self, name: &str) -> Result<InstrumentState, InstrumentError> {
        let entry = self.entry(name)?;
        let guard = entry.instrument.lock().await;
        Ok(guard.state())
    }

    /// Snapshots of every instrument, keyed by name.
    pub async fn snapshot_all(&self) -> BTreeMap<String, InstrumentState> {
        let mut all = BTreeMap::new();
        for name in self.names() {
            if let Ok(state) = self.snapshot(&name).await {
                all.insert(name, state);
            }
        }
        all
    }

    /// Measure every flagged supply channel.
    ///
    /// `instrument` restricts the sweep to one supply; `channel` restricts
    /// it to one channel, which is then measured even if not flagged.
    pub async fn measure_flagged(
        &self,
        instrument: Option<&str>,
        channel: Option<u8>,
    ) -> Result<Vec<Reading>, InstrumentError> {
        let names = match instrument {
            Some(name) => {
                self.require(name, Capability::Power)?;
                vec![name.to_string()]
            }
            None => self.with_capability(Capability::Power),
        };

        let mut readings = Vec::new();
        for name in names {
            let entry = self.entry(&name)?;
            let mut guard = entry.instrument.lock().await;
            let plan = guard.measurement_plan(channel);
            if let (Some(_), Some(ch), true) = (instrument, channel, plan.is_empty()) {
                return Err(InstrumentError::UnknownChannel {
                    instrument: name,
                    channel: ch,
                });
            }
            for metric in plan {
                let measurement = retrying!(self.retry, &name, guard.measure(metric))?;
                readings.push(Reading {
                    instrument: name.clone(),
                    metric,
                    measurement,
                });
            }
        }
        Ok(readings)
    }
}

impl std::fmt::Debug for InstrumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentRegistry")
            .field("instruments", &self.names())
            .field("retry", &self.retry)
            .finish()
    }
}
