//! Host-side lab actions: the power/reset cycle and the measurements taken
//! around it.
//!
//! These run both inside a session (power cycling and power-down) and as
//! one-shot CLI actions.

use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::LabConfig;
use crate::instrument::{InstrumentError, Metric, Setting};
use crate::journal::{Journal, JournalEvent, MeasurementRecord};
use crate::registry::{InstrumentRegistry, Reading, ResetTiming, readings_to_json};

/// Result key of the measurement taken after power-up.
pub const STANDBY_KEY: &str = "_standby";

/// Result key of the leakage measurement.
pub const LEAK_KEY: &str = "_leak";

/// Lab actions bound to one configuration, registry and journal.
#[derive(Debug, Clone, Copy)]
pub struct LabActions<'a> {
    config: &'a LabConfig,
    registry: &'a InstrumentRegistry,
    journal: &'a Journal,
}

impl<'a> LabActions<'a> {
    pub fn new(config: &'a LabConfig, registry: &'a InstrumentRegistry, journal: &'a Journal) -> Self {
        Self {
            config,
            registry,
            journal,
        }
    }

    fn clocks(&self) -> impl Iterator<Item = &'a String> + use<'a> {
        self.config.clocks.keys()
    }

    fn supplies(&self) -> impl Iterator<Item = &'a String> + use<'a> {
        self.config.supplies.keys()
    }

    pub async fn note(&self, message: impl Into<String>) {
        self.journal.append(JournalEvent::note(message)).await;
    }

    /// Push every instrument's profile with outputs left as they are.
    pub async fn configure_all(&self) -> Result<(), InstrumentError> {
        for name in self.config.instrument_names() {
            self.registry.apply_profile(&name, false).await?;
        }
        Ok(())
    }

    /// Bring the DUT to a known state from whatever it was doing before.
    ///
    /// ```text
    /// clocks off -> supplies off -> settle
    ///   -> supply defaults + profiles, outputs on
    ///   -> assert reset -> clock profiles on -> hold
    ///   -> release -> post-reset delay -> verify reset line
    /// ```
    ///
    /// With `reset` false the reset line is driven released instead of
    /// pulsed.
    pub async fn power_cycle(&self, reset: bool) -> Result<(), InstrumentError> {
        let timing = self.config.timing;
        info!(dut = %self.config.dut.name, reset, "power cycling DUT");

        for name in self.clocks() {
            self.registry.outputs_off(name).await?;
        }
        for name in self.supplies() {
            self.registry.outputs_off(name).await?;
        }
        sleep(timing.power_settle).await;

        for name in self.supplies() {
            self.registry.restore_defaults(name).await?;
            self.registry.apply_profile(name, true).await?;
        }

        // Defaults leave the GPIO port low, which holds the DUT in reset.
        let reset_line = self.config.dut.reset.as_deref();
        if let Some(line) = reset_line {
            self.registry.set_reset(line, reset).await?;
        }
        for name in self.clocks() {
            self.registry.apply_profile(name, true).await?;
        }
        if let Some(line) = reset_line.filter(|_| reset) {
            sleep(timing.reset_pulse).await;
            self.registry.set_reset(line, false).await?;
            sleep(timing.post_reset).await;
            let level = self.registry.query(line, Metric::ResetLine).await?;
            if level.value < 0.5 {
                return Err(InstrumentError::ResetNotReleased {
                    instrument: line.to_string(),
                });
            }
        }
        self.journal
            .append(JournalEvent::note("power cycle complete"))
            .await;
        Ok(())
    }

    /// Pulse the DUT reset line without touching power.
    pub async fn reset(&self) -> Result<(), InstrumentError> {
        let Some(line) = self.config.dut.reset.as_deref() else {
            warn!(dut = %self.config.dut.name, "no reset line configured");
            return Ok(());
        };
        let timing = ResetTiming {
            pulse: self.config.timing.reset_pulse,
            settle: self.config.timing.post_reset,
        };
        self.registry.reset_cycle(line, timing).await?;
        self.journal.append(JournalEvent::note("DUT reset")).await;
        Ok(())
    }

    /// Switch every clock and supply output off.
    ///
    /// All instruments are attempted; the first failure is returned.
    pub async fn power_off(&self) -> Result<(), InstrumentError> {
        let mut first_err = None;
        for name in self.clocks().chain(self.supplies()) {
            if let Err(e) = self.registry.outputs_off(name).await {
                warn!(instrument = %name, error = %e, "failed to switch outputs off");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!(dut = %self.config.dut.name, "DUT powered off");
                self.journal.append(JournalEvent::note("outputs off")).await;
                Ok(())
            }
        }
    }

    /// Measure every flagged channel, journal each reading under `key`, and
    /// record the set as a session result.
    pub async fn measure(&self, key: &str) -> Result<Vec<Reading>, InstrumentError> {
        let readings = self.registry.measure_flagged(None, None).await?;
        for reading in &readings {
            info!(
                key,
                instrument = %reading.instrument,
                metric = %reading.metric,
                measurement = %reading.measurement,
                "measured"
            );
            self.journal
                .append(JournalEvent::Measurement(MeasurementRecord {
                    instrument: reading.instrument.clone(),
                    metric: reading.metric,
                    value: reading.measurement.value,
                    unit: reading.measurement.unit,
                    key: Some(key.to_string()),
                    command_line: None,
                }))
                .await;
        }
        if !readings.is_empty() {
            self.journal.push_result(key, readings_to_json(&readings)).await;
        }
        Ok(readings)
    }

    /// Wait for the DUT to settle after power-up and take the standby
    /// measurement.
    pub async fn standby(&self) -> Result<Vec<Reading>, InstrumentError> {
        sleep(self.config.timing.standby_wait).await;
        self.measure(STANDBY_KEY).await
    }

    /// Power cycle, stop the clock sources marked `leak_off`, wait, and
    /// measure leakage.
    pub async fn leak(&self) -> Result<Vec<Reading>, InstrumentError> {
        self.power_cycle(true).await?;
        for (name, source) in self.config.leak_off_sources() {
            info!(instrument = %name, source, "stopping clock for leakage measurement");
            self.registry
                .configure(
                    &name,
                    &[Setting::ClockOutput {
                        source,
                        enabled: false,
                    }],
                )
                .await?;
        }
        sleep(self.config.timing.leak_wait).await;
        self.measure(LEAK_KEY).await
    }
}
