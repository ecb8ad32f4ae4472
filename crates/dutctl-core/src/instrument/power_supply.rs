//! Programmable DC supply driver (E36xx-style SCPI dialect).
//!
//! Besides its outputs, a supply may own the DUT's reset line through one
//! of its digital I/O pins. The line is active low: a port bit of 0 holds
//! the DUT in reset.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::error::InstrumentError;
use super::trait_def::Instrument;
use super::transport::{ScpiTransport, parse_number};
use super::types::{
    Capability, CapabilitySet, InstrumentKind, InstrumentState, Measurement, Metric, Setting,
    SupplyChannelState,
};
use crate::config::{ChannelConfig, SupplyConfig};

/// Absolute ceiling for a current limit, independent of configuration.
pub const MAX_CURRENT_LIMIT: f64 = 10.0;

/// Settling time after an `APPLY`.
const APPLY_SETTLE: Duration = Duration::from_millis(50);

pub struct PowerSupply {
    name: String,
    config: SupplyConfig,
    transport: Box<dyn ScpiTransport>,
    state: InstrumentState,
    gpio_ready: bool,
    apply_settle: Duration,
}

impl PowerSupply {
    pub fn new(name: impl Into<String>, config: SupplyConfig, transport: Box<dyn ScpiTransport>) -> Self {
        let mut driver = Self {
            name: name.into(),
            config,
            transport,
            state: InstrumentState::default(),
            gpio_ready: false,
            apply_settle: APPLY_SETTLE,
        };
        driver.state = driver.power_on_state();
        driver
    }

    /// Override the post-`APPLY` settling delay.
    pub fn with_apply_settle(mut self, settle: Duration) -> Self {
        self.apply_settle = settle;
        self
    }

    fn power_on_state(&self) -> InstrumentState {
        InstrumentState {
            supply: self
                .config
                .channels
                .keys()
                .map(|ch| (*ch, SupplyChannelState::default()))
                .collect(),
            sources: Default::default(),
            reset_asserted: self.config.reset_pin.map(|_| true),
            pair_mode: None,
        }
    }

    fn channel_config(&self, channel: u8) -> Result<&ChannelConfig, InstrumentError> {
        self.config
            .channels
            .get(&channel)
            .ok_or_else(|| InstrumentError::UnknownChannel {
                instrument: self.name.clone(),
                channel,
            })
    }

    fn ensure(&self, capability: Capability) -> Result<(), InstrumentError> {
        if self.capabilities().contains(capability) {
            Ok(())
        } else {
            Err(InstrumentError::UnsupportedCapability {
                instrument: self.name.clone(),
                capability,
            })
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

    /// Channel 0 (single-output supply) is addressed as `(@1)`.
    fn channel_list(channel: u8) -> String {
        format!("(@{})", channel.max(1))
    }

    fn apply_command(channel: u8, volts: f64, amps: f64) -> String {
        if channel == 0 {
            format!("APPLY {volts}, {amps}")
        } else {
            format!("APPLY CH{channel}, {volts}, {amps}")
        }
    }

    fn channel_state(&mut self, channel: u8) -> &mut SupplyChannelState {
        self.state.supply.entry(channel).or_default()
    }

    async fn apply_levels(&mut self, channel: u8, volts: f64, amps: f64) -> Result<(), InstrumentError> {
        self.transport
            .write(&Self::apply_command(channel, volts, amps))
            .await?;
        if !self.apply_settle.is_zero() {
            tokio::time::sleep(self.apply_settle).await;
        }
        let state = self.channel_state(channel);
        state.volts = volts;
        state.amps = amps;
        Ok(())
    }

    async fn set_output(&mut self, channel: u8, enabled: bool) -> Result<(), InstrumentError> {
        let on = if enabled { "ON" } else { "OFF" };
        self.transport
            .write(&format!("OUTPUT:STATE {on}, {}", Self::channel_list(channel)))
            .await?;
        self.channel_state(channel).output = enabled;
        Ok(())
    }

    fn reset_pin(&self) -> Result<u8, InstrumentError> {
        self.config
            .reset_pin
            .ok_or_else(|| InstrumentError::UnsupportedCapability {
                instrument: self.name.clone(),
                capability: Capability::Reset,
            })
    }

    async fn prepare_gpio(&mut self, pin: u8) -> Result<(), InstrumentError> {
        if self.gpio_ready {
            return Ok(());
        }
        self.transport
            .write(&format!("DIGITAL:PIN{pin}:FUNCTION DIO"))
            .await?;
        self.transport
            .write(&format!("DIGITAL:PIN{pin}:POLARITY POSITIVE"))
            .await?;
        self.gpio_ready = true;
        Ok(())
    }

    async fn drive_reset(&mut self, asserted: bool) -> Result<(), InstrumentError> {
        let pin = self.reset_pin()?;
        self.prepare_gpio(pin).await?;
        // Active low: released means the pin's bit is set.
        let data: u8 = if asserted { 0 } else { 1 << (pin - 1) };
        self.transport
            .write(&format!("DIGITAL:OUTPUT:DATA {data}"))
            .await?;
        self.state.reset_asserted = Some(asserted);
        Ok(())
    }

    async fn query_number(&mut self, command: &str) -> Result<f64, InstrumentError> {
        let reply = self.transport.query(command).await?;
        parse_number(&self.transport.describe(), command, &reply)
    }
}

#[async_trait]
impl Instrument for PowerSupply {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> InstrumentKind {
        InstrumentKind::PowerSupply
    }

    fn capabilities(&self) -> CapabilitySet {
        let caps = CapabilitySet::empty().with(Capability::Power);
        if self.config.reset_pin.is_some() {
            caps.with(Capability::Reset)
        } else {
            caps
        }
    }

    fn endpoint(&self) -> String {
        self.transport.describe()
    }

    fn default_channel(&self) -> u8 {
        self.config.channels.keys().next().copied().unwrap_or(0)
    }

    async fn apply(&mut self, setting: &Setting) -> Result<(), InstrumentError> {
        self.ensure(setting.capability())?;
        match *setting {
            Setting::Voltage { channel, volts } => {
                let cfg = self.channel_config(channel)?;
                let (min, max) = (cfg.voltage_min, cfg.voltage_max);
                if !(volts >= min && volts <= max) {
                    return Err(self.out_of_range("voltage", volts, min, max));
                }
                let amps = self
                    .state
                    .supply
                    .get(&channel)
                    .map(|s| s.amps)
                    .filter(|a| *a > 0.0)
                    .unwrap_or(cfg.current);
                debug!(instrument = %self.name, channel, volts, "set voltage");
                self.apply_levels(channel, volts, amps).await
            }
            Setting::CurrentLimit { channel, amps } => {
                let cfg = self.channel_config(channel)?;
                if !(0.0..=MAX_CURRENT_LIMIT).contains(&amps) {
                    return Err(self.out_of_range("current", amps, 0.0, MAX_CURRENT_LIMIT));
                }
                let volts = self
                    .state
                    .supply
                    .get(&channel)
                    .map(|s| s.volts)
                    .unwrap_or(cfg.voltage);
                debug!(instrument = %self.name, channel, amps, "set current limit");
                self.apply_levels(channel, volts, amps).await
            }
            Setting::Output { channel, enabled } => {
                self.channel_config(channel)?;
                self.set_output(channel, enabled).await
            }
            Setting::ResetLine { asserted } => self.drive_reset(asserted).await,
            // Clock settings were rejected by `ensure` above.
            _ => Err(InstrumentError::UnsupportedCapability {
                instrument: self.name.clone(),
                capability: setting.capability(),
            }),
        }
    }

    async fn measure(&mut self, metric: Metric) -> Result<Measurement, InstrumentError> {
        self.ensure(metric.capability())?;
        let value = match metric {
            Metric::Voltage { channel } => {
                self.channel_config(channel)?;
                let cmd = format!("MEASURE:SCALAR:VOLTAGE:DC? {}", Self::channel_list(channel));
                self.query_number(&cmd).await?
            }
            Metric::Current { channel } => {
                self.channel_config(channel)?;
                let cmd = format!("MEASURE:SCALAR:CURRENT:DC? {}", Self::channel_list(channel));
                self.query_number(&cmd).await?
            }
            Metric::VoltageSetpoint { channel } => {
                self.channel_config(channel)?;
                let cmd = format!("SOURCE:VOLTAGE? {}", Self::channel_list(channel));
                self.query_number(&cmd).await?
            }
            Metric::CurrentSetpoint { channel } => {
                self.channel_config(channel)?;
                let cmd = format!("SOURCE:CURRENT? {}", Self::channel_list(channel));
                self.query_number(&cmd).await?
            }
            Metric::ResetLine => {
                let pin = self.reset_pin()?;
                let port = self.query_number("DIGITAL:OUTPUT:DATA?").await? as u32;
                f64::from((port >> (pin - 1)) & 1)
            }
            Metric::Frequency { .. } => {
                return Err(InstrumentError::UnsupportedCapability {
                    instrument: self.name.clone(),
                    capability: Capability::Clock,
                });
            }
        };
        Ok(Measurement::new(value, metric.unit()))
    }

    async fn apply_profile(&mut self, enable_outputs: bool) -> Result<(), InstrumentError> {
        debug!(instrument = %self.name, enable_outputs, "applying supply profile");
        if !self.config.channels.contains_key(&0) {
            let mode = self.config.pair_mode;
            self.transport
                .write(&format!("OUTPUT:PAIR {}", mode.scpi()))
                .await?;
            self.state.pair_mode = Some(mode);
        }

        let channels: Vec<(u8, ChannelConfig)> = self
            .config
            .channels
            .iter()
            .map(|(ch, cfg)| (*ch, cfg.clone()))
            .collect();
        for (channel, cfg) in channels {
            self.apply_levels(channel, cfg.voltage, cfg.current).await?;
            let sense = if cfg.four_wire { "EXTERNAL" } else { "INTERNAL" };
            self.transport
                .write(&format!(
                    "VOLTAGE:SENSE:SOURCE {sense}, {}",
                    Self::channel_list(channel)
                ))
                .await?;
            self.channel_state(channel).four_wire = cfg.four_wire;
            if enable_outputs && cfg.enabled {
                self.set_output(channel, true).await?;
            }
        }
        Ok(())
    }

    async fn outputs_off(&mut self) -> Result<(), InstrumentError> {
        let channels: Vec<u8> = self.config.channels.keys().copied().collect();
        for channel in channels {
            self.set_output(channel, false).await?;
        }
        Ok(())
    }

    async fn restore_defaults(&mut self) -> Result<(), InstrumentError> {
        self.transport.write("*RST").await?;
        // *RST clears the DIO port (reset asserted) and the pin functions.
        self.gpio_ready = false;
        self.state = self.power_on_state();
        Ok(())
    }

    async fn identify(&mut self) -> Result<String, InstrumentError> {
        self.transport.query("*IDN?").await
    }

    fn measurement_plan(&self, channel: Option<u8>) -> Vec<Metric> {
        self.config
            .channels
            .iter()
            .filter(|(ch, cfg)| match channel {
                Some(wanted) => **ch == wanted,
                None => cfg.measure,
            })
            .flat_map(|(ch, cfg)| {
                let channel = *ch;
                let mut metrics = vec![Metric::Current { channel }];
                if cfg.measure_voltage {
                    metrics.push(Metric::Voltage { channel });
                }
                metrics
            })
            .collect()
    }

    fn state(&self) -> InstrumentState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::instrument::sim::{SimHandle, SimScpi};
    use crate::instrument::types::{Endpoint, PairMode};

    fn channel(voltage: f64, measure: bool) -> ChannelConfig {
        ChannelConfig {
            voltage,
            current: 0.2,
            voltage_min: 0.0,
            voltage_max: voltage * 1.1,
            enabled: true,
            four_wire: false,
            measure,
            measure_voltage: measure,
        }
    }

    fn supply(reset_pin: Option<u8>) -> (PowerSupply, SimHandle) {
        let handle = SimHandle::new("sim:psu0");
        let config = SupplyConfig {
            endpoint: Endpoint::new("127.0.0.1", 5025),
            reset_pin,
            pair_mode: PairMode::Off,
            channels: BTreeMap::from([(1, channel(0.8, true)), (2, channel(1.8, false))]),
        };
        let psu = PowerSupply::new("psu0", config, Box::new(SimScpi::new(handle.clone())))
            .with_apply_settle(Duration::ZERO);
        (psu, handle)
    }

    #[tokio::test]
    async fn profile_then_read_back() {
        let (mut psu, handle) = supply(None);
        psu.apply_profile(true).await.unwrap();
        assert_eq!(handle.channel(1).unwrap().volts, 0.8);
        assert!(handle.channel(2).unwrap().output);

        let vset = psu.measure(Metric::VoltageSetpoint { channel: 2 }).await.unwrap();
        assert_eq!(vset.value, 1.8);
        let vol = psu.measure(Metric::Voltage { channel: 1 }).await.unwrap();
        assert_eq!(vol.value, 0.8);
    }

    #[tokio::test]
    async fn profile_without_outputs_leaves_relays_open() {
        let (mut psu, handle) = supply(None);
        psu.apply_profile(false).await.unwrap();
        assert!(handle.all_outputs_off());
        assert!(handle.commands().contains(&"OUTPUT:PAIR OFF".to_string()));
    }

    #[tokio::test]
    async fn voltage_out_of_bounds_is_rejected_before_io() {
        let (mut psu, handle) = supply(None);
        let err = psu
            .apply(&Setting::Voltage {
                channel: 1,
                volts: 5.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InstrumentError::OutOfRange { what: "voltage", .. }));
        assert!(handle.commands().is_empty());
    }

    #[tokio::test]
    async fn zero_current_limit_is_accepted() {
        let (mut psu, handle) = supply(None);
        psu.apply(&Setting::CurrentLimit {
            channel: 1,
            amps: 0.0,
        })
        .await
        .unwrap();
        assert_eq!(handle.channel(1).unwrap().amps, 0.0);

        let err = psu
            .apply(&Setting::CurrentLimit {
                channel: 1,
                amps: MAX_CURRENT_LIMIT + 0.5,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InstrumentError::OutOfRange { what: "current", .. }));
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let (mut psu, _) = supply(None);
        let err = psu.measure(Metric::Current { channel: 7 }).await.unwrap_err();
        assert!(matches!(err, InstrumentError::UnknownChannel { channel: 7, .. }));
    }

    #[tokio::test]
    async fn clock_settings_are_unsupported() {
        let (mut psu, _) = supply(Some(1));
        let err = psu
            .apply(&Setting::Frequency {
                source: 1,
                hertz: 1e6,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::UnsupportedCapability {
                capability: Capability::Clock,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn reset_line_is_active_low() {
        let (mut psu, handle) = supply(Some(2));
        assert!(psu.capabilities().contains(Capability::Reset));

        psu.apply(&Setting::ResetLine { asserted: true }).await.unwrap();
        assert_eq!(handle.gpio(), 0);
        assert_eq!(psu.measure(Metric::ResetLine).await.unwrap().value, 0.0);

        psu.apply(&Setting::ResetLine { asserted: false }).await.unwrap();
        assert_eq!(handle.gpio(), 0b10);
        assert_eq!(psu.measure(Metric::ResetLine).await.unwrap().value, 1.0);
        assert_eq!(psu.state().reset_asserted, Some(false));

        let pin_setup = handle
            .commands()
            .iter()
            .filter(|c| c.starts_with("DIGITAL:PIN2:"))
            .count();
        assert_eq!(pin_setup, 2, "pin function is configured once");
    }

    #[tokio::test]
    async fn no_reset_pin_means_no_reset_capability() {
        let (mut psu, _) = supply(None);
        assert!(!psu.capabilities().contains(Capability::Reset));
        assert!(psu.measure(Metric::ResetLine).await.is_err());
    }

    #[tokio::test]
    async fn restore_defaults_resets_cached_state() {
        let (mut psu, handle) = supply(Some(1));
        psu.apply_profile(true).await.unwrap();
        psu.apply(&Setting::ResetLine { asserted: false }).await.unwrap();
        psu.restore_defaults().await.unwrap();
        assert!(handle.all_outputs_off());
        assert_eq!(psu.state().reset_asserted, Some(true));
        assert!(psu.state().supply.values().all(|c| !c.output));
    }

    #[test]
    fn measurement_plan_follows_flags() {
        let (psu, _) = supply(None);
        assert_eq!(
            psu.measurement_plan(None),
            vec![Metric::Current { channel: 1 }, Metric::Voltage { channel: 1 }]
        );
        assert_eq!(psu.measurement_plan(Some(2)), vec![Metric::Current { channel: 2 }]);
    }

    #[test]
    fn single_output_apply_syntax() {
        assert_eq!(PowerSupply::apply_command(0, 1.2, 0.5), "APPLY 1.2, 0.5");
        assert_eq!(PowerSupply::apply_command(3, 1.2, 0.5), "APPLY CH3, 1.2, 0.5");
        assert_eq!(PowerSupply::channel_list(0), "(@1)");
    }
}
