//! In-process SCPI simulator.
//!
//! [`SimScpi`] interprets the SCPI subset the drivers emit and keeps a
//! physical model of the instrument (setpoints, output relays, GPIO port).
//! A cloneable [`SimHandle`] exposes that model plus a call log so tests and
//! `--simulate` runs can inspect what the drivers actually did.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::error::InstrumentError;
use super::transport::{ScpiTransport, TransportFactory};
use super::types::Endpoint;

/// One supply channel as the simulator sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimChannel {
    pub volts: f64,
    pub amps: f64,
    pub output: bool,
    pub four_wire: bool,
}

/// One signal generator source as the simulator sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct SimSource {
    pub hertz: f64,
    pub high: f64,
    pub low: f64,
    pub duty: f64,
    pub function: String,
    pub output: bool,
}

impl Default for SimSource {
    fn default() -> Self {
        Self {
            hertz: 1000.0,
            high: 0.05,
            low: -0.05,
            duty: 50.0,
            function: "SIN".to_string(),
            output: false,
        }
    }
}

/// The simulated hardware state, excluding bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct SimPhysical {
    pub channels: BTreeMap<u8, SimChannel>,
    pub sources: BTreeMap<u8, SimSource>,
    pub gpio: u8,
    pub dio_pins: BTreeSet<u8>,
    pub pair_mode: String,
}

impl Default for SimPhysical {
    fn default() -> Self {
        Self {
            channels: BTreeMap::new(),
            sources: BTreeMap::new(),
            gpio: 0,
            dio_pins: BTreeSet::new(),
            pair_mode: "OFF".to_string(),
        }
    }
}

/// A completed exchange with the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub command: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug)]
struct SimState {
    physical: SimPhysical,
    calls: Vec<CallRecord>,
    in_flight: usize,
    max_in_flight: usize,
    overlaps: usize,
    fail_next: usize,
    delay: Duration,
    load_ohms: f64,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            physical: SimPhysical::default(),
            calls: Vec::new(),
            in_flight: 0,
            max_in_flight: 0,
            overlaps: 0,
            fail_next: 0,
            delay: Duration::ZERO,
            load_ohms: 100.0,
        }
    }
}

/// Shared view of one simulated instrument.
#[derive(Debug, Clone)]
pub struct SimHandle {
    label: String,
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn physical(&self) -> SimPhysical {
        self.lock().physical.clone()
    }

    pub fn channel(&self, channel: u8) -> Option<SimChannel> {
        self.lock().physical.channels.get(&channel).cloned()
    }

    pub fn source(&self, source: u8) -> Option<SimSource> {
        self.lock().physical.sources.get(&source).cloned()
    }

    pub fn gpio(&self) -> u8 {
        self.lock().physical.gpio
    }

    /// True when no supply channel and no generator source is driving.
    pub fn all_outputs_off(&self) -> bool {
        let state = self.lock();
        state.physical.channels.values().all(|c| !c.output)
            && state.physical.sources.values().all(|s| !s.output)
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.command.clone()).collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Highest number of exchanges ever observed in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Number of exchanges that started while another was in progress.
    pub fn overlaps(&self) -> usize {
        self.lock().overlaps
    }

    /// Make the next `n` exchanges fail with a communication error.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Delay every exchange by `delay` before it is answered.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Resistive load used to derive measured current.
    pub fn set_load_ohms(&self, ohms: f64) {
        self.lock().load_ohms = ohms;
    }
}

/// Decrements the in-flight counter even when the exchange is cancelled.
struct InFlight<'a>(&'a SimHandle);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// [`ScpiTransport`] backed by a [`SimHandle`].
#[derive(Debug, Clone)]
pub struct SimScpi {
    handle: SimHandle,
}

impl SimScpi {
    pub fn new(handle: SimHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &SimHandle {
        &self.handle
    }

    async fn exchange(&mut self, command: &str) -> Result<Option<String>, InstrumentError> {
        let started = Instant::now();
        let delay = {
            let mut state = self.handle.lock();
            state.in_flight += 1;
            if state.in_flight > 1 {
                state.overlaps += 1;
            }
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.delay
        };
        let guard = InFlight(&self.handle);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut state = self.handle.lock();
            state.calls.push(CallRecord {
                command: command.to_string(),
                started,
                finished: Instant::now(),
            });
            if state.fail_next > 0 {
                state.fail_next -= 1;
                Err("injected failure".to_string())
            } else {
                let load = state.load_ohms;
                execute(&mut state.physical, load, command)
            }
        };
        drop(guard);

        result.map_err(|message| InstrumentError::Communication {
            endpoint: self.handle.label.clone(),
            message,
        })
    }
}

#[async_trait]
impl ScpiTransport for SimScpi {
    fn describe(&self) -> String {
        self.handle.label.clone()
    }

    async fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
        self.exchange(command).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
        match self.exchange(command).await? {
            Some(reply) => Ok(reply),
            None => Err(InstrumentError::MalformedReply {
                endpoint: self.handle.label.clone(),
                command: command.to_string(),
                reply: String::new(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Command interpreter
// ---------------------------------------------------------------------------

fn number(s: &str) -> Result<f64, String> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| format!("-224 illegal parameter value {s:?}"))
}

fn channel_list(s: &str) -> Result<u8, String> {
    s.trim()
        .strip_prefix("(@")
        .and_then(|rest| rest.strip_suffix(')'))
        .and_then(|n| n.parse::<u8>().ok())
        .ok_or_else(|| format!("-220 bad channel list {s:?}"))
}

fn on_off(s: &str) -> Result<bool, String> {
    match s.trim() {
        "ON" | "1" => Ok(true),
        "OFF" | "0" => Ok(false),
        other => Err(format!("-224 illegal boolean {other:?}")),
    }
}

/// Split `"ON, (@2)"` into its value and channel.
fn value_and_channel(rest: &str) -> Result<(&str, u8), String> {
    let (value, channels) = rest
        .split_once(',')
        .ok_or_else(|| format!("-109 missing channel list in {rest:?}"))?;
    Ok((value.trim(), channel_list(channels)?))
}

fn execute(phys: &mut SimPhysical, load_ohms: f64, command: &str) -> Result<Option<String>, String> {
    let command = command.trim();
    let (header, rest) = command.split_once(' ').unwrap_or((command, ""));

    match header {
        "*RST" => {
            *phys = SimPhysical::default();
            Ok(None)
        }
        "*IDN?" => Ok(Some("DUTCTL,SIMULATOR,0,1.0".to_string())),
        "APPLY" => {
            let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
            let (channel, volts, amps) = match parts.as_slice() {
                [ch, v, i] => {
                    let ch = ch
                        .strip_prefix("CH")
                        .and_then(|n| n.parse::<u8>().ok())
                        .ok_or_else(|| format!("-220 bad channel {ch:?}"))?;
                    (ch, number(v)?, number(i)?)
                }
                [v, i] => (1, number(v)?, number(i)?),
                _ => return Err(format!("-109 malformed APPLY {rest:?}")),
            };
            let ch = phys.channels.entry(channel).or_default();
            ch.volts = volts;
            ch.amps = amps;
            Ok(None)
        }
        "VOLTAGE:SENSE:SOURCE" => {
            let (mode, channel) = value_and_channel(rest)?;
            let four_wire = match mode {
                "EXTERNAL" => true,
                "INTERNAL" => false,
                other => return Err(format!("-224 illegal sense source {other:?}")),
            };
            phys.channels.entry(channel).or_default().four_wire = four_wire;
            Ok(None)
        }
        "OUTPUT:STATE" => {
            let (state, channel) = value_and_channel(rest)?;
            phys.channels.entry(channel).or_default().output = on_off(state)?;
            Ok(None)
        }
        "OUTPUT:PAIR" => {
            phys.pair_mode = rest.trim().to_string();
            Ok(None)
        }
        "DIGITAL:OUTPUT:DATA" => {
            phys.gpio = rest
                .trim()
                .parse::<u8>()
                .map_err(|_| format!("-224 illegal port value {rest:?}"))?;
            Ok(None)
        }
        "DIGITAL:OUTPUT:DATA?" => Ok(Some(phys.gpio.to_string())),
        "MEASURE:SCALAR:VOLTAGE:DC?" => {
            let ch = phys.channels.get(&channel_list(rest)?).cloned().unwrap_or_default();
            let volts = if ch.output { ch.volts } else { 0.0 };
            Ok(Some(format!("{volts:E}")))
        }
        "MEASURE:SCALAR:CURRENT:DC?" => {
            let ch = phys.channels.get(&channel_list(rest)?).cloned().unwrap_or_default();
            let amps = if ch.output && load_ohms > 0.0 {
                (ch.volts / load_ohms).min(ch.amps)
            } else {
                0.0
            };
            Ok(Some(format!("{amps:E}")))
        }
        "SOURCE:VOLTAGE?" => {
            let ch = phys.channels.get(&channel_list(rest)?).cloned().unwrap_or_default();
            Ok(Some(format!("{:E}", ch.volts)))
        }
        "SOURCE:CURRENT?" => {
            let ch = phys.channels.get(&channel_list(rest)?).cloned().unwrap_or_default();
            Ok(Some(format!("{:E}", ch.amps)))
        }
        _ => execute_indexed(phys, header, rest),
    }
}

/// Commands whose header embeds an index: `DIGITAL:PINn:*`, `SOURCEn:*`,
/// `OUTPUTn`.
fn execute_indexed(
    phys: &mut SimPhysical,
    header: &str,
    rest: &str,
) -> Result<Option<String>, String> {
    let undefined = || format!("-113 undefined header {header:?}");

    if let Some(pin_tail) = header.strip_prefix("DIGITAL:PIN") {
        let (pin, tail) = pin_tail.split_once(':').ok_or_else(undefined)?;
        let pin = pin.parse::<u8>().map_err(|_| undefined())?;
        return match (tail, rest.trim()) {
            ("FUNCTION", "DIO") => {
                phys.dio_pins.insert(pin);
                Ok(None)
            }
            ("POLARITY", "POSITIVE") => Ok(None),
            _ => Err(undefined()),
        };
    }

    if let Some(index) = header.strip_prefix("OUTPUT") {
        let source = index.parse::<u8>().map_err(|_| undefined())?;
        phys.sources.entry(source).or_default().output = on_off(rest)?;
        return Ok(None);
    }

    if let Some(src_tail) = header.strip_prefix("SOURCE") {
        let (index, tail) = src_tail.split_once(':').ok_or_else(undefined)?;
        let index = index.parse::<u8>().map_err(|_| undefined())?;
        let src = phys.sources.entry(index).or_default();
        return match tail {
            "FREQUENCY" => {
                src.hertz = number(rest)?;
                Ok(None)
            }
            "FREQUENCY?" => Ok(Some(format!("{:E}", src.hertz))),
            "VOLTAGE:HIGH" => {
                src.high = number(rest)?;
                Ok(None)
            }
            "VOLTAGE:LOW" => {
                src.low = number(rest)?;
                Ok(None)
            }
            "FUNCTION" => {
                src.function = rest.trim().to_string();
                Ok(None)
            }
            "FUNCTION:SQUARE:DCYCLE" => {
                src.duty = number(rest)?;
                Ok(None)
            }
            _ => Err(undefined()),
        };
    }

    Err(undefined())
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Hands out one [`SimHandle`] per instrument name; reconnecting to the same
/// name reuses the existing simulated instrument.
#[derive(Debug, Clone, Default)]
pub struct SimTransportFactory {
    handles: Arc<Mutex<HashMap<String, SimHandle>>>,
}

impl SimTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, name: &str) -> Option<SimHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn handles(&self) -> Vec<(String, SimHandle)> {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = handles
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl TransportFactory for SimTransportFactory {
    fn connect(
        &self,
        name: &str,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> Box<dyn ScpiTransport> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let handle = handles
            .entry(name.to_string())
            .or_insert_with(|| SimHandle::new(format!("sim:{name}@{endpoint}")))
            .clone();
        Box::new(SimScpi::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> (SimScpi, SimHandle) {
        let handle = SimHandle::new("sim:test");
        (SimScpi::new(handle.clone()), handle)
    }

    #[tokio::test]
    async fn apply_and_measure_with_output_relay() {
        let (mut scpi, handle) = sim();
        scpi.write("APPLY CH2, 0.8, 0.1").await.unwrap();
        assert_eq!(
            scpi.query("MEASURE:SCALAR:VOLTAGE:DC? (@2)").await.unwrap().parse::<f64>().unwrap(),
            0.0
        );
        scpi.write("OUTPUT:STATE ON, (@2)").await.unwrap();
        let volts: f64 = scpi
            .query("MEASURE:SCALAR:VOLTAGE:DC? (@2)")
            .await
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(volts, 0.8);
        assert!(handle.channel(2).unwrap().output);
        assert!(!handle.all_outputs_off());
    }

    #[tokio::test]
    async fn single_output_apply_targets_channel_one() {
        let (mut scpi, handle) = sim();
        scpi.write("APPLY 1.1, 0.5").await.unwrap();
        let ch = handle.channel(1).unwrap();
        assert_eq!(ch.volts, 1.1);
        assert_eq!(ch.amps, 0.5);
    }

    #[tokio::test]
    async fn reset_clears_outputs_and_gpio() {
        let (mut scpi, handle) = sim();
        scpi.write("OUTPUT:STATE ON, (@1)").await.unwrap();
        scpi.write("DIGITAL:OUTPUT:DATA 1").await.unwrap();
        scpi.write("SOURCE1:FREQUENCY 1000000").await.unwrap();
        scpi.write("*RST").await.unwrap();
        assert!(handle.all_outputs_off());
        assert_eq!(handle.gpio(), 0);
        assert_eq!(handle.physical(), SimPhysical::default());
    }

    #[tokio::test]
    async fn generator_commands() {
        let (mut scpi, handle) = sim();
        scpi.write("SOURCE1:FREQUENCY 25000000").await.unwrap();
        scpi.write("SOURCE1:VOLTAGE:HIGH 0.9").await.unwrap();
        scpi.write("SOURCE1:VOLTAGE:LOW 0").await.unwrap();
        scpi.write("SOURCE1:FUNCTION SQU").await.unwrap();
        scpi.write("SOURCE1:FUNCTION:SQUARE:DCYCLE 40").await.unwrap();
        scpi.write("OUTPUT1 ON").await.unwrap();
        let src = handle.source(1).unwrap();
        assert_eq!(src.hertz, 25e6);
        assert_eq!(src.high, 0.9);
        assert_eq!(src.function, "SQU");
        assert_eq!(src.duty, 40.0);
        assert!(src.output);
        let f: f64 = scpi.query("SOURCE1:FREQUENCY?").await.unwrap().parse().unwrap();
        assert_eq!(f, 25e6);
    }

    #[tokio::test]
    async fn unknown_header_is_an_error() {
        let (mut scpi, _) = sim();
        let err = scpi.write("FROB:NICATE 1").await.unwrap_err();
        assert!(matches!(err, InstrumentError::Communication { .. }));
    }

    #[tokio::test]
    async fn injected_failures_then_recovery() {
        let (mut scpi, handle) = sim();
        handle.fail_next(2);
        assert!(scpi.write("*RST").await.is_err());
        assert!(scpi.query("*IDN?").await.is_err());
        assert!(scpi.query("*IDN?").await.is_ok());
        assert_eq!(handle.calls().len(), 3);
    }

    #[tokio::test]
    async fn cancelled_exchange_releases_in_flight_slot() {
        let (mut scpi, handle) = sim();
        handle.set_delay(Duration::from_secs(5));
        let res = tokio::time::timeout(Duration::from_millis(20), scpi.write("*RST")).await;
        assert!(res.is_err());
        handle.set_delay(Duration::ZERO);
        scpi.write("*RST").await.unwrap();
        assert_eq!(handle.overlaps(), 0);
        assert_eq!(handle.max_in_flight(), 1);
    }

    #[test]
    fn factory_reuses_handles_per_name() {
        let factory = SimTransportFactory::new();
        let endpoint = Endpoint::new("10.0.0.1", 5025);
        let _a = factory.connect("psu0", &endpoint, Duration::from_secs(1));
        let _b = factory.connect("psu0", &endpoint, Duration::from_secs(1));
        let _c = factory.connect("gen0", &endpoint, Duration::from_secs(1));
        let names: Vec<String> = factory.handles().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["gen0".to_string(), "psu0".to_string()]);
        assert!(factory.handle("psu0").is_some());
    }
}
