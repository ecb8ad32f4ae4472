//! The `Instrument` trait -- the driver interface for lab instruments.
//!
//! Each concrete driver (power supply, signal generator, generic SCPI)
//! implements this trait. The trait is object-safe so instruments can be
//! stored as `Box<dyn Instrument>` inside the
//! [`crate::registry::InstrumentRegistry`].

use async_trait::async_trait;

use super::error::InstrumentError;
use super::types::{CapabilitySet, InstrumentKind, InstrumentState, Measurement, Metric, Setting};

/// Driver interface for one physical instrument.
///
/// Methods take `&mut self`: an instrument is a single serial resource and
/// the registry guarantees exclusive access while a call is in progress.
#[async_trait]
pub trait Instrument: Send {
    /// Configured instrument name (e.g. "psu0").
    fn name(&self) -> &str;

    fn kind(&self) -> InstrumentKind;

    /// Capabilities are fixed at construction.
    fn capabilities(&self) -> CapabilitySet;

    /// Address of the underlying transport, for logs.
    fn endpoint(&self) -> String;

    /// Channel (or source) used when a command does not name one.
    fn default_channel(&self) -> u8;

    /// Apply one setting. Implementations validate ranges before any I/O.
    async fn apply(&mut self, setting: &Setting) -> Result<(), InstrumentError>;

    /// Read one metric from the hardware.
    async fn measure(&mut self, metric: Metric) -> Result<Measurement, InstrumentError>;

    /// Push the configured profile to the hardware. Outputs are switched on
    /// only when `enable_outputs` is set.
    async fn apply_profile(&mut self, enable_outputs: bool) -> Result<(), InstrumentError>;

    /// Switch every output of this instrument off.
    async fn outputs_off(&mut self) -> Result<(), InstrumentError>;

    /// Return the instrument to its power-on defaults (`*RST`).
    async fn restore_defaults(&mut self) -> Result<(), InstrumentError>;

    /// Identification string (`*IDN?`).
    async fn identify(&mut self) -> Result<String, InstrumentError>;

    /// Metrics sampled by the "measure everything flagged" operation. With
    /// `channel` set, only that channel is considered (flagged or not).
    fn measurement_plan(&self, channel: Option<u8>) -> Vec<Metric>;

    /// Last commanded state, as a copy.
    fn state(&self) -> InstrumentState;
}

// Compile-time assertion: Instrument must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Instrument) {}
};
