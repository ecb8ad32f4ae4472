//! Catch-all driver for SCPI instruments with no typed capabilities.
//!
//! Such instruments can still be identified and returned to defaults, and
//! participate in snapshots, but reject every typed setting and metric.

use async_trait::async_trait;

use super::error::InstrumentError;
use super::trait_def::Instrument;
use super::transport::ScpiTransport;
use super::types::{CapabilitySet, InstrumentKind, InstrumentState, Measurement, Metric, Setting};

pub struct GenericScpi {
    name: String,
    transport: Box<dyn ScpiTransport>,
}

impl GenericScpi {
    pub fn new(name: impl Into<String>, transport: Box<dyn ScpiTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }
}

#[async_trait]
impl Instrument for GenericScpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Generic
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::empty()
    }

    fn endpoint(&self) -> String {
        self.transport.describe()
    }

    fn default_channel(&self) -> u8 {
        1
    }

    async fn apply(&mut self, setting: &Setting) -> Result<(), InstrumentError> {
        Err(InstrumentError::UnsupportedCapability {
            instrument: self.name.clone(),
            capability: setting.capability(),
        })
    }

    async fn measure(&mut self, metric: Metric) -> Result<Measurement, InstrumentError> {
        Err(InstrumentError::UnsupportedCapability {
            instrument: self.name.clone(),
            capability: metric.capability(),
        })
    }

    async fn apply_profile(&mut self, _enable_outputs: bool) -> Result<(), InstrumentError> {
        Ok(())
    }

    async fn outputs_off(&mut self) -> Result<(), InstrumentError> {
        Ok(())
    }

    async fn restore_defaults(&mut self) -> Result<(), InstrumentError> {
        self.transport.write("*RST").await
    }

    async fn identify(&mut self) -> Result<String, InstrumentError> {
        self.transport.query("*IDN?").await
    }

    fn measurement_plan(&self, _channel: Option<u8>) -> Vec<Metric> {
        Vec::new()
    }

    fn state(&self) -> InstrumentState {
        InstrumentState::default()
    }
}
