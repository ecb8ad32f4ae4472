use std::time::Duration;

use thiserror::Error;

use super::types::Capability;

/// Errors raised by instrument drivers, transports and the registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InstrumentError {
    #[error("unknown instrument {0:?}")]
    UnknownInstrument(String),

    #[error("instrument {instrument:?} does not support {capability}")]
    UnsupportedCapability {
        instrument: String,
        capability: Capability,
    },

    #[error("instrument {instrument:?} has no channel {channel}")]
    UnknownChannel { instrument: String, channel: u8 },

    #[error("{instrument}: {what} = {value} outside [{min}, {max}]")]
    OutOfRange {
        instrument: String,
        what: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("communication with {endpoint} failed: {message}")]
    Communication { endpoint: String, message: String },

    #[error("{endpoint}: no reply within {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("{endpoint}: malformed reply {reply:?} to {command:?}")]
    MalformedReply {
        endpoint: String,
        command: String,
        reply: String,
    },

    #[error("{instrument}: reset line still asserted after release")]
    ResetNotReleased { instrument: String },
}

impl InstrumentError {
    /// Whether retrying the same call can plausibly succeed.
    ///
    /// Link-level failures are transient; anything the caller got wrong
    /// (unknown names, missing capabilities, out-of-range values) is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InstrumentError::Communication { .. }
                | InstrumentError::Timeout { .. }
                | InstrumentError::MalformedReply { .. }
                | InstrumentError::ResetNotReleased { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, InstrumentError::Timeout { .. })
    }
}
