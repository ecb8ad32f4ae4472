//! The `@dutctl` command protocol embedded in device serial output.

pub mod command;
pub mod error;
pub mod legacy;
pub mod parser;

pub use command::{Command, Directive, MARKER, MetricName, PROTOCOL_VERSION, Setpoint, Verb};
pub use error::ProtocolError;
pub use parser::{LineOutcome, ParsedLine, Parser};
