use thiserror::Error;

use super::command::Verb;

/// Errors that can occur while parsing a `@dutctl` directive.
///
/// A protocol error is attributed to the offending line and never aborts
/// the session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("directive has no verb")]
    Empty,

    #[error("unknown verb {0:?}")]
    UnknownVerb(String),

    #[error("{verb} expects {expected} argument(s), got {got}")]
    ArgCount {
        verb: Verb,
        expected: &'static str,
        got: usize,
    },

    #[error("invalid {what} {value:?}")]
    InvalidArgument { what: &'static str, value: String },

    #[error("{what} {value:?} is not a number")]
    InvalidNumber { what: &'static str, value: String },

    #[error("{what} = {value} outside {range}")]
    OutOfRange {
        what: &'static str,
        value: f64,
        range: &'static str,
    },

    #[error("stream ended inside a continued {verb} directive started on line {line}")]
    Truncated { verb: Verb, line: u64 },
}
