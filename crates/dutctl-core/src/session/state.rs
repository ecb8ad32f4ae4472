//! Session lifecycle states and terminal outcomes.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::journal::{Journal, JournalEvent};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Configuring,
    PowerCycling,
    SessionRunning,
    Draining,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::PowerCycling => "power_cycling",
            SessionState::SessionRunning => "session_running",
            SessionState::Draining => "draining",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalStatus {
    /// The primary debug process exited zero.
    Success,
    /// The primary debug process exited non-zero or could not be started.
    Failure { reason: String, exit_code: Option<i32> },
    /// The wall-clock limit elapsed and the debug session was killed.
    Timeout,
    /// The operator cancelled the session.
    Aborted,
    /// The configuration could not be applied; no power was cycled.
    ConfigError { reason: String },
    /// An instrument stayed unreachable after retries.
    InstrumentFailure { reason: String },
}

impl TerminalStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TerminalStatus::Success => "success",
            TerminalStatus::Failure { .. } => "failure",
            TerminalStatus::Timeout => "timeout",
            TerminalStatus::Aborted => "aborted",
            TerminalStatus::ConfigError { .. } => "config_error",
            TerminalStatus::InstrumentFailure { .. } => "instrument_failure",
        }
    }

    /// Process exit status for this outcome. `warnings` only matters for
    /// an otherwise successful run.
    ///
    /// ```text
    /// 0   success
    /// 1   debug session failed
    /// 2   configuration error
    /// 3   success, but protocol or command warnings were journaled
    /// 4   timeout
    /// 5   instrument failure
    /// 130 aborted
    /// ```
    pub fn exit_code(&self, warnings: u64) -> i32 {
        match self {
            TerminalStatus::Success if warnings > 0 => 3,
            TerminalStatus::Success => 0,
            TerminalStatus::Failure { .. } => 1,
            TerminalStatus::ConfigError { .. } => 2,
            TerminalStatus::Timeout => 4,
            TerminalStatus::InstrumentFailure { .. } => 5,
            TerminalStatus::Aborted => 130,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalStatus::Failure {
                reason,
                exit_code: Some(code),
            } => write!(f, "failure (exit {code}): {reason}"),
            TerminalStatus::Failure { reason, .. } => write!(f, "failure: {reason}"),
            TerminalStatus::ConfigError { reason } => write!(f, "configuration error: {reason}"),
            TerminalStatus::InstrumentFailure { reason } => {
                write!(f, "instrument failure: {reason}")
            }
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already running on DUT {dut}")]
    Busy { dut: String },

    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// The session state machine.
///
/// Enforces the transition graph:
///
/// ```text
/// idle           -> configuring
/// configuring    -> power_cycling
/// configuring    -> terminated      (configuration error)
/// power_cycling  -> session_running
/// power_cycling  -> draining        (instrument failure or abort)
/// session_running -> draining
/// draining       -> terminated
/// ```
///
/// Every accepted transition is journaled.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    journal: Journal,
}

impl SessionMachine {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: SessionState::Idle,
            journal,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// Check whether `from -> to` is an edge in the state graph.
    pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        matches!(
            (from, to),
            (SessionState::Idle, SessionState::Configuring)
                | (SessionState::Configuring, SessionState::PowerCycling)
                | (SessionState::Configuring, SessionState::Terminated)
                | (SessionState::PowerCycling, SessionState::SessionRunning)
                | (SessionState::PowerCycling, SessionState::Draining)
                | (SessionState::SessionRunning, SessionState::Draining)
                | (SessionState::Draining, SessionState::Terminated)
        )
    }

    /// Move to `to`, journaling the transition.
    pub async fn advance(&mut self, to: SessionState) -> Result<(), SessionError> {
        let from = self.state;
        if !Self::is_valid_transition(from, to) {
            return Err(SessionError::InvalidTransition { from, to });
        }
        debug!(%from, %to, "session transition");
        self.journal
            .append(JournalEvent::Transition {
                from: from.to_string(),
                to: to.to_string(),
            })
            .await;
        self.state = to;
        Ok(())
    }
}

/// Summary written to `session.json`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub dut: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    pub instruments: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: TerminalStatus,
    pub exit_code: i32,
}
