//! Sessions: the state machine, the orchestrator that drives it, and the
//! lab actions it sequences.

pub mod actions;
pub mod orchestrator;
pub mod state;

pub use actions::{LEAK_KEY, LabActions, STANDBY_KEY};
pub use orchestrator::{Orchestrator, SerialSource, SessionPlan, SessionReport};
pub use state::{SessionError, SessionMachine, SessionRecord, SessionState, TerminalStatus};
