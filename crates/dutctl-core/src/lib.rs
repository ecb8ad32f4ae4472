//! Core of `dutctl`: drives a device under test (DUT) through reproducible
//! power/reset cycles, supervises a scripted debug session, and serves the
//! `@dutctl` command protocol that firmware emits on its serial console.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator (session)
//!     |-- InstrumentRegistry --lock(name)--> dyn Instrument --> dyn ScpiTransport
//!     |-- DebugBackend --spawn/events/kill--> openocd + gdb
//!     |-- SerialMonitor --lines--> protocol::Parser --commands--> Dispatcher
//!     |                                                              |
//!     |                                                  InstrumentRegistry
//!     `-- Journal <-- every producer appends here (single ordered record)
//! ```

pub mod config;
pub mod debug;
pub mod instrument;
pub mod journal;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod session;

pub use config::{ConfigError, LabConfig};
pub use journal::Journal;
pub use registry::InstrumentRegistry;
