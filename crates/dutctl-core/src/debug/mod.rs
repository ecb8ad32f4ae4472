//! Debug-session supervision (openocd + gdb).
//!
//! ```text
//! Orchestrator
//!     |
//!     v
//! dyn DebugBackend
//!     |   spawn(plan) --> DebugHandle { id, processes }
//!     |   events(handle) --> Stream<DebugEvent>
//!     |   kill(handle)
//!     |   is_running(handle)
//! ```

pub mod process;
pub mod trait_def;
pub mod types;

pub use process::ProcessBackend;
pub use trait_def::DebugBackend;
pub use types::{
    DebugEvent, DebugHandle, DebugOutcome, DebugPlan, OutputStream, ProcessRole, ProcessSpec,
    SpawnedProcess, Toolchain,
};
