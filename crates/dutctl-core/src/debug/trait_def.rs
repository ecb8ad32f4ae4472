//! The `DebugBackend` trait -- how a debug session's processes are run.
//!
//! The trait is object-safe so the orchestrator can hold a
//! `Arc<dyn DebugBackend>` and tests can substitute a scripted fake.

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

use super::types::{DebugEvent, DebugHandle, DebugPlan};

/// Runs the processes of a [`DebugPlan`] and reports what they do.
#[async_trait]
pub trait DebugBackend: Send + Sync {
    /// Human-readable name (e.g. "process").
    fn name(&self) -> &str;

    /// Start every process in the plan. If one fails to start, the ones
    /// already started are stopped and the error is returned.
    async fn spawn(&self, plan: &DebugPlan) -> Result<DebugHandle>;

    /// Output and exit events of a running session.
    ///
    /// The stream ends with [`DebugEvent::Completed`] once every process has
    /// exited. It can be taken once per handle.
    fn events(&self, handle: &DebugHandle) -> Pin<Box<dyn Stream<Item = DebugEvent> + Send>>;

    /// Stop every process still running: SIGTERM, a grace period, then
    /// SIGKILL.
    async fn kill(&self, handle: &DebugHandle) -> Result<()>;

    /// Whether any process of the session is still alive.
    async fn is_running(&self, handle: &DebugHandle) -> bool;
}

const _: () = {
    fn _assert_object_safe(_: &dyn DebugBackend) {}
};
