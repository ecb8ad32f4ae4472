//! Session orchestrator: runs one DUT session from configuration through
//! power cycling, a live debug session and serial monitoring, to teardown.
//!
//! ```text
//! idle -> configuring -> power_cycling -> session_running -> draining -> terminated
//!              |               |
//!              |               `-- instrument failure / abort --> draining
//!              `-- configuration error --> terminated
//! ```
//!
//! While the session runs, the debug backend and the serial monitor are two
//! independent tasks. The orchestrator waits on the debug event stream, the
//! wall-clock limit and the cancellation token; whichever fires first ends
//! the run, and teardown then stops the other unit explicitly.

use std::fmt;
use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LabConfig;
use crate::debug::{DebugBackend, DebugEvent, DebugOutcome, DebugPlan};
use crate::instrument::InstrumentError;
use crate::journal::{Journal, JournalEvent};
use crate::monitor::{BoxedSerial, MonitorConfig, MonitorSummary, SerialEndpoint, SerialMonitor};
use crate::registry::InstrumentRegistry;

use super::actions::LabActions;
use super::state::{SessionError, SessionMachine, SessionRecord, SessionState, TerminalStatus};

/// Extra time allowed for the debug event stream to finish after a kill.
const EVENT_DRAIN: Duration = Duration::from_secs(2);

/// Where the DUT console comes from.
pub enum SerialSource {
    /// Opened when the session is configured.
    Endpoint(SerialEndpoint),
    /// An already open stream.
    Stream(BoxedSerial),
}

impl fmt::Debug for SerialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialSource::Endpoint(endpoint) => f.debug_tuple("Endpoint").field(endpoint).finish(),
            SerialSource::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Everything needed to run one session.
#[derive(Debug)]
pub struct SessionPlan {
    pub debug: DebugPlan,
    pub target_binary: Option<PathBuf>,
    pub debug_script: Option<PathBuf>,
    pub serial: Option<SerialSource>,
    /// Wall-clock limit for the debug session.
    pub timeout: Option<Duration>,
    /// Switch outputs off after the run.
    pub power_down_after: bool,
    /// Power cycle and re-apply instrument profiles before the run.
    pub reconfigure: bool,
    /// Pulse reset as part of power cycling.
    pub reset: bool,
}

impl SessionPlan {
    pub fn new(debug: DebugPlan) -> Self {
        Self {
            debug,
            target_binary: None,
            debug_script: None,
            serial: None,
            timeout: None,
            power_down_after: true,
            reconfigure: true,
            reset: true,
        }
    }
}

/// What a finished session produced.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub record: SessionRecord,
    pub summary: MonitorSummary,
    pub debug: Option<DebugOutcome>,
}

impl SessionReport {
    pub fn status(&self) -> &TerminalStatus {
        &self.record.status
    }

    pub fn exit_code(&self) -> i32 {
        self.record.exit_code
    }
}

/// Runs sessions against one DUT, at most one at a time.
pub struct Orchestrator {
    config: Arc<LabConfig>,
    registry: Arc<InstrumentRegistry>,
    backend: Arc<dyn DebugBackend>,
    active: Mutex<()>,
}

/// The live part of a session, between power-up and teardown.
struct Live {
    status: TerminalStatus,
    outcome: Option<DebugOutcome>,
    summary: MonitorSummary,
}

impl Orchestrator {
    pub fn new(
        config: Arc<LabConfig>,
        registry: Arc<InstrumentRegistry>,
        backend: Arc<dyn DebugBackend>,
    ) -> Self {
        Self {
            config,
            registry,
            backend,
            active: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    /// Run one session to a terminal status.
    ///
    /// Only [`SessionError`] escapes; every other failure is folded into
    /// the report's [`TerminalStatus`]. The journal is finalized before
    /// returning.
    pub async fn run(
        &self,
        mut plan: SessionPlan,
        journal: Journal,
        cancel: CancellationToken,
    ) -> Result<SessionReport, SessionError> {
        let dut = self.config.dut.name.clone();
        let Ok(_active) = self.active.try_lock() else {
            return Err(SessionError::Busy { dut });
        };

        let started_at = Utc::now();
        let session_id = journal.session_id().await;
        info!(session = %session_id, dut = %dut, "session starting");
        journal
            .append(JournalEvent::SessionStarted {
                session_id,
                dut: dut.clone(),
                instruments: self.registry.names(),
            })
            .await;

        let mut machine = SessionMachine::new(journal.clone());
        let actions = LabActions::new(&self.config, &self.registry, &journal);
        let mut summary = MonitorSummary::default();
        let mut outcome = None;

        let status = 'session: {
            // 1. Configuring.
            machine.advance(SessionState::Configuring).await?;
            let serial = match self.configure(&mut plan, &actions).await {
                Ok(serial) => serial,
                Err(reason) => {
                    error!(reason = %reason, "configuration failed");
                    machine.advance(SessionState::Terminated).await?;
                    break 'session TerminalStatus::ConfigError { reason };
                }
            };

            // 2. Power cycling.
            machine.advance(SessionState::PowerCycling).await?;
            if let Err(e) = self.power_up(&plan, &actions).await {
                error!(error = %e, "power cycling failed");
                machine.advance(SessionState::Draining).await?;
                self.power_down(&plan, &actions).await;
                machine.advance(SessionState::Terminated).await?;
                break 'session TerminalStatus::InstrumentFailure {
                    reason: e.to_string(),
                };
            }
            if cancel.is_cancelled() {
                warn!("session aborted before the debug session started");
                machine.advance(SessionState::Draining).await?;
                self.power_down(&plan, &actions).await;
                machine.advance(SessionState::Terminated).await?;
                break 'session TerminalStatus::Aborted;
            }

            // 3. Session running, 4. draining.
            machine.advance(SessionState::SessionRunning).await?;
            let live = self
                .run_live(&plan, serial, &journal, &mut machine, &cancel)
                .await?;
            summary = live.summary;
            outcome = live.outcome;

            let mut status = live.status;
            if !self.power_down(&plan, &actions).await && status == TerminalStatus::Success {
                status = TerminalStatus::InstrumentFailure {
                    reason: "failed to power down after the session".to_string(),
                };
            }

            // 5. Terminated.
            machine.advance(SessionState::Terminated).await?;
            status
        };

        let exit_code = status.exit_code(summary.warnings());
        info!(
            session = %session_id,
            status = %status,
            exit_code,
            lines = summary.lines,
            commands = summary.commands,
            warnings = summary.warnings(),
            "session finished"
        );
        journal
            .append(JournalEvent::SessionEnded {
                status: status.name().to_string(),
                exit_code,
            })
            .await;

        let record = SessionRecord {
            id: session_id,
            dut,
            binary: plan.target_binary.clone(),
            script: plan.debug_script.clone(),
            instruments: self.registry.names(),
            started_at,
            ended_at: Utc::now(),
            status,
            exit_code,
        };
        if let Err(e) = journal.finalize(&record).await {
            warn!(error = %e, "failed to finalize session journal");
        }

        Ok(SessionReport {
            record,
            summary,
            debug: outcome,
        })
    }

    /// Validate the plan, open the serial console and push instrument
    /// profiles. Errors are reported as a reason string.
    async fn configure(
        &self,
        plan: &mut SessionPlan,
        actions: &LabActions<'_>,
    ) -> Result<Option<BoxedSerial>, String> {
        if plan.debug.is_empty() {
            return Err("debug plan has no processes".to_string());
        }
        if plan.timeout.is_some_and(|t| t.is_zero()) {
            return Err("session timeout must be positive".to_string());
        }
        let missing: Vec<String> = self
            .config
            .instrument_names()
            .into_iter()
            .filter(|name| !self.registry.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(format!("instruments not registered: {}", missing.join(", ")));
        }

        let serial = match plan.serial.take() {
            Some(SerialSource::Endpoint(endpoint)) => {
                let io = endpoint.open().await.map_err(|e| format!("{e:#}"))?;
                info!(serial = %endpoint, "serial console open");
                Some(io)
            }
            Some(SerialSource::Stream(io)) => Some(io),
            None => None,
        };

        if plan.reconfigure {
            actions.configure_all().await.map_err(|e| e.to_string())?;
        }
        Ok(serial)
    }

    async fn power_up(
        &self,
        plan: &SessionPlan,
        actions: &LabActions<'_>,
    ) -> Result<(), InstrumentError> {
        if plan.reconfigure {
            actions.power_cycle(plan.reset).await?;
            actions.standby().await?;
        } else if plan.reset {
            actions.reset().await?;
        }
        Ok(())
    }

    /// Switch outputs off if the plan asks for it. Returns `false` if that
    /// failed.
    async fn power_down(&self, plan: &SessionPlan, actions: &LabActions<'_>) -> bool {
        if !plan.power_down_after {
            debug!("leaving DUT powered");
            return true;
        }
        match actions.power_off().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "failed to power down DUT");
                actions.note(format!("power down failed: {e}")).await;
                false
            }
        }
    }

    /// Supervise the debug session and the serial monitor until one of the
    /// end conditions fires, then drain both.
    async fn run_live(
        &self,
        plan: &SessionPlan,
        serial: Option<BoxedSerial>,
        journal: &Journal,
        machine: &mut SessionMachine,
        cancel: &CancellationToken,
    ) -> Result<Live, SessionError> {
        let stop = CancellationToken::new();
        let monitor_task: Option<JoinHandle<MonitorSummary>> = serial.map(|io| {
            let monitor = SerialMonitor::new(
                Arc::clone(&self.registry),
                journal.clone(),
                MonitorConfig::from_lab(&self.config),
            );
            let stop = stop.clone();
            tokio::spawn(async move { monitor.run(io, stop).await })
        });

        let mut outcome = None;
        let handle = match self.backend.spawn(&plan.debug).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(backend = self.backend.name(), error = %e, "failed to start debug session");
                journal
                    .append(JournalEvent::note(format!("debug session failed to start: {e:#}")))
                    .await;
                None
            }
        };

        let status = match &handle {
            None => TerminalStatus::Failure {
                reason: "debug session failed to start".to_string(),
                exit_code: None,
            },
            Some(handle) => {
                let deadline = plan.timeout.map(|t| Instant::now() + t);
                let mut events = self.backend.events(handle);
                let status = loop {
                    tokio::select! {
                        event = events.next() => match event {
                            Some(DebugEvent::Exited { process, role, code }) => {
                                journal_exit(journal, &process, code).await;
                                let code = plan
                                    .debug
                                    .spec(&process)
                                    .map_or(code, |spec| spec.effective_code(code));
                                info!(process = %process, ?code, "debug process exited");
                                let first = DebugOutcome { process, role, code };
                                let status = status_for(&first);
                                outcome = Some(first);
                                break status;
                            }
                            Some(other) => journal_debug_event(journal, other).await,
                            None => {
                                break TerminalStatus::Failure {
                                    reason: "debug session ended without an exit status".to_string(),
                                    exit_code: None,
                                };
                            }
                        },
                        _ = deadline_elapsed(deadline) => {
                            warn!(timeout = ?plan.timeout, "debug session timed out");
                            break TerminalStatus::Timeout;
                        }
                        _ = cancel.cancelled() => {
                            warn!("session aborted");
                            break TerminalStatus::Aborted;
                        }
                    }
                };

                machine.advance(SessionState::Draining).await?;
                if let Err(e) = self.backend.kill(handle).await {
                    warn!(error = %e, "failed to stop debug session");
                }
                let bound = self.config.timing.drain_grace + EVENT_DRAIN;
                let drained = timeout(bound, async {
                    while let Some(event) = events.next().await {
                        match event {
                            DebugEvent::Exited { process, code, .. } => {
                                journal_exit(journal, &process, code).await;
                            }
                            other => journal_debug_event(journal, other).await,
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    warn!(bound = ?bound, "debug events still pending after drain");
                }
                status
            }
        };
        if handle.is_none() {
            machine.advance(SessionState::Draining).await?;
        }

        stop.cancel();
        let summary = match monitor_task {
            Some(task) => match task.await {
                Ok(summary) => summary,
                Err(e) => {
                    error!(error = %e, "serial monitor task failed");
                    MonitorSummary::default()
                }
            },
            None => MonitorSummary::default(),
        };

        Ok(Live {
            status,
            outcome,
            summary,
        })
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("dut", &self.config.dut.name)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

fn status_for(outcome: &DebugOutcome) -> TerminalStatus {
    if outcome.success() {
        return TerminalStatus::Success;
    }
    let reason = match outcome.code {
        Some(code) => format!("{} exited with {code}", outcome.process),
        None => format!("{} exited without a status", outcome.process),
    };
    TerminalStatus::Failure {
        reason,
        exit_code: outcome.code,
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn journal_exit(journal: &Journal, process: &str, code: Option<i32>) {
    journal
        .append(JournalEvent::DebugExited {
            process: process.to_string(),
            code,
        })
        .await;
}

async fn journal_debug_event(journal: &Journal, event: DebugEvent) {
    match event {
        DebugEvent::Output {
            process,
            stream,
            text,
        } => {
            journal
                .append(JournalEvent::DebugOutput {
                    process,
                    stream,
                    text,
                })
                .await;
        }
        DebugEvent::Error { message } => {
            warn!(message = %message, "debug backend error");
            journal.append(JournalEvent::note(message)).await;
        }
        DebugEvent::Exited { process, code, .. } => journal_exit(journal, &process, code).await,
        DebugEvent::Completed => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::ProcessRole;

    #[test]
    fn first_exit_decides_status() {
        let ok = DebugOutcome {
            process: "gdb".into(),
            role: ProcessRole::Primary,
            code: Some(0),
        };
        assert_eq!(status_for(&ok), TerminalStatus::Success);

        let crashed = DebugOutcome {
            process: "openocd".into(),
            role: ProcessRole::Companion,
            code: Some(1),
        };
        assert_eq!(
            status_for(&crashed),
            TerminalStatus::Failure {
                reason: "openocd exited with 1".into(),
                exit_code: Some(1),
            }
        );
    }

    #[test]
    fn plans_default_to_a_full_cycle_and_power_down() {
        let plan = SessionPlan::new(DebugPlan::default());
        assert!(plan.power_down_after);
        assert!(plan.reconfigure);
        assert!(plan.reset);
        assert!(plan.timeout.is_none());
    }

    #[tokio::test]
    async fn no_deadline_never_fires() {
        let fired = timeout(Duration::from_millis(50), deadline_elapsed(None)).await;
        assert!(fired.is_err());
        deadline_elapsed(Some(Instant::now() + Duration::from_millis(5))).await;
    }
}
