//! Debug backend that runs real subprocesses (openocd, gdb).
//!
//! Each process gets a waiter task that owns the `Child` and publishes its
//! exit code on a watch channel, plus one forwarder task per output pipe.
//! All of them feed a single event channel per session, so the event
//! stream ends by itself once every process is gone.

use std::collections::HashMap;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::trait_def::DebugBackend;
use super::types::{
    DebugEvent, DebugHandle, DebugPlan, OutputStream, ProcessSpec, SpawnedProcess,
};

/// Default time a process gets to exit after SIGTERM.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

/// How long an exited process's pipes may keep delivering output.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

type ExitWatch = watch::Receiver<Option<Option<i32>>>;

/// Internal state kept per spawned process.
struct ProcessState {
    label: String,
    pid: u32,
    /// `Some(code)` once the process has been reaped.
    exit: ExitWatch,
    /// Cancelled to make the waiter SIGKILL the child.
    force_kill: CancellationToken,
}

struct SessionState {
    processes: Vec<ProcessState>,
    /// Taken once by `events()`.
    events: Option<mpsc::UnboundedReceiver<DebugEvent>>,
}

/// Runs each [`ProcessSpec`] as a child process.
#[derive(Clone)]
pub struct ProcessBackend {
    kill_grace: Duration,
    sessions: Arc<Mutex<HashMap<Uuid, SessionState>>>,
}

impl std::fmt::Debug for ProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBackend")
            .field("kill_grace", &self.kill_grace)
            .finish()
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::with_kill_grace(DEFAULT_KILL_GRACE)
    }

    pub fn with_kill_grace(kill_grace: Duration) -> Self {
        Self {
            kill_grace,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

// ---------------------------------------------------------------------------
// Process plumbing
// ---------------------------------------------------------------------------

fn start(spec: &ProcessSpec, events: &mpsc::UnboundedSender<DebugEvent>) -> Result<ProcessState> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "failed to spawn {} binary at '{}' -- is it installed and on PATH?",
            spec.label, spec.program
        )
    })?;
    let pid = child.id().context("child process has no pid")?;
    info!(process = %spec.label, pid, program = %spec.program, "debug process started");

    let mut forwarders = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(tokio::spawn(forward_lines(
            stdout,
            spec.label.clone(),
            OutputStream::Stdout,
            events.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(tokio::spawn(forward_lines(
            stderr,
            spec.label.clone(),
            OutputStream::Stderr,
            events.clone(),
        )));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let force_kill = CancellationToken::new();
    let token = force_kill.clone();
    let label = spec.label.clone();
    let role = spec.role;
    let events = events.clone();

    tokio::spawn(async move {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = token.cancelled() => None,
        };
        let status = match exited {
            Some(status) => status,
            None => {
                debug!(process = %label, pid, "sending SIGKILL");
                if let Err(e) = child.start_kill() {
                    warn!(process = %label, pid, error = %e, "SIGKILL failed");
                }
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!(process = %label, pid, error = %e, "failed to wait for debug process");
                None
            }
        };
        // A grandchild may still hold the pipes open.
        for mut forwarder in forwarders {
            if timeout(OUTPUT_DRAIN, &mut forwarder).await.is_err() {
                forwarder.abort();
            }
        }
        info!(process = %label, pid, ?code, "debug process exited");
        let _ = exit_tx.send(Some(code));
        let _ = events.send(DebugEvent::Exited {
            process: label,
            role,
            code,
        });
    });

    Ok(ProcessState {
        label: spec.label.clone(),
        pid,
        exit: exit_rx,
        force_kill,
    })
}

async fn forward_lines<R>(
    reader: R,
    process: String,
    stream: OutputStream,
    events: mpsc::UnboundedSender<DebugEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end_matches(['\n', '\r']).to_string();
                let event = DebugEvent::Output {
                    process: process.clone(),
                    stream,
                    text,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = events.send(DebugEvent::Error {
                    message: format!("{process} output read error: {e}"),
                });
                break;
            }
        }
    }
}

/// Exit code, or the negated signal number for signal deaths.
fn exit_code(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|s| -s))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

fn has_exited(exit: &ExitWatch) -> bool {
    exit.borrow().is_some()
}

async fn terminate(processes: &[(String, u32, ExitWatch, CancellationToken)], grace: Duration) {
    for (label, pid, exit, token) in processes {
        if has_exited(exit) {
            continue;
        }
        #[cfg(unix)]
        {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            let ret = unsafe { libc::kill(*pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(process = %label, pid, "SIGTERM failed, proceeding to SIGKILL");
                token.cancel();
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (label, pid);
            token.cancel();
        }
    }

    let deadline = Instant::now() + grace;
    for (label, pid, exit, token) in processes {
        let mut exit = exit.clone();
        let exited = timeout_at(deadline, exit.wait_for(Option::is_some))
            .await
            .is_ok_and(|r| r.is_ok());
        if !exited {
            debug!(process = %label, pid, "process did not exit after SIGTERM, sending SIGKILL");
            token.cancel();
            let _ = timeout(grace, exit.wait_for(Option::is_some)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// DebugBackend impl
// ---------------------------------------------------------------------------

#[async_trait]
impl DebugBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    async fn spawn(&self, plan: &DebugPlan) -> Result<DebugHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut started: Vec<(ProcessState, &ProcessSpec)> = Vec::new();

        for spec in &plan.processes {
            match start(spec, &tx) {
                Ok(state) => started.push((state, spec)),
                Err(e) => {
                    let running: Vec<_> = started
                        .iter()
                        .map(|(s, _)| (s.label.clone(), s.pid, s.exit.clone(), s.force_kill.clone()))
                        .collect();
                    terminate(&running, self.kill_grace).await;
                    return Err(e);
                }
            }
        }
        drop(tx);

        let id = Uuid::new_v4();
        let handle = DebugHandle {
            id,
            processes: started
                .iter()
                .map(|(state, spec)| SpawnedProcess {
                    label: spec.label.clone(),
                    role: spec.role,
                    pid: state.pid,
                })
                .collect(),
        };
        self.sessions.lock().await.insert(
            id,
            SessionState {
                processes: started.into_iter().map(|(state, _)| state).collect(),
                events: Some(rx),
            },
        );
        Ok(handle)
    }

    fn events(&self, handle: &DebugHandle) -> Pin<Box<dyn Stream<Item = DebugEvent> + Send>> {
        let id = handle.id;
        let sessions = Arc::clone(&self.sessions);

        let stream = async_stream::stream! {
            let rx = {
                let mut sessions = sessions.lock().await;
                sessions.get_mut(&id).and_then(|s| s.events.take())
            };

            let Some(mut rx) = rx else {
                warn!(session = %id, "debug events already consumed or session unknown");
                yield DebugEvent::Error {
                    message: "events not available (already consumed or session not found)".to_string(),
                };
                yield DebugEvent::Completed;
                return;
            };

            while let Some(event) = rx.recv().await {
                yield event;
            }
            sessions.lock().await.remove(&id);
            yield DebugEvent::Completed;
        };

        Box::pin(stream)
    }

    async fn kill(&self, handle: &DebugHandle) -> Result<()> {
        let running: Vec<_> = {
            let sessions = self.sessions.lock().await;
            match sessions.get(&handle.id) {
                Some(session) => session
                    .processes
                    .iter()
                    .map(|p| (p.label.clone(), p.pid, p.exit.clone(), p.force_kill.clone()))
                    .collect(),
                None => {
                    debug!(session = %handle.id, "kill called but session not tracked (already exited?)");
                    return Ok(());
                }
            }
        };
        terminate(&running, self.kill_grace).await;
        Ok(())
    }

    async fn is_running(&self, handle: &DebugHandle) -> bool {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&handle.id)
            .is_some_and(|s| s.processes.iter().any(|p| !has_exited(&p.exit)))
    }
}
