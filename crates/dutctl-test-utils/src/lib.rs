//! Shared test utilities for dutctl integration tests.
//!
//! - [`SimLab`]: a stamped sample configuration with every instrument
//!   backed by the SCPI simulator.
//! - [`ScriptedBackend`]: a debug backend that replays canned output and
//!   exits (or hangs until killed) without spawning processes.
//! - [`serial_pair`]: an in-memory DUT console.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt;
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use dutctl_core::config::{parse_lab_config, stamp_safety_hash};
use dutctl_core::debug::{
    DebugBackend, DebugEvent, DebugHandle, DebugPlan, OutputStream, ProcessRole, SpawnedProcess,
};
use dutctl_core::instrument::{SimHandle, SimTransportFactory};
use dutctl_core::{InstrumentRegistry, Journal, LabConfig};

// ===========================================================================
// Simulated lab
// ===========================================================================

/// Sample lab: one two-channel supply driving the reset line, one clock
/// generator with a leak-off source, and a generic meter.
pub fn sample_config_toml() -> &'static str {
    r#"
[dut]
name = "chip0"
reset = "psu0"

[supplies.psu0]
address = "10.0.0.10:5025"
reset_pin = 1

[supplies.psu0.channels.1]
voltage = 0.8
current = 0.2
measure = true
measure_voltage = true

[supplies.psu0.channels.2]
voltage = 1.8
current = 0.1

[clocks.gen0]
address = "10.0.0.20"

[clocks.gen0.sources.1]
frequency = 25e6
high = 0.8
low = 0.0
leak_off = true

[generic.dmm0]
address = "10.0.0.30"

[timing]
reset_pulse_ms = 5
post_reset_ms = 5
power_settle_ms = 5
standby_wait_ms = 5
leak_wait_ms = 5
drain_grace_ms = 100

[retry]
max_attempts = 3
initial_backoff_ms = 1
max_backoff_ms = 5
io_timeout_ms = 500

[dispatch]
command_timeout_ms = 1000
"#
}

/// A configured registry whose instruments all talk to the simulator.
pub struct SimLab {
    pub config: Arc<LabConfig>,
    pub registry: Arc<InstrumentRegistry>,
    pub factory: SimTransportFactory,
}

impl SimLab {
    /// Build the lab from [`sample_config_toml`].
    pub fn new() -> Self {
        Self::from_toml(sample_config_toml())
    }

    /// Build the lab from an unstamped TOML body.
    pub fn from_toml(body: &str) -> Self {
        let stamped = stamp_safety_hash(body).expect("stamp sample config");
        let config = parse_lab_config(&stamped).expect("parse sample config");
        let factory = SimTransportFactory::new();
        let registry = InstrumentRegistry::from_config(&config, &factory);
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            factory,
        }
    }

    /// Simulator behind instrument `name`.
    pub fn handle(&self, name: &str) -> SimHandle {
        self.factory
            .handle(name)
            .unwrap_or_else(|| panic!("no simulated instrument named {name}"))
    }

    /// True when no simulated instrument is driving an output.
    pub fn all_outputs_off(&self) -> bool {
        self.factory
            .handles()
            .iter()
            .all(|(_, handle)| handle.all_outputs_off())
    }
}

impl Default for SimLab {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory console: `(host side, DUT side)`.
pub fn serial_pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(64 * 1024)
}

/// A fresh in-memory journal.
pub fn memory_journal() -> Journal {
    Journal::in_memory()
}

// ===========================================================================
// Scripted debug backend
// ===========================================================================

/// What a [`ScriptedBackend`] session does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Print `output` on the primary's stdout, then exit with `code` after
    /// `after`.
    Exit {
        output: Vec<String>,
        code: i32,
        after: Duration,
    },
    /// Print `output` and run until killed.
    Hang { output: Vec<String> },
    /// Fail to spawn.
    SpawnError(String),
}

struct ScriptedSession {
    events: Option<mpsc::UnboundedReceiver<DebugEvent>>,
    kill: watch::Sender<bool>,
}

/// A [`DebugBackend`] driven by a [`Script`] instead of real processes.
pub struct ScriptedBackend {
    script: Script,
    sessions: Arc<Mutex<HashMap<Uuid, ScriptedSession>>>,
    kills: Arc<AtomicUsize>,
    spawns: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            kills: Arc::new(AtomicUsize::new(0)),
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Exit zero right away after printing `output`.
    pub fn succeeding(output: &[&str]) -> Self {
        Self::new(Script::Exit {
            output: output.iter().map(|s| s.to_string()).collect(),
            code: 0,
            after: Duration::from_millis(10),
        })
    }

    pub fn exiting_after(code: i32, after: Duration) -> Self {
        Self::new(Script::Exit {
            output: Vec::new(),
            code,
            after,
        })
    }

    pub fn hanging() -> Self {
        Self::new(Script::Hang { output: Vec::new() })
    }

    /// How many times `kill` was called.
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DebugBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn spawn(&self, plan: &DebugPlan) -> Result<DebugHandle> {
        if let Script::SpawnError(message) = &self.script {
            anyhow::bail!("{message}");
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let primary = plan
            .processes
            .iter()
            .find(|p| p.role == ProcessRole::Primary)
            .or_else(|| plan.processes.first())
            .ok_or_else(|| anyhow::anyhow!("empty debug plan"))?;
        let label = primary.label.clone();
        let role = primary.role;

        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = watch::channel(false);
        let script = self.script.clone();
        let process = label.clone();
        tokio::spawn(async move {
            let (output, exit) = match script {
                Script::Exit {
                    output,
                    code,
                    after,
                } => (output, Some((code, after))),
                Script::Hang { output } => (output, None),
                Script::SpawnError(_) => return,
            };
            for text in output {
                let _ = tx.send(DebugEvent::Output {
                    process: process.clone(),
                    stream: OutputStream::Stdout,
                    text,
                });
            }
            let code = match exit {
                Some((code, after)) => tokio::select! {
                    _ = tokio::time::sleep(after) => code,
                    _ = kill_rx.changed() => -15,
                },
                None => {
                    let _ = kill_rx.changed().await;
                    -15
                }
            };
            let _ = tx.send(DebugEvent::Exited {
                process,
                role,
                code: Some(code),
            });
        });

        let handle = DebugHandle {
            id: Uuid::new_v4(),
            processes: vec![SpawnedProcess {
                label,
                role,
                pid: 0,
            }],
        };
        self.sessions.lock().await.insert(
            handle.id,
            ScriptedSession {
                events: Some(rx),
                kill: kill_tx,
            },
        );
        Ok(handle)
    }

    fn events(&self, handle: &DebugHandle) -> Pin<Box<dyn Stream<Item = DebugEvent> + Send>> {
        let key = handle.id;
        let sessions = Arc::clone(&self.sessions);
        let stream = futures::stream::once(async move {
            sessions
                .lock()
                .await
                .get_mut(&key)
                .and_then(|s| s.events.take())
        })
        .flat_map(|rx| match rx {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::iter(vec![DebugEvent::Error {
                message: "events already consumed".to_string(),
            }])
            .boxed(),
        })
        .chain(futures::stream::iter(vec![DebugEvent::Completed]));
        Box::pin(stream)
    }

    async fn kill(&self, handle: &DebugHandle) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.sessions.lock().await.get(&handle.id) {
            let _ = session.kill.send(true);
        }
        Ok(())
    }

    async fn is_running(&self, handle: &DebugHandle) -> bool {
        self.sessions
            .lock()
            .await
            .get(&handle.id)
            .is_some_and(|s| !*s.kill.borrow())
    }
}
