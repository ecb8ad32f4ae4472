//! Sequential execution of commands decoded from the serial stream.
//!
//! The dispatcher takes commands in stream order and runs one at a time.
//! Instrument work runs in its own task raced against the command timeout;
//! a task that loses the race keeps running (it holds the instrument lock
//! and will finish or fail cleanly) and is awaited before the dispatcher
//! returns.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::instrument::{Capability, InstrumentError, Setting};
use crate::journal::{Journal, JournalEvent, MeasurementRecord};
use crate::protocol::{Command, Directive, MARKER, Setpoint};
use crate::registry::{InstrumentRegistry, ResetTiming, readings_to_json};

/// Why a dispatched command did not complete.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error("failed to acknowledge sync: {0}")]
    Ack(String),

    #[error("command task failed: {0}")]
    Task(String),
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout(_))
    }
}

/// Counters reported by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub executed: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub measurements: u64,
    pub dropped: u64,
}

pub(crate) type AckWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Straggler = (u64, JoinHandle<Result<u64, InstrumentError>>);

pub(crate) struct Dispatcher {
    registry: Arc<InstrumentRegistry>,
    journal: Journal,
    ack: AckWriter,
    command_timeout: Duration,
    reset_timing: ResetTiming,
    stragglers: Vec<Straggler>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<InstrumentRegistry>,
        journal: Journal,
        ack: AckWriter,
        command_timeout: Duration,
        reset_timing: ResetTiming,
    ) -> Self {
        Self {
            registry,
            journal,
            ack,
            command_timeout,
            reset_timing,
            stragglers: Vec::new(),
            stats: DispatchStats::default(),
        }
    }

    /// Execute commands until the queue closes or `expired` fires; whatever
    /// is still queued then is journaled as dropped.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        expired: CancellationToken,
    ) -> DispatchStats {
        loop {
            let command = tokio::select! {
                biased;
                _ = expired.cancelled() => break,
                next = commands.recv() => match next {
                    Some(command) => command,
                    None => break,
                },
            };
            if !self.execute(command, &expired).await {
                break;
            }
        }

        commands.close();
        while let Some(command) = commands.recv().await {
            self.drop_command(&command).await;
        }

        for (line, handle) in std::mem::take(&mut self.stragglers) {
            match handle.await {
                Ok(Ok(measurements)) => {
                    debug!(line, "late command finished");
                    self.stats.measurements += measurements;
                }
                Ok(Err(e)) => warn!(line, error = %e, "late command failed"),
                Err(e) => warn!(line, error = %e, "late command task failed"),
            }
        }
        self.stats
    }

    async fn drop_command(&mut self, command: &Command) {
        self.stats.dropped += 1;
        warn!(line = command.line, verb = %command.verb, "command dropped at end of session");
        self.journal
            .append(JournalEvent::CommandDropped {
                line: command.line,
                verb: command.verb,
                raw: command.raw.clone(),
            })
            .await;
    }

    /// Returns `false` if the drain deadline passed mid-command.
    async fn execute(&mut self, command: Command, expired: &CancellationToken) -> bool {
        if !command.delay.is_zero() && !pause(command.delay, expired).await {
            self.drop_command(&command).await;
            return false;
        }

        let result = match &command.directive {
            Directive::Wait { duration } => {
                if !pause(*duration, expired).await {
                    self.drop_command(&command).await;
                    return false;
                }
                Ok(())
            }
            Directive::Sync { token } => self.acknowledge(token).await,
            Directive::Report { key, value } => {
                self.report(key, value.clone(), command.line).await;
                Ok(())
            }
            _ => self.run_instrument_command(&command).await,
        };

        self.stats.executed += 1;
        if let Err(e) = result {
            self.stats.failures += 1;
            if e.is_timeout() {
                self.stats.timeouts += 1;
            }
            warn!(line = command.line, verb = %command.verb, error = %e, "command failed");
            self.journal
                .append(JournalEvent::CommandFailed {
                    line: command.line,
                    verb: command.verb,
                    error: e.to_string(),
                    timeout: e.is_timeout(),
                })
                .await;
        }
        true
    }

    async fn acknowledge(&mut self, token: &str) -> Result<(), CommandError> {
        let reply = format!("{MARKER} ack {token}\n");
        let limit = self.command_timeout;
        let ack = &mut self.ack;
        let write = async move {
            ack.write_all(reply.as_bytes()).await?;
            ack.flush().await
        };
        match timeout(limit, write).await {
            Ok(Ok(())) => {
                debug!(token, "sync acknowledged");
                Ok(())
            }
            Ok(Err(e)) => Err(CommandError::Ack(e.to_string())),
            Err(_) => Err(CommandError::Timeout(limit)),
        }
    }

    async fn report(&mut self, key: &str, value: Value, line: u64) {
        info!(key, %value, "DUT result");
        self.journal
            .append(JournalEvent::DutResult {
                key: key.to_string(),
                value: value.clone(),
                line,
            })
            .await;
        self.journal.push_result(key, value).await;
    }

    async fn run_instrument_command(&mut self, command: &Command) -> Result<(), CommandError> {
        let registry = Arc::clone(&self.registry);
        let journal = self.journal.clone();
        let directive = command.directive.clone();
        let line = command.line;
        let reset_timing = self.reset_timing;

        let mut handle = tokio::spawn(async move {
            execute_directive(&registry, &journal, directive, line, reset_timing).await
        });

        match timeout(self.command_timeout, &mut handle).await {
            Ok(Ok(Ok(measurements))) => {
                self.stats.measurements += measurements;
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(e)) => Err(CommandError::Task(e.to_string())),
            Err(_) => {
                self.stragglers.push((line, handle));
                Err(CommandError::Timeout(self.command_timeout))
            }
        }
    }
}

/// Sleep for `duration` unless `expired` fires first.
async fn pause(duration: Duration, expired: &CancellationToken) -> bool {
    tokio::select! {
        _ = sleep(duration) => true,
        _ = expired.cancelled() => false,
    }
}

/// Run one instrument directive; returns the number of measurements taken.
async fn execute_directive(
    registry: &InstrumentRegistry,
    journal: &Journal,
    directive: Directive,
    line: u64,
    reset_timing: ResetTiming,
) -> Result<u64, InstrumentError> {
    match directive {
        Directive::Measure {
            instrument,
            metric,
            channel,
        } => {
            let channel = match channel {
                Some(c) => c,
                None => registry.default_channel(&instrument)?,
            };
            let metric = metric.to_metric(channel);
            let measurement = registry.query(&instrument, metric).await?;
            info!(instrument = %instrument, %metric, %measurement, "measured");
            journal
                .append(JournalEvent::Measurement(MeasurementRecord {
                    instrument,
                    metric,
                    value: measurement.value,
                    unit: measurement.unit,
                    key: None,
                    command_line: Some(line),
                }))
                .await;
            Ok(1)
        }
        Directive::Set {
            instrument,
            setpoint,
            channel,
        } => {
            let channel = match channel {
                Some(c) => c,
                None => registry.default_channel(&instrument)?,
            };
            let setting = match setpoint {
                Setpoint::Output(enabled)
                    if !registry.capabilities(&instrument)?.contains(Capability::Power) =>
                {
                    Setting::ClockOutput {
                        source: channel,
                        enabled,
                    }
                }
                other => other.to_setting(channel),
            };
            info!(instrument = %instrument, %setting, "applying setting");
            registry.configure(&instrument, &[setting]).await?;
            Ok(0)
        }
        Directive::Reset { instrument } => {
            info!(instrument = %instrument, "reset requested by DUT");
            registry.reset_cycle(&instrument, reset_timing).await?;
            Ok(0)
        }
        Directive::Snapshot {
            key,
            instrument,
            channel,
        } => {
            let readings = registry.measure_flagged(instrument.as_deref(), channel).await?;
            for reading in &readings {
                journal
                    .append(JournalEvent::Measurement(MeasurementRecord {
                        instrument: reading.instrument.clone(),
                        metric: reading.metric,
                        value: reading.measurement.value,
                        unit: reading.measurement.unit,
                        key: Some(key.clone()),
                        command_line: Some(line),
                    }))
                    .await;
            }
            journal.push_result(key, readings_to_json(&readings)).await;
            Ok(readings.len() as u64)
        }
        Directive::Wait { .. } | Directive::Sync { .. } | Directive::Report { .. } => Ok(0),
    }
}
