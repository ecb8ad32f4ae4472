//! Serial monitor: owns the DUT console for the length of a session.
//!
//! ```text
//! serial --read_until('\n')--> Parser --Command--> mpsc --> Dispatcher
//!    |                            |                            |
//!    `------- serial_line --------+------ protocol_error ------+--> Journal
//! ```

pub mod dispatch;
pub mod endpoint;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LabConfig;
use crate::journal::{Journal, JournalEvent};
use crate::protocol::{Command, LineOutcome, Parser};
use crate::registry::{InstrumentRegistry, ResetTiming};

pub use dispatch::{CommandError, DispatchStats};
pub use endpoint::{BoxedSerial, SerialEndpoint, SerialIo};

/// Timing knobs for a monitor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Upper bound on one command's instrument work.
    pub command_timeout: Duration,
    /// How long reading and dispatch continue after stop is requested.
    pub drain_grace: Duration,
    /// Pulse used for DUT-requested resets.
    pub reset_timing: ResetTiming,
}

impl MonitorConfig {
    pub fn from_lab(config: &LabConfig) -> Self {
        Self {
            command_timeout: config.dispatch.command_timeout,
            drain_grace: config.timing.drain_grace,
            reset_timing: ResetTiming {
                pulse: config.timing.reset_pulse,
                settle: config.timing.post_reset,
            },
        }
    }
}

/// What happened on the serial console during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    pub lines: u64,
    pub commands: u64,
    pub protocol_errors: u64,
    pub command_failures: u64,
    pub command_timeouts: u64,
    pub measurements: u64,
    pub dropped: u64,
}

impl MonitorSummary {
    /// Non-fatal problems worth flagging in the exit status.
    pub fn warnings(&self) -> u64 {
        self.protocol_errors + self.command_failures + self.dropped
    }
}

/// Reads the DUT console, journals it, and dispatches `@dutctl` commands.
#[derive(Debug, Clone)]
pub struct SerialMonitor {
    registry: Arc<InstrumentRegistry>,
    journal: Journal,
    config: MonitorConfig,
}

impl SerialMonitor {
    pub fn new(registry: Arc<InstrumentRegistry>, journal: Journal, config: MonitorConfig) -> Self {
        Self {
            registry,
            journal,
            config,
        }
    }

    /// Run until the stream ends or `stop` fires plus the drain grace.
    ///
    /// After `stop`, reading continues until the grace deadline; then the
    /// unterminated tail is journaled, queued commands that did not start
    /// are dropped, and commands that timed out are awaited.
    pub async fn run<S>(&self, io: S, stop: CancellationToken) -> MonitorSummary
    where
        S: SerialIo + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let mut reader = BufReader::new(reader);
        let (tx, rx) = mpsc::unbounded_channel();
        let expired = CancellationToken::new();

        let dispatcher = dispatch::Dispatcher::new(
            Arc::clone(&self.registry),
            self.journal.clone(),
            Box::new(writer),
            self.config.command_timeout,
            self.config.reset_timing,
        );
        let mut dispatch_task = tokio::spawn(dispatcher.run(rx, expired.clone()));

        let mut parser = Parser::new();
        let mut summary = MonitorSummary::default();
        let mut buf = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let grace_over = async move {
                match deadline {
                    Some(d) => sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => {
                        debug!("serial stream closed");
                        break;
                    }
                    Ok(_) if buf.last() == Some(&b'\n') => {
                        let line = decode_line(&buf);
                        buf.clear();
                        self.handle_line(&mut parser, &line, false, &tx, &mut summary).await;
                    }
                    // Unterminated data at EOF; the next read reports the close.
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "serial read failed");
                        self.journal
                            .append(JournalEvent::note(format!("serial read failed: {e}")))
                            .await;
                        break;
                    }
                },
                _ = stop.cancelled(), if deadline.is_none() => {
                    debug!(grace = ?self.config.drain_grace, "stop requested, draining serial");
                    deadline = Some(Instant::now() + self.config.drain_grace);
                }
                _ = grace_over => break,
            }
        }

        if !buf.is_empty() {
            let line = decode_line(&buf);
            self.handle_line(&mut parser, &line, true, &tx, &mut summary).await;
        }
        if let Some(e) = parser.finish() {
            summary.protocol_errors += 1;
            warn!(error = %e, "serial stream ended mid-directive");
            self.journal
                .append(JournalEvent::ProtocolError {
                    line: parser.lines_seen(),
                    error: e.to_string(),
                })
                .await;
        }
        drop(tx);

        let stats = loop {
            let grace_over = async move {
                match deadline {
                    Some(d) => sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                res = &mut dispatch_task => break res.unwrap_or_else(|e| {
                    warn!(error = %e, "command dispatcher failed");
                    DispatchStats::default()
                }),
                _ = stop.cancelled(), if deadline.is_none() => {
                    deadline = Some(Instant::now() + self.config.drain_grace);
                }
                _ = grace_over, if !expired.is_cancelled() => expired.cancel(),
            }
        };

        summary.command_failures = stats.failures;
        summary.command_timeouts = stats.timeouts;
        summary.measurements = stats.measurements;
        summary.dropped = stats.dropped;
        info!(
            lines = summary.lines,
            commands = summary.commands,
            protocol_errors = summary.protocol_errors,
            command_failures = summary.command_failures,
            dropped = summary.dropped,
            "serial monitor finished"
        );
        summary
    }

    async fn handle_line(
        &self,
        parser: &mut Parser,
        line: &str,
        partial: bool,
        commands: &mpsc::UnboundedSender<Command>,
        summary: &mut MonitorSummary,
    ) {
        let parsed = parser.feed(line);
        summary.lines += 1;
        self.journal
            .append(JournalEvent::SerialLine {
                line: parsed.line,
                text: line.to_string(),
                partial,
            })
            .await;

        if parsed.directive.is_some() {
            if let Some(text) = &parsed.passthrough {
                self.journal
                    .append(JournalEvent::Passthrough {
                        line: parsed.line,
                        text: text.clone(),
                    })
                    .await;
            }
        }

        match parsed.outcome {
            LineOutcome::Plain | LineOutcome::Continued => {}
            LineOutcome::Command(command) => {
                summary.commands += 1;
                debug!(line = command.line, verb = %command.verb, "command received");
                self.journal
                    .append(JournalEvent::Command {
                        line: command.line,
                        verb: command.verb,
                        args: command.args.clone(),
                        raw: command.raw.clone(),
                    })
                    .await;
                if commands.send(command).is_err() {
                    warn!(line = parsed.line, "dispatcher gone, command not executed");
                }
            }
            LineOutcome::Error(e) => {
                summary.protocol_errors += 1;
                warn!(line = parsed.line, error = %e, "protocol error");
                self.journal
                    .append(JournalEvent::ProtocolError {
                        line: parsed.line,
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }
}

/// Strip the line terminator and decode lossily.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::{ChannelConfig, SupplyConfig};
    use crate::instrument::types::{Endpoint, PairMode};
    use crate::instrument::{PowerSupply, RetryPolicy, SimHandle, SimScpi};
    use crate::journal::JournalEntry;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    fn config() -> MonitorConfig {
        MonitorConfig {
            command_timeout: Duration::from_millis(500),
            drain_grace: Duration::from_millis(100),
            reset_timing: ResetTiming {
                pulse: Duration::from_millis(1),
                settle: Duration::from_millis(1),
            },
        }
    }

    fn lab() -> (Arc<InstrumentRegistry>, SimHandle) {
        let sim = SimHandle::new("sim:psu0");
        let channel = ChannelConfig {
            voltage: 0.8,
            current: 0.2,
            voltage_min: 0.0,
            voltage_max: 1.0,
            enabled: true,
            four_wire: false,
            measure: true,
            measure_voltage: true,
        };
        let supply = SupplyConfig {
            endpoint: Endpoint::new("127.0.0.1", 5025),
            reset_pin: Some(1),
            pair_mode: PairMode::Off,
            channels: BTreeMap::from([(1, channel)]),
        };
        let psu = PowerSupply::new("psu0", supply, Box::new(SimScpi::new(sim.clone())))
            .with_apply_settle(Duration::ZERO);
        let mut registry = InstrumentRegistry::new(RetryPolicy::no_retry());
        registry.register(psu);
        (Arc::new(registry), sim)
    }

    async fn run_with(
        input: &[u8],
        registry: Arc<InstrumentRegistry>,
        config: MonitorConfig,
    ) -> (MonitorSummary, Vec<JournalEntry>, Journal, String) {
        let journal = Journal::in_memory();
        let monitor = SerialMonitor::new(registry, journal.clone(), config);
        let (mut dut, host): (DuplexStream, DuplexStream) = duplex(4096);
        dut.write_all(input).await.unwrap();
        dut.shutdown().await.unwrap();
        let summary = monitor.run(host, CancellationToken::new()).await;
        let mut echoed = String::new();
        dut.read_to_string(&mut echoed).await.unwrap();
        (summary, journal.entries().await, journal, echoed)
    }

    #[tokio::test]
    async fn monitor_runs_on_a_spawned_task() {
        let (registry, _sim) = lab();
        let journal = Journal::in_memory();
        let monitor = SerialMonitor::new(registry, journal.clone(), config());
        let (mut dut, host) = duplex(4096);
        dut.write_all(b"@dutctl report answer 42\n").await.unwrap();
        dut.shutdown().await.unwrap();

        let summary = tokio::spawn(async move { monitor.run(host, CancellationToken::new()).await })
            .await
            .unwrap();
        assert_eq!(summary.commands, 1);
        assert_eq!(journal.results().await, vec![("answer".to_string(), json!(42))]);
    }

    fn kinds(entries: &[JournalEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["kind"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn line_decoding_trims_terminators() {
        assert_eq!(decode_line(b"abc\r\n"), "abc");
        assert_eq!(decode_line(b"abc\n"), "abc");
        assert_eq!(decode_line(b"tail"), "tail");
        assert_eq!(decode_line(b"\xff\n"), "\u{fffd}");
    }

    #[tokio::test]
    async fn commands_run_in_stream_order() {
        let (registry, sim) = lab();
        registry.apply_profile("psu0", true).await.unwrap();
        let input = b"boot\r\n@dutctl set psu0 voltage 0.9 1\n@dutctl measure psu0 vset 1\n";
        let (summary, entries, _, _) = run_with(input, registry, config()).await;

        assert_eq!(summary.lines, 3);
        assert_eq!(summary.commands, 2);
        assert_eq!(summary.measurements, 1);
        assert_eq!(summary.warnings(), 0);
        assert!((sim.channel(1).unwrap().volts - 0.9).abs() < 1e-9);

        let measured: Vec<_> = entries
            .iter()
            .filter_map(|e| match &e.event {
                JournalEvent::Measurement(m) => Some(m.value),
                _ => None,
            })
            .collect();
        assert_eq!(measured.len(), 1);
        assert!((measured[0] - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn protocol_errors_are_journaled_and_harmless() {
        let (registry, sim) = lab();
        let (summary, entries, _, _) =
            run_with(b"@dutctl frobnicate 1\nstill alive\n", registry, config()).await;
        assert_eq!(summary.protocol_errors, 1);
        assert_eq!(summary.lines, 2);
        assert!(kinds(&entries).contains(&"protocol_error".to_string()));
        assert!(sim.calls().is_empty());
    }

    #[tokio::test]
    async fn sync_is_acknowledged_on_the_wire() {
        let (registry, _) = lab();
        let (summary, _, _, echoed) = run_with(b"@dutctl sync step-1\n", registry, config()).await;
        assert_eq!(summary.commands, 1);
        assert_eq!(echoed, "@dutctl ack step-1\n");
    }

    #[tokio::test]
    async fn reports_and_snapshots_become_results() {
        let (registry, _) = lab();
        registry.apply_profile("psu0", true).await.unwrap();
        let input = b"@dutctl report cycles 1234\n@dutctl snapshot done psu0\n";
        let (summary, _, journal, _) = run_with(input, registry, config()).await;
        assert_eq!(summary.measurements, 2);
        let results = journal.results().await;
        assert_eq!(results[0], ("cycles".to_string(), json!(1234)));
        assert_eq!(results[1].0, "done");
        assert!(results[1].1["psu0"]["1"]["cur"].is_number());
        assert!(results[1].1["psu0"]["1"]["vol"].is_number());
    }

    #[tokio::test]
    async fn instrument_failures_do_not_stop_the_monitor() {
        let (registry, _) = lab();
        let input = b"@dutctl measure ghost voltage\n@dutctl report ok 1\n";
        let (summary, entries, journal, _) = run_with(input, registry, config()).await;
        assert_eq!(summary.command_failures, 1);
        assert_eq!(journal.results().await.len(), 1);
        assert!(kinds(&entries).contains(&"command_failed".to_string()));
    }

    #[tokio::test]
    async fn slow_commands_time_out_and_are_awaited() {
        let (registry, sim) = lab();
        sim.set_delay(Duration::from_millis(200));
        let config = MonitorConfig {
            command_timeout: Duration::from_millis(50),
            ..config()
        };
        let (summary, entries, _, _) =
            run_with(b"@dutctl set psu0 voltage 0.5 1\n", registry, config).await;
        assert_eq!(summary.command_timeouts, 1);
        assert_eq!(summary.command_failures, 1);
        // The straggler finished before the monitor returned.
        assert!((sim.channel(1).unwrap().volts - 0.5).abs() < 1e-9);
        let failed = entries.iter().find_map(|e| match &e.event {
            JournalEvent::CommandFailed { timeout, .. } => Some(*timeout),
            _ => None,
        });
        assert_eq!(failed, Some(true));
    }

    #[tokio::test]
    async fn partial_tail_and_truncated_continuation() {
        let (registry, _) = lab();
        let (summary, entries, _, _) =
            run_with(b"@dutctl report msg part \\\ntail \\", registry, config()).await;
        assert_eq!(summary.lines, 2);
        assert_eq!(summary.protocol_errors, 1);
        assert_eq!(summary.commands, 0);
        let partial = entries.iter().any(|e| {
            matches!(&e.event, JournalEvent::SerialLine { partial: true, text, .. } if text == "tail \\")
        });
        assert!(partial);
    }

    #[tokio::test]
    async fn stop_bounds_the_drain_and_drops_queued_commands() {
        let (registry, _) = lab();
        let journal = Journal::in_memory();
        let monitor = SerialMonitor::new(registry, journal.clone(), config());
        let (mut dut, host) = duplex(4096);
        dut.write_all(b"@dutctl wait 10000\n@dutctl report late 1\n")
            .await
            .unwrap();

        let stop = CancellationToken::new();
        let run = tokio::spawn({
            let stop = stop.clone();
            async move { monitor.run(host, stop).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = std::time::Instant::now();
        stop.cancel();
        let summary = run.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(summary.dropped, 2);
        assert!(journal.results().await.is_empty());
        drop(dut);
    }
}
