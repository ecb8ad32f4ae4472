//! Session orchestration tests against the simulated lab.
//!
//! Every test runs a full [`Orchestrator::run`] with simulated instruments
//! and a [`ScriptedBackend`] standing in for openocd/gdb.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use dutctl_core::debug::{DebugPlan, Toolchain};
use dutctl_core::instrument::Metric;
use dutctl_core::journal::{JournalEvent, MEASUREMENTS_FILE, SESSION_FILE};
use dutctl_core::session::{
    Orchestrator, STANDBY_KEY, SerialSource, SessionError, SessionPlan, TerminalStatus,
};
use dutctl_core::Journal;
use dutctl_test_utils::{Script, ScriptedBackend, SimLab, serial_pair};

// ===========================================================================
// Helpers
// ===========================================================================

fn orchestrator(lab: &SimLab, backend: &Arc<ScriptedBackend>) -> Orchestrator {
    Orchestrator::new(
        Arc::clone(&lab.config),
        Arc::clone(&lab.registry),
        backend.clone(),
    )
}

fn plan() -> SessionPlan {
    let debug = DebugPlan::openocd_gdb(
        &Toolchain::default(),
        Some(Path::new("target.cfg")),
        Path::new("run.gdb"),
        Some(Path::new("fw.elf")),
    );
    let mut plan = SessionPlan::new(debug);
    plan.debug_script = Some("run.gdb".into());
    plan.target_binary = Some("fw.elf".into());
    plan
}

async fn transitions(journal: &Journal) -> Vec<(String, String)> {
    journal
        .entries()
        .await
        .into_iter()
        .filter_map(|e| match e.event {
            JournalEvent::Transition { from, to } => Some((from, to)),
            _ => None,
        })
        .collect()
}

fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn successful_session_runs_dut_commands_and_powers_down() {
    let lab = SimLab::new();
    let backend = Arc::new(ScriptedBackend::exiting_after(0, Duration::from_millis(300)));
    let orch = orchestrator(&lab, &backend);

    let (host, mut dut) = serial_pair();
    dut.write_all(
        b"boot ok\n\
          @dutctl set psu0 voltage 0.75 1\n\
          @dutctl measure psu0 vset 1\n\
          @dutctl report result 0x2a\n",
    )
    .await
    .unwrap();

    let mut plan = plan();
    plan.serial = Some(SerialSource::Stream(Box::new(host)));
    let journal = Journal::in_memory();
    let report = orch
        .run(plan, journal.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status(), &TerminalStatus::Success);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.lines, 4);
    assert_eq!(report.summary.commands, 3);
    assert_eq!(report.summary.warnings(), 0);
    assert_eq!(report.debug.as_ref().map(|d| d.code), Some(Some(0)));
    assert!(lab.all_outputs_off(), "outputs must be off after the run");

    let setpoint = journal.entries().await.into_iter().find_map(|e| match e.event {
        JournalEvent::Measurement(m) if m.metric == Metric::VoltageSetpoint { channel: 1 } => {
            Some(m.value)
        }
        _ => None,
    });
    assert!((setpoint.unwrap() - 0.75).abs() < 1e-9);

    let results = journal.results().await;
    assert!(results.iter().any(|(k, _)| k == STANDBY_KEY));
    assert!(results
        .iter()
        .any(|(k, v)| k == "result" && *v == serde_json::json!(42)));

    assert_eq!(
        transitions(&journal).await,
        pairs(&[
            ("idle", "configuring"),
            ("configuring", "power_cycling"),
            ("power_cycling", "session_running"),
            ("session_running", "draining"),
            ("draining", "terminated"),
        ])
    );
    drop(dut);
}

#[tokio::test]
async fn hung_debug_session_times_out_and_still_powers_down() {
    let lab = SimLab::new();
    let backend = Arc::new(ScriptedBackend::hanging());
    let orch = orchestrator(&lab, &backend);

    let limit = Duration::from_millis(300);
    let mut plan = plan();
    plan.timeout = Some(limit);

    let started = Instant::now();
    let report = orch
        .run(plan, Journal::in_memory(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status(), &TerminalStatus::Timeout);
    assert_eq!(report.exit_code(), 4);
    assert!(backend.kills() >= 1);
    assert!(lab.all_outputs_off());
    // Power cycling, the limit itself and a bounded drain.
    assert!(started.elapsed() < limit + Duration::from_secs(3));
}

#[tokio::test]
async fn configuration_errors_touch_no_instrument() {
    let lab = SimLab::new();
    let backend = Arc::new(ScriptedBackend::succeeding(&[]));
    let orch = orchestrator(&lab, &backend);

    let journal = Journal::in_memory();
    let report = orch
        .run(
            SessionPlan::new(DebugPlan::default()),
            journal.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(report.status(), TerminalStatus::ConfigError { .. }));
    assert_eq!(report.exit_code(), 2);
    assert_eq!(backend.spawns(), 0);
    for name in ["psu0", "gen0", "dmm0"] {
        assert!(lab.handle(name).calls().is_empty(), "{name} was touched");
    }
    assert_eq!(
        transitions(&journal).await,
        pairs(&[("idle", "configuring"), ("configuring", "terminated")])
    );
}

#[tokio::test]
async fn failing_debug_session_is_a_failure() {
    let lab = SimLab::new();
    let backend = Arc::new(ScriptedBackend::exiting_after(1, Duration::from_millis(20)));
    let orch = orchestrator(&lab, &backend);

    let report = orch
        .run(plan(), Journal::in_memory(), CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        report.status(),
        TerminalStatus::Failure {
            exit_code: Some(1),
            ..
        }
    ));
    assert_eq!(report.exit_code(), 1);
    assert!(lab.all_outputs_off());
}

#[tokio::test]
async fn spawn_failure_is_a_failure_and_powers_down() {
    let lab = SimLab::new();
    let backend = Arc::new(ScriptedBackend::new(Script::SpawnError(
        "gdb not found".into(),
    )));
    let orch = orchestrator(&lab, &backend);

    let journal = Journal::in_memory();
    let report = orch
        .run(plan(), journal.clone(), CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        report.status(),
        TerminalStatus::Failure { exit_code: None, .. }
    ));
    assert_eq!(report.exit_code(), 1);
    assert!(lab.all_outputs_off());
    assert!(transitions(&journal)
        .await
        .contains(&("session_running".to_string(), "draining".to_string())));
}

#[tokio::test]
async fn cancellation_aborts_the_session() {
    let lab = SimLab::new();
    let backend = Arc::new(ScriptedBackend::hanging());
    let orch = orchestrator(&lab, &backend);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });

    let report = orch
        .run(plan(), Journal::in_memory(), cancel)
        .await
        .unwrap();
    assert_eq!(report.status(), &TerminalStatus::Aborted);
    assert_eq!(report.exit_code(), 130);
    assert!(backend.kills() >= 1);
    assert!(lab.all_outputs_off());
}

#[tokio::test]
async fn only_one_session_per_dut() {
    let lab = SimLab::new();
    let backend = Arc::new(ScriptedBackend::hanging());
    let orch = orchestrator(&lab, &backend);

    let mut first_plan = plan();
    first_plan.timeout = Some(Duration::from_millis(500));
    let first = orch.run(first_plan, Journal::in_memory(), CancellationToken::new());
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.run(plan(), Journal::in_memory(), CancellationToken::new())
            .await
    };

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap().status(), &TerminalStatus::Timeout);
    assert!(matches!(second, Err(SessionError::Busy { dut }) if dut == "chip0"));
}

#[tokio::test]
async fn protocol_warnings_raise_the_exit_code() {
    let lab = SimLab::new();
    let backend = Arc::new(ScriptedBackend::exiting_after(0, Duration::from_millis(200)));
    let orch = orchestrator(&lab, &backend);

    let (host, mut dut) = serial_pair();
    dut.write_all(b"@dutctl frobnicate 1\n").await.unwrap();

    let mut plan = plan();
    plan.serial = Some(SerialSource::Stream(Box::new(host)));
    let report = orch
        .run(plan, Journal::in_memory(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status(), &TerminalStatus::Success);
    assert_eq!(report.summary.protocol_errors, 1);
    assert_eq!(report.exit_code(), 3);
    drop(dut);
}

#[tokio::test]
async fn keep_powered_and_skip_reconfiguration() {
    let lab = SimLab::new();
    let backend = Arc::new(ScriptedBackend::succeeding(&["Breakpoint 1, main ()"]));
    let orch = orchestrator(&lab, &backend);

    // A first run leaves the DUT powered.
    let mut powered = plan();
    powered.power_down_after = false;
    let report = orch
        .run(powered, Journal::in_memory(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(lab.handle("psu0").channel(1).unwrap().output);

    // A second run reuses that state without cycling power.
    let psu = lab.handle("psu0");
    psu.clear_calls();
    let mut reuse = plan();
    reuse.reconfigure = false;
    reuse.reset = false;
    reuse.power_down_after = false;
    let journal = Journal::in_memory();
    let report = orch
        .run(reuse, journal.clone(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(psu.commands().iter().all(|c| c != "*RST"));
    assert!(psu.channel(1).unwrap().output);

    let output = journal.entries().await.into_iter().any(|e| {
        matches!(e.event, JournalEvent::DebugOutput { ref text, .. } if text == "Breakpoint 1, main ()")
    });
    assert!(output);
}

#[tokio::test]
async fn file_journal_is_finalized() {
    let dir = tempfile::tempdir().unwrap();
    let lab = SimLab::new();
    let backend = Arc::new(ScriptedBackend::succeeding(&["hello"]));
    let orch = orchestrator(&lab, &backend);

    let journal = Journal::create(dir.path()).await.unwrap();
    let report = orch
        .run(plan(), journal, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.exit_code(), 0);

    let session: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join(SESSION_FILE)).unwrap()).unwrap();
    assert_eq!(session["status"], "success");
    assert_eq!(session["exit_code"], 0);
    assert_eq!(session["dut"], "chip0");

    let measurements: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join(MEASUREMENTS_FILE)).unwrap())
            .unwrap();
    let keys: Vec<&str> = measurements
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|entry| entry.as_object().unwrap().keys().map(String::as_str))
        .collect();
    assert_eq!(keys, vec![STANDBY_KEY]);

    let journal_text = std::fs::read_to_string(dir.path().join("journal.jsonl")).unwrap();
    let seqs: Vec<u64> = journal_text
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["seq"].as_u64().unwrap())
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert!(journal_text.contains("\"kind\":\"session_ended\""));
}
