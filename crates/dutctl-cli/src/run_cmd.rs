//! `dutctl run`: one full session.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tokio_util::sync::CancellationToken;

use dutctl_core::ConfigError;
use dutctl_core::debug::{DebugPlan, ProcessBackend, Toolchain};
use dutctl_core::monitor::SerialEndpoint;
use dutctl_core::session::{Orchestrator, SerialSource, SessionPlan, SessionReport};

use crate::config::CliContext;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// gdb command script
    #[arg(long)]
    pub gdb: PathBuf,
    /// openocd board configuration; omit to let the script connect itself
    #[arg(long)]
    pub ocd: Option<PathBuf>,
    /// Firmware image passed to gdb
    #[arg(long)]
    pub binary: Option<PathBuf>,
    /// DUT console: DEVICE[:BAUD] or tcp://HOST:PORT
    #[arg(long, env = "DUTCTL_UART")]
    pub uart: Option<String>,
    /// Wall-clock limit for the debug session, in seconds
    #[arg(long)]
    pub timeout: Option<f64>,
    /// Leave supplies and clocks on after the run
    #[arg(long)]
    pub keep_powered: bool,
    /// Skip power cycling and instrument reconfiguration
    #[arg(long)]
    pub no_reconf: bool,
    /// Skip the reset pulse
    #[arg(long)]
    pub no_reset: bool,
    /// openocd executable
    #[arg(long, env = "DUTCTL_OPENOCD")]
    pub ocd_bin: Option<String>,
    /// gdb executable
    #[arg(long, env = "DUTCTL_GDB")]
    pub gdb_bin: Option<String>,
}

impl RunArgs {
    fn session_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        let Some(secs) = self.timeout else {
            return Ok(None);
        };
        if !secs.is_finite() || secs <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "--timeout must be a positive number of seconds, got {secs}"
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("--timeout {secs} is out of range: {e}")))
    }

    fn serial_source(&self) -> Result<Option<SerialSource>, ConfigError> {
        let Some(uart) = &self.uart else {
            return Ok(None);
        };
        let endpoint = uart
            .parse::<SerialEndpoint>()
            .map_err(|e| ConfigError::Invalid(format!("invalid --uart {uart:?}: {e:#}")))?;
        Ok(Some(SerialSource::Endpoint(endpoint)))
    }

    fn toolchain(&self) -> Toolchain {
        let mut toolchain = Toolchain::default();
        if let Some(bin) = &self.ocd_bin {
            toolchain.openocd = bin.clone();
        }
        if let Some(bin) = &self.gdb_bin {
            toolchain.gdb = bin.clone();
        }
        toolchain
    }

    pub fn into_plan(self) -> Result<SessionPlan> {
        let timeout = self.session_timeout()?;
        let serial = self.serial_source()?;
        let debug = DebugPlan::openocd_gdb(
            &self.toolchain(),
            self.ocd.as_deref(),
            &self.gdb,
            self.binary.as_deref(),
        );

        let mut plan = SessionPlan::new(debug);
        plan.target_binary = self.binary;
        plan.debug_script = Some(self.gdb);
        plan.serial = serial;
        plan.timeout = timeout;
        plan.power_down_after = !self.keep_powered;
        plan.reconfigure = !self.no_reconf;
        plan.reset = !self.no_reset;
        Ok(plan)
    }
}

/// Cancel on the first Ctrl-C; exit with 130 on the second.
fn install_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nAborting session, powering down (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });
    cancel
}

pub async fn run_session(ctx: &CliContext, args: RunArgs) -> Result<i32> {
    let plan = args.into_plan()?;
    let journal = ctx.journal("run").await?;
    let orchestrator = Orchestrator::new(
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.registry),
        Arc::new(ProcessBackend::new()),
    );

    let cancel = install_signal_handler();
    let report = orchestrator.run(plan, journal.clone(), cancel).await?;
    print_report(&report, journal.dir().await, ctx.simulate);
    Ok(report.exit_code())
}

fn print_report(report: &SessionReport, dir: Option<PathBuf>, simulated: bool) {
    let record = &report.record;
    let suffix = if simulated { " (simulated)" } else { "" };
    println!("Session {} on {}{suffix}: {}", record.id, record.dut, report.status());
    println!(
        "  serial: {} lines, {} commands, {} protocol errors, {} command failures",
        report.summary.lines,
        report.summary.commands,
        report.summary.protocol_errors,
        report.summary.command_failures,
    );
    if let Some(debug) = &report.debug {
        match debug.code {
            Some(code) => println!("  {} exited with {code}", debug.process),
            None => println!("  {} exited without a status", debug.process),
        }
    }
    if let Some(dir) = dir {
        println!("  journal: {}", dir.display());
    }
    println!("  exit code: {}", report.exit_code());
}
