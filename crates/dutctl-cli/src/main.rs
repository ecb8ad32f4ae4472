mod action_cmds;
mod config;
mod run_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use dutctl_core::ConfigError;

use config::CliContext;

#[derive(Parser)]
#[command(name = "dutctl", about = "Bring-up and remote operation of a device under test")]
struct Cli {
    /// Lab configuration file
    #[arg(short, long, global = true, env = "DUTCTL_CONFIG", default_value = "dutctl.toml")]
    config: PathBuf,

    /// Directory that receives one journal directory per invocation
    #[arg(short, long, global = true, env = "DUTCTL_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Keep the journal in memory and write nothing to disk
    #[arg(long, global = true)]
    no_journal: bool,

    /// Talk to simulated instruments instead of the lab
    #[arg(long, global = true)]
    simulate: bool,

    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Power cycle the DUT and run a scripted debug session
    Run(run_cmd::RunArgs),
    /// Full power and reset cycle
    Cycle,
    /// Pulse the DUT reset line
    Reset,
    /// Read every channel flagged for measurement
    Measure,
    /// Switch all clock and supply outputs off
    Poweroff,
    /// Power cycle, stop leak-off clocks and measure
    Leak,
    /// Print the safety hash of a configuration file
    Hash {
        /// Configuration file to hash
        file: PathBuf,
    },
}

/// Exit status for errors that escape a command.
fn error_exit_code(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.is::<ConfigError>()) {
        2
    } else {
        1
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    if let Commands::Hash { file } = &cli.command {
        config::print_hash(file)?;
        return Ok(0);
    }

    let log_dir = (!cli.no_journal).then(|| cli.log_dir.clone());
    let ctx = CliContext::load(&cli.config, log_dir, cli.simulate)?;
    match cli.command {
        Commands::Run(args) => run_cmd::run_session(&ctx, args).await,
        Commands::Cycle => action_cmds::run_action(&ctx, action_cmds::Action::Cycle).await,
        Commands::Reset => action_cmds::run_action(&ctx, action_cmds::Action::Reset).await,
        Commands::Measure => action_cmds::run_action(&ctx, action_cmds::Action::Measure).await,
        Commands::Poweroff => action_cmds::run_action(&ctx, action_cmds::Action::PowerOff).await,
        Commands::Leak => action_cmds::run_action(&ctx, action_cmds::Action::Leak).await,
        Commands::Hash { .. } => Ok(0),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            error_exit_code(&e)
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_exit_two() {
        let err = anyhow::Error::new(ConfigError::Invalid("dut.reset names no supply".into()))
            .context("failed to load lab configuration");
        assert_eq!(error_exit_code(&err), 2);
        assert_eq!(error_exit_code(&anyhow::anyhow!("connection refused")), 1);
    }

    #[test]
    fn journal_is_persisted_by_default() {
        let cli = Cli::try_parse_from(["dutctl", "cycle"]).unwrap();
        assert!(!cli.no_journal);
        if std::env::var_os("DUTCTL_LOG_DIR").is_none() {
            assert_eq!(cli.log_dir, PathBuf::from("logs"));
        }

        let cli = Cli::try_parse_from(["dutctl", "cycle", "--no-journal"]).unwrap();
        assert!(cli.no_journal);
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "dutctl",
            "--simulate",
            "run",
            "--gdb",
            "boot.gdb",
            "--ocd",
            "board.cfg",
            "--timeout",
            "2.5",
            "--keep-powered",
        ])
        .unwrap();
        assert!(cli.simulate);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.gdb, PathBuf::from("boot.gdb"));
        assert_eq!(args.ocd, Some(PathBuf::from("board.cfg")));
        assert_eq!(args.timeout, Some(2.5));
        assert!(args.keep_powered);
        assert!(!args.no_reconf);
    }
}
