//! One-shot lab actions: `cycle`, `reset`, `measure`, `poweroff`, `leak`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use dutctl_core::journal::JournalEvent;
use dutctl_core::registry::Reading;
use dutctl_core::session::LabActions;

use crate::config::CliContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Cycle,
    Reset,
    Measure,
    PowerOff,
    Leak,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Cycle => "cycle",
            Action::Reset => "reset",
            Action::Measure => "measure",
            Action::PowerOff => "poweroff",
            Action::Leak => "leak",
        }
    }
}

/// `session.json` for a one-shot action.
#[derive(Debug, Serialize)]
struct ActionRecord<'a> {
    action: &'a str,
    dut: &'a str,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    exit_code: i32,
}

pub async fn run_action(ctx: &CliContext, action: Action) -> Result<i32> {
    let journal = ctx.journal(action.as_str()).await?;
    let actions = LabActions::new(&ctx.config, &ctx.registry, &journal);
    let started_at = Utc::now();
    info!(action = action.as_str(), dut = %ctx.config.dut.name, "running action");

    let outcome = match action {
        Action::Cycle => actions.power_cycle(true).await.map(|()| Vec::new()),
        Action::Reset => actions.reset().await.map(|()| Vec::new()),
        Action::Measure => actions.measure(action.as_str()).await,
        Action::PowerOff => actions.power_off().await.map(|()| Vec::new()),
        Action::Leak => actions.leak().await,
    };

    let (status, error_text, code) = match &outcome {
        Ok(readings) => {
            print_readings(readings);
            ("success", None, 0)
        }
        Err(e) => {
            error!(action = action.as_str(), error = %e, "action failed");
            journal
                .append(JournalEvent::note(format!("{} failed: {e}", action.as_str())))
                .await;
            ("instrument_failure", Some(e.to_string()), 5)
        }
    };

    let record = ActionRecord {
        action: action.as_str(),
        dut: &ctx.config.dut.name,
        started_at,
        ended_at: Utc::now(),
        status,
        error: error_text.clone(),
        exit_code: code,
    };
    journal.finalize(&record).await?;

    if let Some(e) = error_text {
        eprintln!("{}: {e}", action.as_str());
    } else {
        println!("{}: ok", action.as_str());
    }
    Ok(code)
}

fn print_readings(readings: &[Reading]) {
    for reading in readings {
        println!(
            "  {} {} = {} {}",
            reading.instrument,
            reading.metric,
            reading.measurement.value,
            reading.metric.unit().symbol()
        );
    }
}
