//! Lab configuration loading and per-invocation context.
//!
//! Values resolve as: CLI flag > `DUTCTL_*` env var > default. clap's `env`
//! attribute covers the first two; this module turns the result into a
//! validated [`LabConfig`], a connected registry and a journal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::info;

use dutctl_core::config::{load_lab_config, safety_hash_of};
use dutctl_core::instrument::{SimTransportFactory, TcpTransportFactory, TransportFactory};
use dutctl_core::{InstrumentRegistry, Journal, LabConfig};

/// Everything a command needs once the configuration has been accepted.
pub struct CliContext {
    pub config: Arc<LabConfig>,
    pub registry: Arc<InstrumentRegistry>,
    pub log_dir: Option<PathBuf>,
    pub simulate: bool,
}

impl CliContext {
    pub fn load(path: &Path, log_dir: Option<PathBuf>, simulate: bool) -> Result<Self> {
        let config = load_lab_config(path)
            .with_context(|| format!("failed to load lab configuration {}", path.display()))?;

        let factory: Box<dyn TransportFactory> = if simulate {
            info!("using simulated instruments");
            Box::new(SimTransportFactory::new())
        } else {
            Box::new(TcpTransportFactory)
        };
        let registry = InstrumentRegistry::from_config(&config, factory.as_ref());
        info!(
            dut = %config.dut.name,
            instruments = registry.len(),
            "lab configuration loaded"
        );

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            log_dir,
            simulate,
        })
    }

    /// Open the journal for one invocation: a fresh timestamped directory
    /// under `--log-dir`, or memory only with `--no-journal`.
    pub async fn journal(&self, action: &str) -> Result<Journal> {
        let Some(root) = &self.log_dir else {
            return Ok(Journal::in_memory());
        };
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let dir = unique_dir(root, &format!("{stamp}-{action}"));
        let journal = Journal::create(&dir).await?;
        info!(dir = %dir.display(), "journal opened");
        Ok(journal)
    }
}

fn unique_dir(root: &Path, base: &str) -> PathBuf {
    let first = root.join(base);
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| root.join(format!("{base}.{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

/// `dutctl hash`: print the safety hash the file's contents should carry.
pub fn print_hash(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let hash = safety_hash_of(&content)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    println!("{hash}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_dir_appends_a_counter() {
        let root = tempfile::tempdir().unwrap();
        let first = unique_dir(root.path(), "20260101-000000-cycle");
        assert_eq!(first, root.path().join("20260101-000000-cycle"));
        std::fs::create_dir(&first).unwrap();
        let second = unique_dir(root.path(), "20260101-000000-cycle");
        assert_eq!(second, root.path().join("20260101-000000-cycle.1"));
    }
}
