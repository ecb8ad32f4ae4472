//! Types shared by debug-session backends.

use std::path::Path;

use serde::Serialize;
use uuid::Uuid;

pub const DEFAULT_OPENOCD: &str = "openocd";
pub const DEFAULT_GDB: &str = "riscv64-unknown-elf-gdb";

/// Exit code openocd reports when we stop it with SIGTERM.
pub const OPENOCD_TERMINATED: i32 = -15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    /// Decides the session outcome (gdb).
    Primary,
    /// Supports the primary and is stopped with it (openocd).
    Companion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One process of a debug session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Short name used in events and log file names.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub role: ProcessRole,
    /// Exit code treated as a clean exit.
    pub masked_exit: Option<i32>,
}

impl ProcessSpec {
    /// Exit code after masking; `None` stays `None`.
    pub fn effective_code(&self, code: Option<i32>) -> Option<i32> {
        match (code, self.masked_exit) {
            (Some(c), Some(masked)) if c == masked => Some(0),
            _ => code,
        }
    }
}

/// Binaries used to build a standard plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub openocd: String,
    pub gdb: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            openocd: DEFAULT_OPENOCD.to_string(),
            gdb: DEFAULT_GDB.to_string(),
        }
    }
}

/// The processes that make up one debug session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugPlan {
    pub processes: Vec<ProcessSpec>,
}

impl DebugPlan {
    /// `openocd -f <cfg>` (when a config is given) plus
    /// `gdb -x <script> [<binary>]`.
    pub fn openocd_gdb(
        toolchain: &Toolchain,
        ocd_config: Option<&Path>,
        script: &Path,
        binary: Option<&Path>,
    ) -> Self {
        let mut processes = Vec::new();
        if let Some(cfg) = ocd_config {
            processes.push(ProcessSpec {
                label: "openocd".to_string(),
                program: toolchain.openocd.clone(),
                args: vec!["-f".to_string(), path_arg(cfg)],
                role: ProcessRole::Companion,
                masked_exit: Some(OPENOCD_TERMINATED),
            });
        }
        let mut args = vec!["-x".to_string(), path_arg(script)];
        if let Some(binary) = binary {
            args.push(path_arg(binary));
        }
        processes.push(ProcessSpec {
            label: "gdb".to_string(),
            program: toolchain.gdb.clone(),
            args,
            role: ProcessRole::Primary,
            masked_exit: None,
        });
        Self { processes }
    }

    pub fn spec(&self, label: &str) -> Option<&ProcessSpec> {
        self.processes.iter().find(|p| p.label == label)
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// A spawned process, as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedProcess {
    pub label: String,
    pub role: ProcessRole,
    pub pid: u32,
}

/// Handle to a running debug session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugHandle {
    pub id: Uuid,
    pub processes: Vec<SpawnedProcess>,
}

/// Events emitted while a debug session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    Output {
        process: String,
        stream: OutputStream,
        text: String,
    },
    Exited {
        process: String,
        role: ProcessRole,
        /// Raw exit code; signal deaths are reported as the negated signal.
        code: Option<i32>,
    },
    Error {
        message: String,
    },
    /// Every process has exited; nothing follows.
    Completed,
}

/// How the debug session ended: the first process to exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugOutcome {
    pub process: String,
    pub role: ProcessRole,
    /// Exit code after masking.
    pub code: Option<i32>,
}

impl DebugOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openocd_gdb_plan_with_everything() {
        let plan = DebugPlan::openocd_gdb(
            &Toolchain::default(),
            Some(Path::new("target.cfg")),
            Path::new("run.gdb"),
            Some(Path::new("fw.elf")),
        );
        assert_eq!(plan.processes.len(), 2);
        let ocd = &plan.processes[0];
        assert_eq!(ocd.program, "openocd");
        assert_eq!(ocd.args, vec!["-f", "target.cfg"]);
        assert_eq!(ocd.role, ProcessRole::Companion);
        let gdb = plan.spec("gdb").unwrap();
        assert_eq!(gdb.program, DEFAULT_GDB);
        assert_eq!(gdb.args, vec!["-x", "run.gdb", "fw.elf"]);
        assert_eq!(gdb.role, ProcessRole::Primary);
    }

    #[test]
    fn gdb_only_plan() {
        let toolchain = Toolchain {
            openocd: "ocd".into(),
            gdb: "sh".into(),
        };
        let plan = DebugPlan::openocd_gdb(&toolchain, None, Path::new("s.sh"), None);
        assert_eq!(plan.processes.len(), 1);
        assert_eq!(plan.processes[0].program, "sh");
        assert_eq!(plan.processes[0].args, vec!["-x", "s.sh"]);
    }

    #[test]
    fn masked_exit_codes() {
        let plan = DebugPlan::openocd_gdb(
            &Toolchain::default(),
            Some(Path::new("t.cfg")),
            Path::new("r.gdb"),
            None,
        );
        let ocd = plan.spec("openocd").unwrap();
        assert_eq!(ocd.effective_code(Some(-15)), Some(0));
        assert_eq!(ocd.effective_code(Some(1)), Some(1));
        assert_eq!(ocd.effective_code(None), None);
        let gdb = plan.spec("gdb").unwrap();
        assert_eq!(gdb.effective_code(Some(-15)), Some(-15));
    }
}
