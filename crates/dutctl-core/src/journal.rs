//! Session journal: the single append-only, time-ordered record of a run.
//!
//! Every producer (serial reader, command dispatcher, debug supervisor,
//! orchestrator) appends through one lock, which stamps the sequence number
//! and session-relative time. With a directory the journal is written as
//! `journal.jsonl` next to `serial.log` and one `<process>.log` per debug
//! process; `finalize` adds `measurements.json` and `session.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::debug::OutputStream;
use crate::instrument::{Metric, Unit};
use crate::protocol::Verb;

pub const JOURNAL_FILE: &str = "journal.jsonl";
pub const SERIAL_LOG_FILE: &str = "serial.log";
pub const MEASUREMENTS_FILE: &str = "measurements.json";
pub const SESSION_FILE: &str = "session.json";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A value read from an instrument, with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    pub instrument: String,
    pub metric: Metric,
    pub value: f64,
    pub unit: Unit,
    /// Result key for snapshots and host-side measurements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Serial line of the command that asked for it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEvent {
    SessionStarted {
        session_id: Uuid,
        dut: String,
        instruments: Vec<String>,
    },
    Transition {
        from: String,
        to: String,
    },
    SerialLine {
        line: u64,
        text: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        partial: bool,
    },
    Passthrough {
        line: u64,
        text: String,
    },
    Command {
        line: u64,
        verb: Verb,
        args: Vec<String>,
        raw: String,
    },
    Measurement(MeasurementRecord),
    DutResult {
        key: String,
        value: Value,
        line: u64,
    },
    ProtocolError {
        line: u64,
        error: String,
    },
    CommandFailed {
        line: u64,
        verb: Verb,
        error: String,
        timeout: bool,
    },
    CommandDropped {
        line: u64,
        verb: Verb,
        raw: String,
    },
    DebugOutput {
        process: String,
        stream: OutputStream,
        text: String,
    },
    DebugExited {
        process: String,
        code: Option<i32>,
    },
    Note {
        message: String,
    },
    SessionEnded {
        status: String,
        exit_code: i32,
    },
}

impl JournalEvent {
    pub fn note(message: impl Into<String>) -> Self {
        JournalEvent::Note {
            message: message.into(),
        }
    }
}

/// One line of `journal.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    pub seq: u64,
    /// Microseconds since the journal was opened.
    pub t_us: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: JournalEvent,
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

struct Files {
    dir: PathBuf,
    journal: File,
    serial: File,
    processes: HashMap<String, File>,
}

struct Inner {
    session_id: Uuid,
    started: Instant,
    next_seq: u64,
    files: Option<Files>,
    /// Kept only for in-memory journals.
    memory: Option<Vec<JournalEntry>>,
    results: Vec<(String, Value)>,
}

/// Cloneable handle to the session journal.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<Mutex<Inner>>,
}

impl Journal {
    /// A journal that keeps entries in memory and writes no files.
    pub fn in_memory() -> Self {
        Self::with_inner(None, Some(Vec::new()))
    }

    /// Create `dir` (if needed) and open the journal files inside it.
    pub async fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        let journal = open_append(&dir.join(JOURNAL_FILE)).await?;
        let serial = open_append(&dir.join(SERIAL_LOG_FILE)).await?;
        let files = Files {
            dir: dir.to_path_buf(),
            journal,
            serial,
            processes: HashMap::new(),
        };
        Ok(Self::with_inner(Some(files), None))
    }

    fn with_inner(files: Option<Files>, memory: Option<Vec<JournalEntry>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                session_id: Uuid::new_v4(),
                started: Instant::now(),
                next_seq: 0,
                files,
                memory,
                results: Vec::new(),
            })),
        }
    }

    pub async fn session_id(&self) -> Uuid {
        self.inner.lock().await.session_id
    }

    pub async fn dir(&self) -> Option<PathBuf> {
        self.inner.lock().await.files.as_ref().map(|f| f.dir.clone())
    }

    /// Append an event and return its sequence number.
    ///
    /// File errors are logged and do not fail the caller; the journal must
    /// never take the session down.
    pub async fn append(&self, event: JournalEvent) -> u64 {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = JournalEntry {
            seq,
            t_us: inner.started.elapsed().as_micros() as u64,
            at: Utc::now(),
            event,
        };

        if let Some(files) = inner.files.as_mut() {
            if let Err(e) = files.write(&entry).await {
                warn!(seq, error = %e, "failed to write journal entry");
            }
        }
        if let Some(memory) = inner.memory.as_mut() {
            memory.push(entry);
        }
        seq
    }

    /// Record a named result for `measurements.json`.
    pub async fn push_result(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().await.results.push((key.into(), value));
    }

    pub async fn results(&self) -> Vec<(String, Value)> {
        self.inner.lock().await.results.clone()
    }

    /// Entries of an in-memory journal (empty for file-backed ones).
    pub async fn entries(&self) -> Vec<JournalEntry> {
        self.inner.lock().await.memory.clone().unwrap_or_default()
    }

    /// Write `measurements.json` and `session.json` and flush every file.
    /// A no-op for in-memory journals.
    pub async fn finalize<S: Serialize + Sync>(&self, session: &S) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let results = results_document(&inner.results);
        let Some(files) = inner.files.as_mut() else {
            return Ok(());
        };

        let measurements = serde_json::to_vec_pretty(&results)?;
        fs::write(files.dir.join(MEASUREMENTS_FILE), measurements)
            .await
            .context("failed to write measurements")?;
        let record = serde_json::to_vec_pretty(session)?;
        fs::write(files.dir.join(SESSION_FILE), record)
            .await
            .context("failed to write session record")?;

        files.journal.flush().await?;
        files.serial.flush().await?;
        for file in files.processes.values_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").finish_non_exhaustive()
    }
}

impl Files {
    async fn write(&mut self, entry: &JournalEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.journal.write_all(&line).await?;

        match &entry.event {
            JournalEvent::SerialLine { text, partial, .. } => {
                self.serial.write_all(text.as_bytes()).await?;
                if !partial {
                    self.serial.write_all(b"\n").await?;
                }
            }
            JournalEvent::DebugOutput { process, text, .. } => {
                if !self.processes.contains_key(process) {
                    let path = self.dir.join(format!("{}.log", file_stem(process)));
                    let file = open_append(&path).await?;
                    self.processes.insert(process.clone(), file);
                }
                let Some(file) = self.processes.get_mut(process) else {
                    return Ok(());
                };
                file.write_all(text.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            _ => {}
        }
        Ok(())
    }
}

async fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))
}

fn file_stem(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// `[{"key": value}, ...]` in insertion order.
fn results_document(results: &[(String, Value)]) -> Value {
    Value::Array(
        results
            .iter()
            .map(|(key, value)| {
                let mut object = serde_json::Map::new();
                object.insert(key.clone(), value.clone());
                Value::Object(object)
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sequence_numbers_are_strictly_increasing() {
        let journal = Journal::in_memory();
        let mut handles = Vec::new();
        for i in 0..20 {
            let journal = journal.clone();
            handles.push(tokio::spawn(async move {
                journal.append(JournalEvent::note(format!("n{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let entries = journal.entries().await;
        assert_eq!(entries.len(), 20);
        for pair in entries.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
            assert!(pair[1].t_us >= pair[0].t_us);
        }
    }

    #[test]
    fn entries_serialize_flat_with_kind() {
        let entry = JournalEntry {
            seq: 3,
            t_us: 10,
            at: Utc::now(),
            event: JournalEvent::SerialLine {
                line: 1,
                text: "hi".into(),
                partial: false,
            },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["kind"], "serial_line");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["text"], "hi");
        assert!(value.get("partial").is_none());
    }

    #[test]
    fn measurement_event_flattens_record() {
        let event = JournalEvent::Measurement(MeasurementRecord {
            instrument: "psu0".into(),
            metric: Metric::Current { channel: 1 },
            value: 0.25,
            unit: Unit::Ampere,
            key: None,
            command_line: Some(4),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "measurement");
        assert_eq!(value["instrument"], "psu0");
        assert_eq!(value["metric"]["metric"], "current");
        assert_eq!(value["command_line"], 4);
    }

    #[test]
    fn results_are_single_key_objects() {
        let doc = results_document(&[
            ("a".into(), json!(1)),
            ("b".into(), json!({"psu0": {"1": {"cur": 0.1}}})),
            ("a".into(), json!("again")),
        ]);
        assert_eq!(
            doc,
            json!([{"a": 1}, {"b": {"psu0": {"1": {"cur": 0.1}}}}, {"a": "again"}])
        );
    }

    #[tokio::test]
    async fn file_journal_writes_tees_and_final_documents() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(dir.path()).await.unwrap();
        journal
            .append(JournalEvent::SerialLine {
                line: 1,
                text: "hello".into(),
                partial: false,
            })
            .await;
        journal
            .append(JournalEvent::SerialLine {
                line: 2,
                text: "tail".into(),
                partial: true,
            })
            .await;
        journal
            .append(JournalEvent::DebugOutput {
                process: "gdb".into(),
                stream: OutputStream::Stdout,
                text: "Breakpoint 1".into(),
            })
            .await;
        journal.push_result("k", json!(7)).await;
        journal.finalize(&json!({"status": "success"})).await.unwrap();

        let lines = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert_eq!(lines.lines().count(), 3);
        let serial = std::fs::read_to_string(dir.path().join(SERIAL_LOG_FILE)).unwrap();
        assert_eq!(serial, "hello\ntail");
        let gdb = std::fs::read_to_string(dir.path().join("gdb.log")).unwrap();
        assert_eq!(gdb, "Breakpoint 1\n");
        let results: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(MEASUREMENTS_FILE)).unwrap())
                .unwrap();
        assert_eq!(results, json!([{"k": 7}]));
        assert!(dir.path().join(SESSION_FILE).exists());
        assert!(journal.entries().await.is_empty());
    }

    #[test]
    fn process_labels_become_safe_file_names() {
        assert_eq!(file_stem("gdb"), "gdb");
        assert_eq!(file_stem("../x y"), "___x_y");
    }
}
