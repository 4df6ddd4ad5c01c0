//! Execution log: one JSON object per line.
//!
//! Records session start and end plus every monitor event, each with an
//! RFC 3339 timestamp, so a session can be replayed or grepped afterwards.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::monitor::MonitorEvent;

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    SessionStarted { shell: String, cwd: String },
    Monitor(MonitorEvent),
    SessionEnded { exit_code: Option<u32> },
}

impl From<MonitorEvent> for LogEvent {
    fn from(event: MonitorEvent) -> Self {
        LogEvent::Monitor(event)
    }
}

pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: impl Into<LogEvent>) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event: event.into(),
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;
        debug!(event = %json, "execution log");

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
