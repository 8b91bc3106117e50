//! Append-only audit log.
//!
//! One newline-delimited JSON file per UTC calendar day. Entries are never
//! rewritten; the only mutation is whole-file removal by the retention
//! sweep.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use tabpilot_core::AuditLogConfig;

const FILE_PREFIX: &str = "audit-";
const FILE_SUFFIX: &str = ".jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Error,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AuditLogEntry {
    pub fn now(action: impl Into<String>, result: AuditResult) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            action: action.into(),
            args: None,
            result,
            error: None,
            duration_ms: None,
        }
    }

    pub fn with_args(mut self, args: Option<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

pub struct AuditLogger {
    dir: PathBuf,
    enabled: bool,
    retention_days: u32,
    // Serializes appends so two entries never interleave inside a line.
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(dir: PathBuf, config: &AuditLogConfig) -> Self {
        Self {
            dir,
            enabled: config.enabled,
            retention_days: config.retention_days,
            write_lock: Mutex::new(()),
        }
    }

    fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", date.format("%Y-%m-%d")))
    }

    /// Append one entry to today's file. Best-effort: an audit write failure
    /// is logged but never fails the action it describes.
    pub fn append(&self, entry: &AuditLogEntry) {
        if !self.enabled {
            return;
        }
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize audit entry");
                return;
            }
        };
        let path = self.day_file(Utc::now().date_naive());
        let _guard = self.write_lock.lock().expect("audit write lock poisoned");
        let result = std::fs::create_dir_all(&self.dir).and_then(|_| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{line}")
        });
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "Failed to append audit entry");
        }
    }

    /// Remove day-files older than the retention policy.
    pub fn prune(&self) {
        if !self.enabled {
            return;
        }
        let cutoff = Utc::now().date_naive() - chrono::Days::new(u64::from(self.retention_days));
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                .and_then(|stamp| NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if date < cutoff {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(error = %e, file = name, "Failed to prune audit file");
                } else {
                    tracing::info!(file = name, "Pruned expired audit file");
                }
            }
        }
    }

    /// The last `limit` entries of today's file, oldest first.
    pub fn tail_today(&self, limit: usize) -> Vec<AuditLogEntry> {
        let path = self.day_file(Utc::now().date_naive());
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        let lines: Vec<&str> = raw.lines().collect();
        let start = lines.len().saturating_sub(limit);
        lines[start..]
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}
