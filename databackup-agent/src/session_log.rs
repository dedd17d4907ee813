//! Durable, append-only session log.
//!
//! One JSON-lines file per workflow namespace. Every record is written and
//! synced before `append` returns. A record that cannot be written stays in
//! a pending queue (later records queue behind it to keep append order) and
//! is retried on the next append or on [`SessionLog::flush`].
//!
//! Loading skips lines that do not parse, so a record torn by a crash never
//! hides the records before it.

use crate::outcome::ExecutionResult;
use crate::utils::errors::{Result, SessionError};
use crate::workflow::WorkflowType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One line of a session log file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub session_id: String,
    pub session_started_at: DateTime<Utc>,
    pub workflow: WorkflowType,
    #[serde(flatten)]
    pub result: ExecutionResult,
}

/// Session-scoped writer for the per-workflow log files
#[derive(Debug)]
pub struct SessionLog {
    dir: PathBuf,
    session_id: String,
    started_at: DateTime<Utc>,
    pending: VecDeque<LogRecord>,
}

impl SessionLog {
    pub fn new(
        dir: impl Into<PathBuf>,
        session_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dir: dir.into(),
            session_id: session_id.into(),
            started_at,
            pending: VecDeque::new(),
        }
    }

    /// Path of the log file for a workflow
    pub fn path_for(dir: &Path, workflow: WorkflowType) -> PathBuf {
        dir.join(format!("{}.jsonl", workflow.log_namespace()))
    }

    /// Durably append one result.
    ///
    /// On failure the record is kept and retried later; the error is returned
    /// so the caller can surface it as a warning.
    pub fn append(&mut self, workflow: WorkflowType, result: &ExecutionResult) -> Result<()> {
        self.pending.push_back(LogRecord {
            session_id: self.session_id.clone(),
            session_started_at: self.started_at,
            workflow,
            result: result.clone(),
        });
        self.flush().map(|_| ())
    }

    /// Write every pending record in order; returns how many were written
    pub fn flush(&mut self) -> Result<usize> {
        let mut written = 0;
        while let Some(record) = self.pending.front() {
            write_record(&self.dir, record).map_err(|e| {
                SessionError::Persistence(format!(
                    "failed to write {} log record for {}: {}",
                    record.workflow, record.result.source_id, e
                ))
            })?;
            self.pending.pop_front();
            written += 1;
        }
        if written > 0 {
            debug!("Flushed {} session log record(s)", written);
        }
        Ok(written)
    }

    /// Records not yet on disk
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Every record ever logged for a workflow, in append order
    pub fn load(dir: &Path, workflow: WorkflowType) -> Result<Vec<LogRecord>> {
        let path = Self::path_for(dir, workflow);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .map_err(|e| {
                SessionError::Persistence(format!("failed to open {}: {}", path.display(), e))
            })?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (line_num, line) in reader.split(b'\n').enumerate() {
            let line = line.map_err(|e| {
                SessionError::Persistence(format!(
                    "failed to read {} line {}: {}",
                    path.display(),
                    line_num + 1,
                    e
                ))
            })?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<LogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping unreadable record at {}:{}: {}",
                    path.display(),
                    line_num + 1,
                    e
                ),
            }
        }

        Ok(records)
    }

    /// Results of one session, in execution order
    pub fn load_session(
        dir: &Path,
        workflow: WorkflowType,
        session_id: &str,
    ) -> Result<Vec<ExecutionResult>> {
        Ok(Self::load(dir, workflow)?
            .into_iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.result)
            .collect())
    }
}

fn write_record(dir: &Path, record: &LogRecord) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(SessionLog::path_for(dir, record.workflow))?;

    // A crash may have left a torn last line; start on a fresh one
    if file.metadata()?.len() > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            file.write_all(b"\n")?;
        }
    }

    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{Metrics, Outcome};
    use crate::workflow::OperationKind;
    use tempfile::TempDir;

    fn result(id: &str, outcome: Outcome) -> ExecutionResult {
        ExecutionResult {
            timestamp: Utc::now(),
            source_id: id.to_string(),
            target_id: "2026-10-17_10-00-00-000".to_string(),
            operation: OperationKind::Backup,
            outcome,
            metrics: Metrics {
                bytes: 2048,
                files: 4,
                duration_ms: 12,
            },
            output: "4 files".to_string(),
        }
    }

    #[test]
    fn test_append_then_load_preserves_order() {
        let temp = TempDir::new().unwrap();
        let mut log = SessionLog::new(temp.path(), "session-1", Utc::now());

        let appended = vec![
            result("a", Outcome::Success),
            result("b", Outcome::Failed("permission denied".into())),
            result("c", Outcome::Skipped("unchanged".into())),
        ];
        for r in &appended {
            log.append(WorkflowType::AppBackup, r).unwrap();
        }

        let loaded =
            SessionLog::load_session(temp.path(), WorkflowType::AppBackup, "session-1").unwrap();
        assert_eq!(loaded, appended);
        assert!(SessionLog::load(temp.path(), WorkflowType::MediaBackup).unwrap().is_empty());
    }

    #[test]
    fn test_sessions_share_one_file_per_workflow() {
        let temp = TempDir::new().unwrap();
        let mut first = SessionLog::new(temp.path(), "s1", Utc::now());
        let mut second = SessionLog::new(temp.path(), "s2", Utc::now());

        first.append(WorkflowType::MediaRestore, &result("pictures", Outcome::Success)).unwrap();
        second.append(WorkflowType::MediaRestore, &result("music", Outcome::Success)).unwrap();

        let all = SessionLog::load(temp.path(), WorkflowType::MediaRestore).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, "s1");
        assert_eq!(all[1].session_id, "s2");
        let path = SessionLog::path_for(temp.path(), WorkflowType::MediaRestore);
        assert!(path.ends_with("restore_media.jsonl"));
    }

    #[test]
    fn test_torn_last_record_does_not_corrupt_earlier_ones() {
        let temp = TempDir::new().unwrap();
        let mut log = SessionLog::new(temp.path(), "s1", Utc::now());
        log.append(WorkflowType::AppBackup, &result("a", Outcome::Success)).unwrap();

        // Simulate a crash mid-write
        let path = SessionLog::path_for(temp.path(), WorkflowType::AppBackup);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"session_id\":\"s1\",\"sess").unwrap();
        drop(file);

        let loaded = SessionLog::load(temp.path(), WorkflowType::AppBackup).unwrap();
        assert_eq!(loaded.len(), 1);

        // Appending after the torn record still produces a readable line
        log.append(WorkflowType::AppBackup, &result("b", Outcome::Success)).unwrap();
        let loaded = SessionLog::load_session(temp.path(), WorkflowType::AppBackup, "s1").unwrap();
        let ids: Vec<_> = loaded.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_failed_write_is_retried_on_flush() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("logs");
        fs::write(&blocker, b"not a directory").unwrap();

        let mut log = SessionLog::new(&blocker, "s1", Utc::now());
        let err = log.append(WorkflowType::AppBackup, &result("a", Outcome::Success)).unwrap_err();
        assert!(matches!(err, SessionError::Persistence(_)));
        assert!(log.append(WorkflowType::AppBackup, &result("b", Outcome::Success)).is_err());
        assert_eq!(log.pending(), 2);

        fs::remove_file(&blocker).unwrap();
        assert_eq!(log.flush().unwrap(), 2);
        assert_eq!(log.pending(), 0);

        let ids: Vec<_> = SessionLog::load(&blocker, WorkflowType::AppBackup)
            .unwrap()
            .into_iter()
            .map(|r| r.result.source_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
