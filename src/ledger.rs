//! # Stage: Generation Log
//!
//! ## Responsibility
//! Durable, append-only JSON-lines file holding one record per generation.
//! Each record carries the generation and the full bodies of the entries it
//! inserts, so a single line append is the commit point for both the
//! capability stores and the generation history.
//!
//! ## Guarantees
//! - Atomic commits: a record is either fully present (newline-terminated and
//!   parseable) or treated as never written
//! - Torn tails are repaired on open: a partial trailing record is truncated
//!   away with a warning
//! - Corruption is loud: an unreadable record followed by more data, an index
//!   gap or a parent mismatch fails `open` with [`LedgerError::Corrupted`]
//!
//! ## NOT Responsible For
//! - Applying records to the stores (that is the tracker's replay)
//! - Compaction; the log grows for the lifetime of the data directory

use crate::generation::{ChangeOp, Generation};
use crate::store::CapabilityEntry;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// File name of the log inside the data directory.
pub const LOG_FILE: &str = "generations.jsonl";

// ---------------------------------------------------------------------------
// Record and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub generation: Generation,
    /// Bodies of the entries inserted by this generation.
    #[serde(default)]
    pub entries: Vec<CapabilityEntry>,
}

impl LogRecord {
    /// Every `Insert` needs a matching body, and every body an `Insert`.
    fn check_bodies(&self) -> Result<(), String> {
        let inserts: Vec<_> = self
            .generation
            .changes
            .iter()
            .filter(|c| matches!(c.op, ChangeOp::Insert { .. }))
            .collect();
        for change in &inserts {
            let body = self.entries.iter().find(|e| e.id == change.id).ok_or_else(|| {
                format!("insert of {} has no entry body", change.id.short())
            })?;
            if body.artifact.kind != change.store.artifact_kind() {
                return Err(format!(
                    "entry {} is {} but was inserted into {}",
                    body.id.short(),
                    body.artifact.kind,
                    change.store
                ));
            }
            if body.artifact.fingerprint() != body.id {
                return Err(format!("entry {} content does not match its id", body.id.short()));
            }
        }
        if self.entries.len() != inserts.len() {
            return Err("entry bodies without matching insert".into());
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("generation log corrupted at line {line} (byte {offset}): {reason}")]
    Corrupted { line: usize, offset: u64, reason: String },

    #[error("generation log I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encoding generation record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("generation log halted after an interrupted write; reopen to recover")]
    Halted,
}

impl LedgerError {
    pub fn is_corrupted(&self) -> bool {
        matches!(self, LedgerError::Corrupted { .. })
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io { path: path.to_path_buf(), source }
}

/// Simulated write failures, for crash-consistency tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendFault {
    /// Fail before any byte reaches the file.
    FailBeforeWrite,
    /// Write half the record and stop, as if the process died mid-write.
    TornWrite,
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Problem {
    TornTail,
    Corrupt { line: usize, offset: u64, reason: String },
}

struct Scan {
    records: Vec<LogRecord>,
    /// Byte length of the valid prefix.
    valid_len: u64,
    problem: Option<Problem>,
}

fn scan(bytes: &[u8]) -> Scan {
    let mut records: Vec<LogRecord> = Vec::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    let stop = |records, offset: usize, problem| Scan {
        records,
        valid_len: offset as u64,
        problem: Some(problem),
    };

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            return stop(records, offset, Problem::TornTail);
        };
        let next = offset + newline + 1;

        let record: LogRecord = match serde_json::from_slice(&rest[..newline]) {
            Ok(record) => record,
            Err(e) => {
                let more = bytes[next..].iter().any(|b| !b.is_ascii_whitespace());
                let problem = if more {
                    Problem::Corrupt { line: line_no, offset: offset as u64, reason: e.to_string() }
                } else {
                    Problem::TornTail
                };
                return stop(records, offset, problem);
            }
        };

        let expected = records.len() as u64;
        let generation = &record.generation;
        let reason = if generation.index != expected {
            Some(format!("expected generation {} but found {}", expected, generation.index))
        } else if generation.parent_index != expected.checked_sub(1) {
            Some(format!(
                "generation {} names parent {:?}, expected {:?}",
                generation.index,
                generation.parent_index,
                expected.checked_sub(1)
            ))
        } else {
            record.check_bodies().err()
        };
        if let Some(reason) = reason {
            return stop(records, offset, Problem::Corrupt { line: line_no, offset: offset as u64, reason });
        }

        records.push(record);
        offset = next;
    }

    Scan { records, valid_len: offset as u64, problem: None }
}

// ---------------------------------------------------------------------------
// GenerationLog
// ---------------------------------------------------------------------------

pub struct GenerationLog {
    path: PathBuf,
    file: File,
    /// Length of the durable, valid prefix.
    len: u64,
    sync: bool,
    halted: bool,
    fault: Option<AppendFault>,
}

impl GenerationLog {
    /// Open (creating if absent) and return every valid record in order.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Corrupted`] when a bad record is followed by more data
    ///   or the index chain is broken
    /// - [`LedgerError::Io`] on filesystem failures
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<(Self, Vec<LogRecord>), LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(io_err(&path))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(io_err(&path))?;

        let scan = scan(&bytes);
        match scan.problem {
            Some(Problem::Corrupt { line, offset, reason }) => {
                error!(path = %path.display(), line, offset, %reason, "generation log corrupted");
                return Err(LedgerError::Corrupted { line, offset, reason });
            }
            Some(Problem::TornTail) => {
                let dropped = bytes.len() as u64 - scan.valid_len;
                warn!(
                    path = %path.display(),
                    dropped_bytes = dropped,
                    "truncating torn trailing record from generation log"
                );
                file.set_len(scan.valid_len).map_err(io_err(&path))?;
                file.sync_all().map_err(io_err(&path))?;
            }
            None => {}
        }

        info!(path = %path.display(), records = scan.records.len(), "generation log opened");
        let log = Self { path, file, len: scan.valid_len, sync, halted: false, fault: None };
        Ok((log, scan.records))
    }

    /// Append one record.  On failure the file is cut back to its previous
    /// length, so a failed append leaves no trace.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), LedgerError> {
        if self.halted {
            return Err(LedgerError::Halted);
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if let Some(fault) = self.fault.take() {
            return self.fail_with(fault, &line);
        }

        if let Err(e) = self.write_line(&line) {
            if let Err(cleanup) = self.file.set_len(self.len) {
                error!(path = %self.path.display(), error = %cleanup, "could not undo failed append");
                self.halted = true;
            }
            return Err(io_err(&self.path)(e));
        }
        self.len += line.len() as u64;
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line)?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn fail_with(&mut self, fault: AppendFault, line: &[u8]) -> Result<(), LedgerError> {
        match fault {
            AppendFault::FailBeforeWrite => {}
            AppendFault::TornWrite => {
                let half = line.len() / 2;
                self.file.write_all(&line[..half]).map_err(io_err(&self.path))?;
                self.file.flush().map_err(io_err(&self.path))?;
                self.halted = true;
            }
        }
        Err(io_err(&self.path)(std::io::Error::other(format!("injected fault: {:?}", fault))))
    }

    /// Arm a one-shot failure for the next append.
    pub fn inject_fault(&mut self, fault: AppendFault) {
        self.fault = Some(fault);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len_bytes(&self) -> u64 {
        self.len
    }
}

// ---------------------------------------------------------------------------
// Repair
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub kept: usize,
    pub dropped_bytes: u64,
}

/// Truncate the log to its longest valid prefix.  Discards everything from
/// the first bad record on, including valid records after it.
pub fn repair(path: impl AsRef<Path>) -> Result<RepairReport, LedgerError> {
    let path = path.as_ref();
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RepairReport { kept: 0, dropped_bytes: 0 })
        }
        Err(e) => return Err(io_err(path)(e)),
    };
    let scan = scan(&bytes);
    let dropped_bytes = bytes.len() as u64 - scan.valid_len;
    if dropped_bytes > 0 {
        let file = OpenOptions::new().write(true).open(path).map_err(io_err(path))?;
        file.set_len(scan.valid_len).map_err(io_err(path))?;
        file.sync_all().map_err(io_err(path))?;
        warn!(path = %path.display(), kept = scan.records.len(), dropped_bytes, "generation log repaired");
    }
    Ok(RepairReport { kept: scan.records.len(), dropped_bytes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::CandidateArtifact;
    use crate::generation::{ChangeRef, GenerationOutcome};
    use crate::store::StoreKind;

    fn record(index: u64) -> LogRecord {
        LogRecord {
            generation: Generation {
                index,
                parent_index: index.checked_sub(1),
                timestamp_ms: 1_000 + index,
                changes: Vec::new(),
                rationale: format!("gen {}", index),
                outcome: GenerationOutcome::Committed,
                performance: None,
                rollback_of: None,
            },
            entries: Vec::new(),
        }
    }

    fn record_with_insert(index: u64, content: &str) -> LogRecord {
        let entry = CapabilityEntry::new(CandidateArtifact::code(content, "t"), index, 1);
        let mut r = record(index);
        r.generation.changes.push(ChangeRef {
            store: StoreKind::Tools,
            id: entry.id.clone(),
            op: ChangeOp::Insert { shadows: None },
        });
        r.entries.push(entry);
        r
    }

    fn log_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join(LOG_FILE)
    }

    fn write_records(path: &Path, records: &[LogRecord]) {
        let (mut log, _) = GenerationLog::open(path, false).unwrap();
        for r in records {
            log.append(r).unwrap();
        }
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    // -----------------------------------------------------------------------
    // open / append
    // -----------------------------------------------------------------------

    #[test]
    fn test_open_creates_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let (log, records) = GenerationLog::open(dir.path().join("nested/gen.jsonl"), false).unwrap();
        assert!(records.is_empty());
        assert_eq!(log.len_bytes(), 0);
        assert!(log.path().exists());
    }

    #[test]
    fn test_appended_records_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        write_records(&path, &[record(0), record_with_insert(1, "a"), record(2)]);
        let (_, records) = GenerationLog::open(&path, true).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].entries[0].artifact.content, "a");
        assert_eq!(records[2].generation.parent_index, Some(1));
    }

    // -----------------------------------------------------------------------
    // recovery
    // -----------------------------------------------------------------------

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        write_records(&path, &[record(0), record(1)]);
        let good_len = std::fs::metadata(&path).unwrap().len();
        append_raw(&path, b"{\"generation\":{\"index\":2");

        let (log, records) = GenerationLog::open(&path, false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(log.len_bytes(), good_len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn test_unparseable_final_line_is_treated_as_torn() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        write_records(&path, &[record(0)]);
        append_raw(&path, b"not json\n");
        let (_, records) = GenerationLog::open(&path, false).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_garbage_before_valid_records_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        write_records(&path, &[record(0)]);
        append_raw(&path, b"garbage\n");
        let line = serde_json::to_string(&record(1)).unwrap();
        append_raw(&path, format!("{}\n", line).as_bytes());

        match GenerationLog::open(&path, false) {
            Err(LedgerError::Corrupted { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corruption, got {:?}", other.map(|(_, r)| r.len())),
        }
    }

    #[test]
    fn test_index_gap_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let (mut log, _) = GenerationLog::open(&path, false).unwrap();
        log.append(&record(0)).unwrap();
        log.append(&record(2)).unwrap();
        drop(log);
        let err = GenerationLog::open(&path, false).err().unwrap();
        assert!(err.is_corrupted());
    }

    #[test]
    fn test_insert_without_body_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let mut r = record_with_insert(0, "x");
        r.entries.clear();
        let (mut log, _) = GenerationLog::open(&path, false).unwrap();
        log.append(&r).unwrap();
        log.append(&record(1)).unwrap();
        drop(log);
        assert!(GenerationLog::open(&path, false).err().unwrap().is_corrupted());
    }

    // -----------------------------------------------------------------------
    // injected faults
    // -----------------------------------------------------------------------

    #[test]
    fn test_fail_before_write_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let (mut log, _) = GenerationLog::open(&path, false).unwrap();
        log.append(&record(0)).unwrap();
        let len = log.len_bytes();
        log.inject_fault(AppendFault::FailBeforeWrite);
        assert!(log.append(&record(1)).is_err());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
        log.append(&record(1)).unwrap();
    }

    #[test]
    fn test_torn_write_halts_then_recovers_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let (mut log, _) = GenerationLog::open(&path, false).unwrap();
        log.append(&record(0)).unwrap();
        log.inject_fault(AppendFault::TornWrite);
        assert!(log.append(&record_with_insert(1, "lost")).is_err());
        assert!(matches!(log.append(&record(1)), Err(LedgerError::Halted)));
        drop(log);

        let (_, records) = GenerationLog::open(&path, false).unwrap();
        assert_eq!(records.len(), 1);
    }

    // -----------------------------------------------------------------------
    // repair
    // -----------------------------------------------------------------------

    #[test]
    fn test_repair_truncates_at_first_bad_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        write_records(&path, &[record(0)]);
        append_raw(&path, b"garbage\n");
        let line = serde_json::to_string(&record(1)).unwrap();
        append_raw(&path, format!("{}\n", line).as_bytes());

        let report = repair(&path).unwrap();
        assert_eq!(report.kept, 1);
        assert!(report.dropped_bytes > 0);
        let (_, records) = GenerationLog::open(&path, false).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_repair_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let report = repair(dir.path().join("absent.jsonl")).unwrap();
        assert_eq!(report, RepairReport { kept: 0, dropped_bytes: 0 });
    }
}
