//! Append-only journal of committed filesystem operations.
//!
//! Every record is one self-contained line: `{crc32_hex}|{json}\n`. A step is
//! journaled twice: an `Intent` (fsynced) before the effect and a `Commit`
//! carrying the literal effect and its inverse afterwards. Lines that fail
//! their checksum mark the journal corrupt: everything intact stays readable,
//! but new commits are refused.

pub mod recovery;
pub mod undo;

use crate::hasher::ContentHash;
use crate::plan::step::{StepKind, StepSpec};
use crate::storage::Database;
use crate::Error;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const JOURNAL_FILE_NAME: &str = "journal.log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JournalRecord {
    /// About to perform a step. Written and synced before any effect.
    Intent {
        seq: u64,
        run_id: String,
        chunk_id: String,
        step: StepSpec,
        /// Parent directories of the destination that did not exist yet.
        #[serde(default)]
        missing_dirs: Vec<PathBuf>,
        timestamp: DateTime<Utc>,
    },
    /// The step's effect is on disk.
    Commit { entry: JournalEntry },
    /// An intent that was never applied.
    Discard {
        seq: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// The entry's inverse has been applied.
    Undo { seq: u64, timestamp: DateTime<Utc> },
    /// Entries below `before_seq` were purged. `last_seq` keeps numbering
    /// monotonic even if every entry was removed.
    Purge {
        before_seq: u64,
        last_seq: u64,
        entries_removed: u64,
        timestamp: DateTime<Utc>,
    },
}

/// The literal filesystem change a step made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub old_hash: ContentHash,
    pub size: u64,
    pub created_dirs: Vec<PathBuf>,
    pub committed_at: DateTime<Utc>,
}

/// Move `from` back to `to`, expecting `expected_hash` on both ends, then
/// drop `remove_dirs` if they are empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseOp {
    pub from: PathBuf,
    pub to: PathBuf,
    pub expected_hash: ContentHash,
    pub remove_dirs: Vec<PathBuf>,
}

impl InverseOp {
    pub fn for_effect(effect: &Effect) -> Self {
        Self {
            from: effect.new_path.clone(),
            to: effect.old_path.clone(),
            expected_hash: effect.old_hash.clone(),
            remove_dirs: effect.created_dirs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub run_id: String,
    pub chunk_id: String,
    pub step: StepSpec,
    pub effect: Effect,
    pub inverse: InverseOp,
}

/// An intent with no matching commit or discard.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingIntent {
    pub seq: u64,
    pub run_id: String,
    pub chunk_id: String,
    pub step: StepSpec,
    pub missing_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PurgeSummary {
    pub before_seq: u64,
    pub entries_removed: u64,
    pub blobs_removed: u64,
}

#[derive(Debug, Default)]
struct JournalState {
    entries: BTreeMap<u64, JournalEntry>,
    pending: BTreeMap<u64, PendingIntent>,
    undone: BTreeSet<u64>,
    records: Vec<JournalRecord>,
    last_seq: u64,
    corrupt_lines: Vec<usize>,
    /// Highest sequence number settled before the first corrupt line.
    intact_through: Option<u64>,
}

impl JournalState {
    fn apply(&mut self, record: JournalRecord) {
        match &record {
            JournalRecord::Intent {
                seq,
                run_id,
                chunk_id,
                step,
                missing_dirs,
                ..
            } => {
                self.last_seq = self.last_seq.max(*seq);
                if !self.entries.contains_key(seq) {
                    self.pending.insert(
                        *seq,
                        PendingIntent {
                            seq: *seq,
                            run_id: run_id.clone(),
                            chunk_id: chunk_id.clone(),
                            step: step.clone(),
                            missing_dirs: missing_dirs.clone(),
                        },
                    );
                }
            }
            JournalRecord::Commit { entry } => {
                self.last_seq = self.last_seq.max(entry.seq);
                self.pending.remove(&entry.seq);
                self.entries.insert(entry.seq, entry.clone());
            }
            JournalRecord::Discard { seq, .. } => {
                self.last_seq = self.last_seq.max(*seq);
                self.pending.remove(seq);
            }
            JournalRecord::Undo { seq, .. } => {
                self.undone.insert(*seq);
            }
            JournalRecord::Purge { last_seq, .. } => {
                self.last_seq = self.last_seq.max(*last_seq);
            }
        }
        self.records.push(record);
    }

    fn mark_corrupt(&mut self, line: usize) {
        if self.intact_through.is_none() {
            let first_pending = self.pending.keys().next().map(|seq| seq - 1);
            let limit = first_pending.map_or(self.last_seq, |p| p.min(self.last_seq));
            self.intact_through = Some(limit);
        }
        self.corrupt_lines.push(line);
    }
}

/// Single writer of the journal file. Holding one means holding the
/// exclusive lock on `<journal>.lock`.
pub struct Journal {
    path: PathBuf,
    writer: Option<File>,
    _lock: Option<File>,
    state: JournalState,
}

impl Journal {
    /// Open for writing, creating the file if needed. A torn final line left
    /// by a crash mid-append is cut off.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        }

        let lock_path = lock_path_for(&path);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::io_at(&lock_path, e))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(Error::JournalLocked(path));
        }

        let mut writer = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io_at(&path, e))?;

        let mut bytes = Vec::new();
        writer
            .read_to_end(&mut bytes)
            .map_err(|e| Error::io_at(&path, e))?;
        if bytes.last().is_some_and(|b| *b != b'\n') {
            let keep = bytes.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
            warn!(
                "Truncating torn tail of {} ({} bytes)",
                path.display(),
                bytes.len() - keep
            );
            writer
                .set_len(keep as u64)
                .and_then(|_| writer.sync_all())
                .map_err(|e| Error::io_at(&path, e))?;
            bytes.truncate(keep);
        }
        let raw = String::from_utf8_lossy(&bytes);

        let state = parse(&raw);
        if !state.corrupt_lines.is_empty() {
            error!(
                "Journal {} has corrupt lines {:?}; commits are halted",
                path.display(),
                state.corrupt_lines
            );
        }
        debug!(
            "Opened journal {} ({} entries, last seq {})",
            path.display(),
            state.entries.len(),
            state.last_seq
        );
        Ok(Self {
            path,
            writer: Some(writer),
            _lock: Some(lock),
            state,
        })
    }

    /// Open without the lock for inspection. A missing file reads as empty.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let raw = match fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::io_at(&path, e)),
        };
        let complete = match raw.rfind('\n') {
            Some(i) => &raw[..=i],
            None => "",
        };
        Ok(Self {
            path,
            writer: None,
            _lock: None,
            state: parse(complete),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_seq(&self) -> u64 {
        self.state.last_seq
    }

    pub fn corrupt_lines(&self) -> &[usize] {
        &self.state.corrupt_lines
    }

    pub fn is_corrupt(&self) -> bool {
        !self.state.corrupt_lines.is_empty()
    }

    /// For a corrupt journal, the highest sequence number whose intent was
    /// resolved before the first bad line. `None` when every line is intact.
    pub fn intact_through(&self) -> Option<u64> {
        self.state.intact_through
    }

    /// Committed entries in sequence order, including undone ones.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &JournalEntry> {
        self.state.entries.values()
    }

    pub fn entry(&self, seq: u64) -> Option<&JournalEntry> {
        self.state.entries.get(&seq)
    }

    pub fn is_undone(&self, seq: u64) -> bool {
        self.state.undone.contains(&seq)
    }

    pub fn records(&self) -> &[JournalRecord] {
        &self.state.records
    }

    pub fn pending_intents(&self) -> Vec<PendingIntent> {
        self.state.pending.values().cloned().collect()
    }

    /// Smallest and largest committed sequence numbers written by `run_id`.
    pub fn range_for_run(&self, run_id: &str) -> Option<(u64, u64)> {
        let mut seqs = self
            .state
            .entries
            .values()
            .filter(|e| e.run_id == run_id)
            .map(|e| e.seq);
        let first = seqs.next()?;
        let last = seqs.last().unwrap_or(first);
        Some((first, last))
    }

    /// Sequence range of the most recent run that committed anything.
    pub fn last_run_range(&self) -> Option<(String, u64, u64)> {
        let run_id = self.state.entries.values().next_back()?.run_id.clone();
        let (first, last) = self.range_for_run(&run_id)?;
        Some((run_id, first, last))
    }

    /// New sequence numbers may only be issued on an intact journal.
    pub fn ensure_writable(&self) -> Result<(), Error> {
        if self.is_corrupt() {
            return Err(self.corrupt_error());
        }
        self.ensure_open()
    }

    /// Records for an existing `seq` may still be appended while a corrupt
    /// line sits after everything `seq` depends on.
    pub fn ensure_replayable(&self, seq: u64) -> Result<(), Error> {
        match self.state.intact_through {
            Some(limit) if seq > limit => Err(self.corrupt_error()),
            _ => self.ensure_open(),
        }
    }

    fn corrupt_error(&self) -> Error {
        Error::JournalCorrupt {
            lines: self.state.corrupt_lines.clone(),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.writer.is_none() {
            return Err(Error::Other(format!(
                "Journal {} was opened read-only",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Record the intent to apply `step`. Returns its sequence number.
    pub fn begin(
        &mut self,
        run_id: &str,
        chunk_id: &str,
        step: &StepSpec,
        missing_dirs: Vec<PathBuf>,
    ) -> Result<u64, Error> {
        self.ensure_writable()?;
        let seq = self.state.last_seq + 1;
        self.append(JournalRecord::Intent {
            seq,
            run_id: run_id.to_string(),
            chunk_id: chunk_id.to_string(),
            step: step.clone(),
            missing_dirs,
            timestamp: Utc::now(),
        })?;
        Ok(seq)
    }

    /// Commit the effect of the pending intent `seq`.
    pub fn commit(&mut self, seq: u64, effect: Effect) -> Result<JournalEntry, Error> {
        self.ensure_replayable(seq)?;
        let intent = self
            .state
            .pending
            .get(&seq)
            .cloned()
            .ok_or_else(|| Error::Other(format!("No pending intent #{} to commit", seq)))?;
        let entry = JournalEntry {
            seq,
            run_id: intent.run_id,
            chunk_id: intent.chunk_id,
            step: intent.step,
            inverse: InverseOp::for_effect(&effect),
            effect,
        };
        self.append(JournalRecord::Commit {
            entry: entry.clone(),
        })?;
        Ok(entry)
    }

    pub fn discard(&mut self, seq: u64, reason: &str) -> Result<(), Error> {
        self.ensure_replayable(seq)?;
        self.append(JournalRecord::Discard {
            seq,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
    }

    pub fn mark_undone(&mut self, seq: u64) -> Result<(), Error> {
        self.ensure_replayable(seq)?;
        self.append(JournalRecord::Undo {
            seq,
            timestamp: Utc::now(),
        })
    }

    fn append(&mut self, record: JournalRecord) -> Result<(), Error> {
        let line = encode(&record)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Other("Journal is read-only".to_string()))?;
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.sync_data())
            .map_err(|e| Error::io_at(&self.path, e))?;
        self.state.apply(record);
        Ok(())
    }

    /// Drop every record for sequence numbers below `before_seq`.
    ///
    /// Graveyard files referenced by purged, not-undone deletes are removed
    /// for good. The journal is rewritten to a sibling file and renamed into
    /// place; an audit row is written to `db`.
    pub fn purge(&mut self, before_seq: u64, db: &Database) -> Result<PurgeSummary, Error> {
        self.ensure_writable()?;
        if let Some(pending) = self.state.pending.keys().find(|seq| **seq < before_seq) {
            return Err(Error::Other(format!(
                "Intent #{} is unresolved; run recovery before purging",
                pending
            )));
        }

        let doomed: Vec<&JournalEntry> = self
            .state
            .entries
            .range(..before_seq)
            .map(|(_, e)| e)
            .collect();
        let entries_removed = doomed.len() as u64;
        let blobs: Vec<PathBuf> = doomed
            .iter()
            .filter(|e| e.step.kind == StepKind::Delete && !self.state.undone.contains(&e.seq))
            .map(|e| e.effect.new_path.clone())
            .collect();

        let summary_record = JournalRecord::Purge {
            before_seq,
            last_seq: self.state.last_seq,
            entries_removed,
            timestamp: Utc::now(),
        };
        let mut kept: Vec<JournalRecord> = self
            .state
            .records
            .iter()
            .filter(|r| record_seq(r).map(|s| s >= before_seq).unwrap_or(true))
            .cloned()
            .collect();
        kept.push(summary_record);

        let tmp = self.path.with_extension("log.purge");
        {
            let mut out = File::create(&tmp).map_err(|e| Error::io_at(&tmp, e))?;
            for record in &kept {
                out.write_all(encode(record)?.as_bytes())
                    .map_err(|e| Error::io_at(&tmp, e))?;
            }
            out.sync_all().map_err(|e| Error::io_at(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| Error::io_at(&self.path, e))?;
        if let Some(parent) = self.path.parent() {
            crate::executor::fsops::sync_dir(parent);
        }

        let mut blobs_removed = 0u64;
        for blob in &blobs {
            match fs::remove_file(blob) {
                Ok(()) => blobs_removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove graveyard file {}: {}", blob.display(), e),
            }
        }

        self.writer = Some(
            OpenOptions::new()
                .append(true)
                .open(&self.path)
                .map_err(|e| Error::io_at(&self.path, e))?,
        );
        let mut state = JournalState::default();
        for record in kept {
            state.apply(record);
        }
        self.state = state;

        db.insert_purge_audit(
            before_seq as i64,
            entries_removed as i64,
            blobs_removed as i64,
            None,
        )?;
        info!(
            "Purged {} journal entries below #{} ({} graveyard files)",
            entries_removed, before_seq, blobs_removed
        );
        Ok(PurgeSummary {
            before_seq,
            entries_removed,
            blobs_removed,
        })
    }
}

pub fn journal_path(state_dir: &Path) -> PathBuf {
    state_dir.join(JOURNAL_FILE_NAME)
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn record_seq(record: &JournalRecord) -> Option<u64> {
    match record {
        JournalRecord::Intent { seq, .. }
        | JournalRecord::Discard { seq, .. }
        | JournalRecord::Undo { seq, .. } => Some(*seq),
        JournalRecord::Commit { entry } => Some(entry.seq),
        JournalRecord::Purge { .. } => None,
    }
}

fn encode(record: &JournalRecord) -> Result<String, Error> {
    let json = serde_json::to_string(record)?;
    let crc = crc32fast::hash(json.as_bytes());
    Ok(format!("{:08x}|{}\n", crc, json))
}

fn decode(line: &str) -> Option<JournalRecord> {
    let (crc, json) = line.split_once('|')?;
    let expected = u32::from_str_radix(crc, 16).ok()?;
    if crc32fast::hash(json.as_bytes()) != expected {
        return None;
    }
    serde_json::from_str(json).ok()
}

fn parse(raw: &str) -> JournalState {
    let mut state = JournalState::default();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match decode(line) {
            Some(record) => state.apply(record),
            None => {
                warn!("Journal line {} failed its checksum or did not parse", idx + 1);
                state.mark_corrupt(idx + 1);
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn step(name: &str) -> StepSpec {
        StepSpec::new(
            StepKind::Move,
            PathBuf::from(format!("/r/{}", name)),
            PathBuf::from(format!("/r/Documents/{}", name)),
            ContentHash::from_hex("ab".repeat(32)),
            5,
        )
    }

    fn effect(step: &StepSpec) -> Effect {
        Effect {
            old_path: step.source.clone(),
            new_path: step.destination.clone(),
            old_hash: step.hash.clone(),
            size: step.size,
            created_dirs: vec![PathBuf::from("/r/Documents")],
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn test_sequence_numbers_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        {
            let mut journal = Journal::open(&path).unwrap();
            for name in ["a.txt", "b.txt"] {
                let s = step(name);
                let seq = journal.begin("run-1", "chunk", &s, vec![]).unwrap();
                journal.commit(seq, effect(&s)).unwrap();
            }
            assert_eq!(journal.last_seq(), 2);
        }
        let mut journal = Journal::open(&path).unwrap();
        assert_eq!(journal.entries().count(), 2);
        let s = step("c.txt");
        assert_eq!(journal.begin("run-2", "chunk", &s, vec![]).unwrap(), 3);
        assert_eq!(journal.pending_intents().len(), 1);
        assert_eq!(journal.range_for_run("run-1"), Some((1, 2)));
    }

    #[test]
    fn test_inverse_is_precomputed() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::open(dir.path().join("journal.log")).unwrap();
        let s = step("a.txt");
        let seq = journal.begin("run", "chunk", &s, vec![]).unwrap();
        let entry = journal.commit(seq, effect(&s)).unwrap();
        assert_eq!(entry.inverse.from, s.destination);
        assert_eq!(entry.inverse.to, s.source);
        assert_eq!(entry.inverse.remove_dirs, vec![PathBuf::from("/r/Documents")]);
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let _first = Journal::open(&path).unwrap();
        assert!(matches!(Journal::open(&path), Err(Error::JournalLocked(_))));
        assert!(Journal::read(&path).is_ok());
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        {
            let mut journal = Journal::open(&path).unwrap();
            let s = step("a.txt");
            let seq = journal.begin("run", "chunk", &s, vec![]).unwrap();
            journal.commit(seq, effect(&s)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"1234abcd|{\"type\":\"Undo\",\"se").unwrap();
        drop(file);

        let journal = Journal::open(&path).unwrap();
        assert!(!journal.is_corrupt());
        assert_eq!(journal.entries().count(), 1);
        assert!(fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn test_corrupt_line_limits_replay_to_settled_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        {
            let mut journal = Journal::open(&path).unwrap();
            for name in ["a.txt", "b.txt"] {
                let s = step(name);
                let seq = journal.begin("run", "chunk", &s, vec![]).unwrap();
                journal.commit(seq, effect(&s)).unwrap();
            }
        }
        // Break the commit of #2, the fourth line
        let raw = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = raw.lines().map(str::to_string).collect();
        lines[3] = format!("00000000|{}", &lines[3][9..]);
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        let mut journal = Journal::open(&path).unwrap();
        assert_eq!(journal.corrupt_lines(), &[4]);
        assert_eq!(journal.intact_through(), Some(1));
        assert_eq!(journal.pending_intents().len(), 1);
        assert!(matches!(
            journal.begin("run", "chunk", &step("c.txt"), vec![]),
            Err(Error::JournalCorrupt { .. })
        ));
        assert!(matches!(journal.mark_undone(2), Err(Error::JournalCorrupt { .. })));
        journal.mark_undone(1).unwrap();
        assert!(Journal::read(&path).unwrap().is_undone(1));
    }
}
