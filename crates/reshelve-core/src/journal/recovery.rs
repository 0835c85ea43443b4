//! Startup reconciliation for steps interrupted between effect and commit.
//!
//! An `Intent` with no `Commit` or `Discard` is in doubt. The filesystem decides:
//!
//! - source gone, destination holds the expected content: complete the commit
//! - source intact, destination absent: discard
//! - source intact and an identical destination (interrupted copy): remove the
//!   extra copy, discard
//! - anything else: leave it for the operator
//!
//! Intents recorded after a corrupt journal line are never resolved
//! automatically.

use super::{Effect, Journal, PendingIntent};
use crate::config::DEFAULT_STREAMING_THRESHOLD;
use crate::executor::fsops;
use crate::hasher::{digest, ContentHash};
use crate::provenance::{LineageDirection, ProvenanceStore};
use crate::storage::Database;
use crate::Error;
use ahash::AHashSet;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Completed { seq: u64, path: PathBuf },
    Discarded { seq: u64, reason: String },
    Unresolved { seq: u64, reason: String },
}

impl ReconcileOutcome {
    pub fn is_unresolved(&self) -> bool {
        matches!(self, ReconcileOutcome::Unresolved { .. })
    }
}

pub fn reconcile(
    journal: &mut Journal,
    provenance: &ProvenanceStore<'_>,
) -> Result<Vec<ReconcileOutcome>, Error> {
    let pending = journal.pending_intents();
    if pending.is_empty() {
        return Ok(Vec::new());
    }
    info!("Reconciling {} in-doubt journal intents", pending.len());

    let mut outcomes = Vec::with_capacity(pending.len());
    for intent in pending {
        let outcome = match journal.ensure_replayable(intent.seq) {
            Ok(()) => reconcile_one(journal, provenance, &intent)?,
            Err(e @ Error::JournalCorrupt { .. }) => ReconcileOutcome::Unresolved {
                seq: intent.seq,
                reason: e.to_string(),
            },
            Err(e) => return Err(e),
        };
        match &outcome {
            ReconcileOutcome::Unresolved { seq, reason } => {
                warn!("Intent #{} left unresolved: {}", seq, reason)
            }
            other => info!("Reconciled {:?}", other),
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn reconcile_one(
    journal: &mut Journal,
    provenance: &ProvenanceStore<'_>,
    intent: &PendingIntent,
) -> Result<ReconcileOutcome, Error> {
    let step = &intent.step;
    let seq = intent.seq;
    let source = read_hash(&step.source);
    let destination = read_hash(&step.destination);
    let expected = &step.hash;

    match (source, destination) {
        (State::Absent, State::Hash(h)) if &h == expected => {
            let created_dirs: Vec<PathBuf> = intent
                .missing_dirs
                .iter()
                .filter(|d| d.is_dir())
                .cloned()
                .collect();
            journal.commit(
                seq,
                Effect {
                    old_path: step.source.clone(),
                    new_path: step.destination.clone(),
                    old_hash: expected.clone(),
                    size: step.size,
                    created_dirs,
                    committed_at: Utc::now(),
                },
            )?;
            provenance.record_relocation(&step.source, &step.destination, seq, LineageDirection::Apply)?;
            Ok(ReconcileOutcome::Completed {
                seq,
                path: step.destination.clone(),
            })
        }
        (State::Hash(h), State::Absent) if &h == expected => {
            fsops::remove_empty_dirs(&intent.missing_dirs);
            let reason = "effect never reached disk".to_string();
            journal.discard(seq, &reason)?;
            Ok(ReconcileOutcome::Discarded { seq, reason })
        }
        (State::Hash(s), State::Hash(d)) if &s == expected && &d == expected => {
            fs::remove_file(&step.destination).map_err(|e| Error::io_at(&step.destination, e))?;
            fsops::remove_empty_dirs(&intent.missing_dirs);
            let reason = "interrupted copy removed; source intact".to_string();
            journal.discard(seq, &reason)?;
            Ok(ReconcileOutcome::Discarded { seq, reason })
        }
        (source, destination) => Ok(ReconcileOutcome::Unresolved {
            seq,
            reason: format!(
                "source {} is {}, destination {} is {}",
                step.source.display(),
                source.describe(expected),
                step.destination.display(),
                destination.describe(expected)
            ),
        }),
    }
}

/// Write lineage rows missing for committed entries, and for undone entries
/// missing their `undo` row. Covers a crash or a failed insert between a
/// journal record and its lineage row, wherever it sits in the sequence.
pub fn backfill_lineage(journal: &Journal, db: &Database) -> Result<usize, Error> {
    let applied: AHashSet<u64> = db
        .lineage_seqs(LineageDirection::Apply.as_str())?
        .into_iter()
        .map(|seq| seq.max(0) as u64)
        .collect();
    let undone: AHashSet<u64> = db
        .lineage_seqs(LineageDirection::Undo.as_str())?
        .into_iter()
        .map(|seq| seq.max(0) as u64)
        .collect();
    let provenance = ProvenanceStore::new(db);
    let mut written = 0;
    for entry in journal.entries() {
        if !applied.contains(&entry.seq) {
            debug!("Backfilling apply lineage for #{}", entry.seq);
            provenance.record_relocation(
                &entry.effect.old_path,
                &entry.effect.new_path,
                entry.seq,
                LineageDirection::Apply,
            )?;
            written += 1;
        }
        if journal.is_undone(entry.seq) && !undone.contains(&entry.seq) {
            debug!("Backfilling undo lineage for #{}", entry.seq);
            provenance.record_relocation(
                &entry.inverse.from,
                &entry.inverse.to,
                entry.seq,
                LineageDirection::Undo,
            )?;
            written += 1;
        }
    }
    if written > 0 {
        info!("Backfilled {} lineage rows", written);
    }
    Ok(written)
}

enum State {
    Absent,
    Hash(ContentHash),
    Unreadable(String),
}

impl State {
    fn describe(&self, expected: &ContentHash) -> String {
        match self {
            State::Absent => "absent".to_string(),
            State::Hash(h) if h == expected => "present with the expected content".to_string(),
            State::Hash(h) => format!("present with different content ({})", h.short()),
            State::Unreadable(e) => format!("unreadable ({})", e),
        }
    }
}

fn read_hash(path: &Path) -> State {
    if path.symlink_metadata().is_err() {
        return State::Absent;
    }
    match digest::hash_file(path, DEFAULT_STREAMING_THRESHOLD) {
        Ok(hash) => State::Hash(hash),
        Err(e) => State::Unreadable(e.to_string()),
    }
}
