use super::{Journal, JournalEntry};
use crate::config::DEFAULT_STREAMING_THRESHOLD;
use crate::executor::fsops;
use crate::hasher::{digest, ContentHash};
use crate::provenance::{LineageDirection, ProvenanceStore};
use crate::Error;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UndoReport {
    /// Reverted entries, in the order they were reverted (newest first).
    pub reverted: Vec<u64>,
    pub already_undone: Vec<u64>,
}

enum Expected {
    Revert,
    /// The inverse already happened on disk but was never recorded.
    AlreadyReverted,
}

/// Replay inverses for `range` in strict reverse sequence order.
///
/// On a corrupt journal only entries settled before the first bad line can
/// be reverted; a range reaching past that is refused as a whole.
///
/// Stops at the first entry whose post-commit state no longer holds and
/// returns `UndoConflict` naming it; entries before it in the range are left
/// untouched.
pub fn undo(
    journal: &mut Journal,
    provenance: &ProvenanceStore<'_>,
    range: RangeInclusive<u64>,
) -> Result<UndoReport, Error> {
    let mut report = UndoReport::default();
    let targets: Vec<JournalEntry> = journal
        .entries()
        .filter(|e| range.contains(&e.seq))
        .rev()
        .cloned()
        .collect();
    // Nothing is reverted unless every target precedes the first corrupt line
    match targets.first() {
        Some(newest) => journal.ensure_replayable(newest.seq)?,
        None => journal.ensure_replayable(0)?,
    }
    info!(
        "Undoing {} journal entries in #{}..=#{}",
        targets.len(),
        range.start(),
        range.end()
    );

    for entry in targets {
        if journal.is_undone(entry.seq) {
            debug!("Entry #{} already undone", entry.seq);
            report.already_undone.push(entry.seq);
            continue;
        }
        let inverse = &entry.inverse;
        let conflict = |reason: String, reverted: &[u64]| Error::UndoConflict {
            seq: entry.seq,
            reason,
            reverted: reverted.to_vec(),
        };

        let expected = match check_state(&inverse.from, &inverse.to, &inverse.expected_hash) {
            Ok(expected) => expected,
            Err(reason) => {
                warn!("Undo conflict at #{}: {}", entry.seq, reason);
                return Err(conflict(reason, &report.reverted));
            }
        };

        if let Expected::Revert = expected {
            fsops::ensure_parent(&inverse.to)
                .and_then(|_| fsops::move_no_clobber(&inverse.from, &inverse.to))
                .map_err(|e| conflict(format!("moving back failed: {}", e), &report.reverted))?;
            match digest::hash_file(&inverse.to, DEFAULT_STREAMING_THRESHOLD) {
                Ok(hash) if hash == inverse.expected_hash => {}
                Ok(hash) => {
                    return Err(conflict(
                        format!("restored {} hashes to {}", inverse.to.display(), hash),
                        &report.reverted,
                    ))
                }
                Err(e) => {
                    return Err(conflict(
                        format!("cannot verify {}: {}", inverse.to.display(), e),
                        &report.reverted,
                    ))
                }
            }
            fsops::remove_empty_dirs(&inverse.remove_dirs);
        }

        journal.mark_undone(entry.seq)?;
        provenance.record_relocation(&inverse.from, &inverse.to, entry.seq, LineageDirection::Undo)?;
        debug!(
            "Undid #{}: {} -> {}",
            entry.seq,
            inverse.from.display(),
            inverse.to.display()
        );
        report.reverted.push(entry.seq);
    }

    info!("Undo reverted {} entries", report.reverted.len());
    Ok(report)
}

fn check_state(from: &Path, to: &Path, expected: &ContentHash) -> Result<Expected, String> {
    let from_hash = hash_if_present(from)?;
    let to_hash = hash_if_present(to)?;
    match (from_hash, to_hash) {
        (Some(h), None) if &h == expected => Ok(Expected::Revert),
        (Some(h), None) => Err(format!(
            "{} was modified since commit (hash {})",
            from.display(),
            h
        )),
        (None, Some(h)) if &h == expected => Ok(Expected::AlreadyReverted),
        (None, _) => Err(format!("{} no longer exists", from.display())),
        (Some(_), Some(_)) => Err(format!("{} is occupied again", to.display())),
    }
}

fn hash_if_present(path: &Path) -> Result<Option<ContentHash>, String> {
    if path.symlink_metadata().is_err() {
        return Ok(None);
    }
    digest::hash_file(path, DEFAULT_STREAMING_THRESHOLD)
        .map(Some)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))
}
