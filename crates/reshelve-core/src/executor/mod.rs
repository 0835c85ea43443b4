//! The only component allowed to mutate the filesystem.
//!
//! Steps run one at a time in chunk order. Each one is guard-checked,
//! precondition-checked, announced in the journal, applied, and committed to
//! the journal before the next step starts.

pub mod fsops;
pub mod guard;

use crate::hasher::{digest, ContentHash};
use crate::journal::{Effect, Journal, JournalEntry};
use crate::plan::chunk::{ApprovalToken, Chunk};
use crate::plan::step::{StepKind, StepSpec};
use crate::progress::ProgressReporter;
use crate::provenance::{LineageDirection, ProvenanceStore};
use crate::Error;
use chrono::Utc;
use guard::GuardSet;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Source gone and destination already holds the content.
    AlreadyApplied,
    Cancelled,
    /// An earlier step in the chunk failed while applying its effect.
    ChunkStopped,
    DryRun,
    NoOp,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedStep {
    pub step: StepSpec,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub step: StepSpec,
    pub error: String,
    /// Guard refusals and similar errors the operator must always see.
    pub surfaced: bool,
}

impl StepFailure {
    fn new(step: &StepSpec, error: &Error) -> Self {
        Self {
            step: step.clone(),
            error: error.to_string(),
            surfaced: error.is_surfaced(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResult {
    pub chunk_id: String,
    pub committed: Vec<JournalEntry>,
    pub skipped: Vec<SkippedStep>,
    pub errors: Vec<StepFailure>,
    /// Gated chunk presented without a matching approval token.
    pub withheld: bool,
}

impl ChunkResult {
    fn new(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            committed: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            withheld: false,
        }
    }

    fn skip_rest(&mut self, steps: &[StepSpec], reason: SkipReason) {
        self.skipped.extend(steps.iter().map(|step| SkippedStep {
            step: step.clone(),
            reason,
        }));
    }
}

enum Ready {
    Apply,
    AlreadyApplied,
}

pub struct Executor<'a> {
    journal: &'a mut Journal,
    provenance: ProvenanceStore<'a>,
    guards: &'a GuardSet,
    run_id: String,
    dry_run: bool,
    streaming_threshold: u64,
    cancel: Arc<AtomicBool>,
    reporter: Option<&'a dyn ProgressReporter>,
}

impl<'a> Executor<'a> {
    pub fn new(
        journal: &'a mut Journal,
        provenance: ProvenanceStore<'a>,
        guards: &'a GuardSet,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            journal,
            provenance,
            guards,
            run_id: run_id.into(),
            dry_run: false,
            streaming_threshold: crate::config::DEFAULT_STREAMING_THRESHOLD,
            cancel: Arc::new(AtomicBool::new(false)),
            reporter: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn streaming_threshold(mut self, threshold: u64) -> Self {
        self.streaming_threshold = threshold;
        self
    }

    /// Share a cancellation flag. Once set, no new step starts; committed
    /// steps stay committed.
    pub fn with_cancel_token(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_reporter(mut self, reporter: &'a dyn ProgressReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    fn step_done(&self, chunk: &Chunk) {
        if let Some(reporter) = self.reporter {
            reporter.on_step_complete(&chunk.id);
        }
    }

    /// Apply one chunk.
    ///
    /// Guard refusals and failed preconditions are isolated to their step.
    /// A failure while performing an effect stops the chunk: earlier steps
    /// stay committed and the remainder is reported as skipped. Journal
    /// write failures are returned as errors.
    pub fn apply(&mut self, chunk: &Chunk, approval: Option<&ApprovalToken>) -> Result<ChunkResult, Error> {
        let mut result = ChunkResult::new(chunk);

        if chunk.requires_approval && !approval.is_some_and(|token| token.matches(chunk)) {
            let blocked = Error::LowConfidenceBlocked {
                chunk_id: chunk.id.clone(),
            };
            warn!("{}", blocked);
            result.withheld = true;
            return Ok(result);
        }
        if !self.dry_run {
            self.journal.ensure_writable()?;
        }
        debug!("Applying chunk {} ({} steps)", chunk.id, chunk.len());

        for (idx, step) in chunk.steps.iter().enumerate() {
            if idx > 0 {
                self.step_done(chunk);
            }
            if self.cancel.load(Ordering::SeqCst) {
                info!("Cancelled; {} steps of {} not started", chunk.len() - idx, chunk.id);
                result.skip_rest(&chunk.steps[idx..], SkipReason::Cancelled);
                break;
            }
            if step.kind == StepKind::NoOp {
                result.skip_rest(std::slice::from_ref(step), SkipReason::NoOp);
                continue;
            }

            if let Err(e) = self
                .guards
                .check(&step.source)
                .and_then(|_| self.guards.check(&step.destination))
            {
                warn!("Refused {} {}: {}", step.kind, step.source.display(), e);
                result.errors.push(StepFailure::new(step, &e));
                continue;
            }

            match self.preconditions(step) {
                Ok(Ready::Apply) => {}
                Ok(Ready::AlreadyApplied) => {
                    debug!("{} already at {}", step.source.display(), step.destination.display());
                    result.skip_rest(std::slice::from_ref(step), SkipReason::AlreadyApplied);
                    continue;
                }
                Err(e) => {
                    warn!("Skipping {}: {}", step.source.display(), e);
                    result.errors.push(StepFailure::new(step, &e));
                    continue;
                }
            }

            if self.dry_run {
                info!(
                    "[dry run] {} {} -> {}",
                    step.kind,
                    step.source.display(),
                    step.destination.display()
                );
                result.skip_rest(std::slice::from_ref(step), SkipReason::DryRun);
                continue;
            }

            match self.perform(chunk, step)? {
                Ok(entry) => result.committed.push(entry),
                Err(e) => {
                    error!("Step failed in {}, stopping chunk: {}", chunk.id, e);
                    result.errors.push(StepFailure::new(step, &e));
                    result.skip_rest(&chunk.steps[idx + 1..], SkipReason::ChunkStopped);
                    break;
                }
            }
        }

        self.step_done(chunk);
        info!(
            "Chunk {}: {} committed, {} skipped, {} failed",
            chunk.id,
            result.committed.len(),
            result.skipped.len(),
            result.errors.len()
        );
        Ok(result)
    }

    fn preconditions(&self, step: &StepSpec) -> Result<Ready, Error> {
        let source = self.hash_if_present(&step.source)?;
        let destination = self.hash_if_present(&step.destination)?;

        match (&source, &destination) {
            (None, Some(dest)) if dest == &step.hash => return Ok(Ready::AlreadyApplied),
            (None, _) => {
                return Err(Error::Precondition {
                    path: step.source.clone(),
                    reason: "source no longer exists".to_string(),
                })
            }
            (Some(found), _) if found != &step.hash => {
                return Err(Error::Precondition {
                    path: step.source.clone(),
                    reason: format!("content changed since planning (now {})", found.short()),
                })
            }
            (Some(_), Some(_)) => {
                return Err(Error::Precondition {
                    path: step.destination.clone(),
                    reason: "destination already exists".to_string(),
                })
            }
            (Some(_), None) => {}
        }

        if step.kind == StepKind::Delete {
            let canonical = step.canonical.as_deref().ok_or_else(|| Error::Precondition {
                path: step.source.clone(),
                reason: "no retained copy recorded".to_string(),
            })?;
            if canonical == step.source
                || self.hash_if_present(canonical)?.as_ref() != Some(&step.hash)
            {
                return Err(Error::Precondition {
                    path: step.source.clone(),
                    reason: format!("retained copy {} is not intact", canonical.display()),
                });
            }
        }
        Ok(Ready::Apply)
    }

    /// Outer `Err` is a journal failure; inner `Err` is the step's own failure.
    fn perform(&mut self, chunk: &Chunk, step: &StepSpec) -> Result<Result<JournalEntry, Error>, Error> {
        let missing = fsops::missing_ancestors(&step.destination);
        let seq = self.journal.begin(&self.run_id, &chunk.id, step, missing)?;

        let created = match fsops::ensure_parent(&step.destination) {
            Ok(created) => created,
            Err(e) => {
                self.journal.discard(seq, &e.to_string())?;
                return Ok(Err(Error::io_at(&step.destination, e)));
            }
        };
        if let Err(e) = fsops::move_no_clobber(&step.source, &step.destination) {
            fsops::remove_empty_dirs(&created);
            self.journal.discard(seq, &e.to_string())?;
            return Ok(Err(Error::io_at(&step.source, e)));
        }
        if let Some(parent) = step.destination.parent() {
            fsops::sync_dir(parent);
        }

        let entry = self.journal.commit(
            seq,
            Effect {
                old_path: step.source.clone(),
                new_path: step.destination.clone(),
                old_hash: step.hash.clone(),
                size: step.size,
                created_dirs: created,
                committed_at: Utc::now(),
            },
        )?;
        if let Err(e) = self.provenance.record_relocation(
            &step.source,
            &step.destination,
            seq,
            LineageDirection::Apply,
        ) {
            warn!("Lineage for #{} not recorded ({}); recovery will backfill it", seq, e);
        }
        debug!(
            "#{} {} {} -> {}",
            seq,
            step.kind,
            step.source.display(),
            step.destination.display()
        );
        Ok(Ok(entry))
    }

    fn hash_if_present(&self, path: &Path) -> Result<Option<ContentHash>, Error> {
        if path.symlink_metadata().is_err() {
            return Ok(None);
        }
        digest::hash_file(path, self.streaming_threshold)
            .map(Some)
            .map_err(|e| Error::io_at(path, e))
    }
}
