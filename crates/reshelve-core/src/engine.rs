use crate::archive::{ArchiveExtractor, ExtractionReport};
use crate::classify::{ChainClassifier, DecisionSet, RuleClassifier};
use crate::config::{self, AppConfig};
use crate::dedup::{DedupIndex, DedupStats, Member};
use crate::error::Error;
use crate::executor::guard::GuardSet;
use crate::executor::Executor;
use crate::hasher::ContentHash;
use crate::journal::recovery::{self, ReconcileOutcome};
use crate::journal::undo::{self, UndoReport};
use crate::journal::{self, Journal, PurgeSummary};
use crate::plan::chunk::ApprovalToken;
use crate::plan::{ChunkPlanner, DuplicateMode, Plan};
use crate::progress::ProgressReporter;
use crate::provenance::ProvenanceStore;
use crate::report::{RunReport, WithheldChunk};
use crate::scanner::walk::{compile_patterns, WalkOptions};
use crate::scanner::{FingerprintOptions, Fingerprinter, ScanSummary};
use crate::storage::models::RunSession;
use crate::storage::Database;
use chrono::Utc;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const DATABASE_FILE_NAME: &str = "reshelve.db";
const SCAN_PROGRESS_INTERVAL: usize = 100;

/// Which journal entries `undo` reverts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoSelection {
    /// Everything the most recent committing run wrote.
    LastRun,
    Run(String),
    Range(RangeInclusive<u64>),
}

/// A plan together with the scan it was derived from.
#[derive(Debug)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub report: RunReport,
}

/// Drives one organize root: scan, provenance, dedup, planning, execution and
/// the journal-backed maintenance commands.
pub struct OrganizeEngine {
    config: AppConfig,
    root: PathBuf,
    decisions: Option<PathBuf>,
    duplicate_mode: DuplicateMode,
    approvals: Vec<ApprovalToken>,
    approved_only: bool,
    cancel: Arc<AtomicBool>,
}

struct State {
    db: Database,
    state_dir: PathBuf,
}

struct Prepared {
    plan: Plan,
    stats: DedupStats,
    scan: ScanSummary,
    guards: GuardSet,
}

impl OrganizeEngine {
    pub fn new(config: AppConfig, root: impl AsRef<Path>) -> Result<Self, Error> {
        config.validate()?;
        let root = root.as_ref();
        let root = fs::canonicalize(root).map_err(|e| Error::io_at(root, e))?;
        Ok(Self {
            config,
            root,
            decisions: None,
            duplicate_mode: DuplicateMode::default(),
            approvals: Vec::new(),
            approved_only: false,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Advisory decisions (JSON) consulted before the rule table.
    pub fn with_decisions(mut self, path: impl Into<PathBuf>) -> Self {
        self.decisions = Some(path.into());
        self
    }

    pub fn with_duplicate_mode(mut self, mode: DuplicateMode) -> Self {
        self.duplicate_mode = mode;
        self
    }

    pub fn with_approvals(mut self, tokens: impl IntoIterator<Item = ApprovalToken>) -> Self {
        self.approvals.extend(tokens);
        self
    }

    /// Apply only the chunks named by approval tokens.
    pub fn approved_only(mut self, approved_only: bool) -> Self {
        self.approved_only = approved_only;
        self
    }

    pub fn with_cancel_token(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Scan and plan without touching the tree or the journal.
    pub fn plan(&self, reporter: &dyn ProgressReporter) -> Result<PlanOutcome, Error> {
        let state = self.open_state()?;
        let pending = Journal::read(journal::journal_path(&state.state_dir))?.pending_intents();
        if !pending.is_empty() {
            warn!(
                "{} journal intents are unresolved; run recovery before applying this plan",
                pending.len()
            );
        }

        let mut report = RunReport::new(new_run_id(), &self.root, true);
        let prepared = self.prepare(&state, reporter)?;
        report.record_scan(&prepared.scan);
        report.record_plan(&prepared.plan, &prepared.stats);
        report
            .withheld
            .extend(prepared.plan.gated_chunks().map(WithheldChunk::for_chunk));
        report.finished_at = Some(Utc::now());
        Ok(PlanOutcome {
            plan: prepared.plan,
            report,
        })
    }

    /// Run the full pipeline:
    /// 1. Reconcile in-doubt journal intents
    /// 2. Scan and fingerprint the root
    /// 3. Attach provenance and build the dedup index
    /// 4. Plan chunks from classifier proposals and duplicates
    /// 5. Apply chunks in order, journaling every step
    pub fn run(&self, reporter: &dyn ProgressReporter) -> Result<RunReport, Error> {
        let run_start = Instant::now();
        let state = self.open_state()?;
        let mut journal = Journal::open(journal::journal_path(&state.state_dir))?;
        let run_id = new_run_id();
        let dry_run = self.config.dry_run;
        let mut report = RunReport::new(&run_id, &self.root, dry_run);

        report.reconciled = self.reconcile(&state, &mut journal)?;
        state
            .db
            .create_run_session(&run_id, &self.root.to_string_lossy())?;
        info!("Run {} started on {}", run_id, self.root.display());

        let result = self.execute(&state, &mut journal, &run_id, &mut report, reporter);
        report.finished_at = Some(Utc::now());
        report.journal_range = journal.range_for_run(&run_id);

        let status = match &result {
            Ok(()) => report.status(),
            Err(Error::Cancelled) => {
                report.cancelled = true;
                report.status()
            }
            Err(_) => "failed",
        };
        state.db.complete_run_session(
            &run_id,
            status,
            report.files_scanned as i64,
            &report.to_json()?,
        )?;
        reporter.on_run_complete(run_start.elapsed().as_secs_f64());
        info!(
            "Run {} {}: {} committed, {} withheld chunks, {} errors",
            run_id,
            status,
            report.committed(),
            report.withheld.len(),
            report.errors.len()
        );

        match result {
            Ok(()) | Err(Error::Cancelled) => Ok(report),
            Err(e) => Err(e),
        }
    }

    fn execute(
        &self,
        state: &State,
        journal: &mut Journal,
        run_id: &str,
        report: &mut RunReport,
        reporter: &dyn ProgressReporter,
    ) -> Result<(), Error> {
        let prepared = self.prepare(state, reporter)?;
        report.record_scan(&prepared.scan);
        report.record_plan(&prepared.plan, &prepared.stats);
        let plan = &prepared.plan;

        let mut executor = Executor::new(journal, ProvenanceStore::new(&state.db), &prepared.guards, run_id)
            .dry_run(self.config.dry_run)
            .streaming_threshold(self.config.streaming_threshold)
            .with_cancel_token(self.cancel_token())
            .with_reporter(reporter);

        for chunk in &plan.chunks {
            if self.cancel.load(Ordering::SeqCst) {
                info!("Cancelled before chunk {}", chunk.id);
                return Err(Error::Cancelled);
            }
            let approval = self.approvals.iter().find(|t| t.chunk_id == chunk.id);
            if self.approved_only && approval.is_none() {
                debug!("Chunk {} not approved in this pass", chunk.id);
                continue;
            }
            reporter.on_chunk_start(&chunk.id, chunk.len());
            let result = executor.apply(chunk, approval)?;
            reporter.on_chunk_complete(&chunk.id, result.committed.len(), result.errors.len());
            report.record_chunk(chunk, &result);
        }

        if !self.config.dry_run && !self.approved_only {
            let choices: Vec<(String, String)> = plan
                .canonical_choices
                .iter()
                .map(|(hash, path)| (hash.as_str().to_string(), path.to_string_lossy().into_owned()))
                .collect();
            let stored = state.db.store_canonical_choices(&choices)?;
            debug!("Stored {} canonical choices", stored);
        }
        if self.cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn prepare(&self, state: &State, reporter: &dyn ProgressReporter) -> Result<Prepared, Error> {
        let provenance = ProvenanceStore::new(&state.db);

        // Phase 1: Scan
        info!("Scanning {}...", self.root.display());
        reporter.on_scan_start();
        let scan_start = Instant::now();
        let scan = self.scan(&state.db, reporter)?;
        reporter.on_scan_complete(scan.records.len(), scan_start.elapsed().as_secs_f64());
        debug!(
            "Scan completed in {:.2}s: {} files, {} bytes, {} quarantined",
            scan_start.elapsed().as_secs_f64(),
            scan.records.len(),
            scan.total_bytes(),
            scan.quarantined.len()
        );

        // Phase 2: Provenance and dedup
        let sticky = state
            .db
            .load_canonical_choices()?
            .into_iter()
            .map(|(hash, path)| (ContentHash::from_hex(hash), PathBuf::from(path)));
        let mut index = DedupIndex::new(self.config.mixed_origin).with_sticky_choices(sticky);
        let mut members = Vec::with_capacity(scan.records.len());
        for record in &scan.records {
            let origin = provenance.lookup_file(&record.path, &record.hash)?;
            index.observe(record.clone(), origin.clone());
            members.push(Member {
                record: record.clone(),
                provenance: origin,
            });
        }
        let stats = index.stats();
        debug!(
            "{} duplicate groups, {} duplicate files, {} bytes reclaimable",
            stats.groups, stats.duplicate_files, stats.reclaimable_bytes
        );

        // Phase 3: Plan
        let mut classifier = ChainClassifier::new();
        if let Some(path) = &self.decisions {
            classifier = classifier.with(DecisionSet::load(path, &self.root)?);
        }
        let classifier = classifier.with(RuleClassifier::new(
            &self.config.categories,
            self.config.archive_after_days,
            Utc::now(),
        ));
        let guards = GuardSet::new(&self.root, &self.config);
        let plan = ChunkPlanner::new(&self.root, &self.config, &guards)
            .with_archives(provenance.archives()?)
            .with_duplicate_mode(self.duplicate_mode)
            .plan(&members, &index, &classifier);
        reporter.on_plan_complete(plan.chunks.len(), plan.step_count());

        Ok(Prepared {
            plan,
            stats,
            scan,
            guards,
        })
    }

    fn scan(&self, db: &Database, reporter: &dyn ProgressReporter) -> Result<ScanSummary, Error> {
        let options = FingerprintOptions {
            walk: WalkOptions {
                ignore_patterns: compile_patterns(&self.config.ignore_patterns),
                excluded_dirs: vec![
                    self.config.state_dir_for(&self.root),
                    self.config.duplicates_dir_for(&self.root),
                ],
                guard_markers: self.config.guard_markers.clone(),
                resume_after: None,
            },
            streaming_threshold: self.config.streaming_threshold,
            batch_size: self.config.hash_batch_size,
            workers: self.config.hash_workers,
        };
        let fingerprinter = Fingerprinter::new(Some(db), options)?;

        let mut summary = ScanSummary::default();
        let mut seen = 0usize;
        for event in fingerprinter.scan(&self.root) {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            summary.push(event);
            seen += 1;
            if seen % SCAN_PROGRESS_INTERVAL == 0 {
                let current = summary
                    .records
                    .last()
                    .map(|r| r.path.to_string_lossy().into_owned())
                    .unwrap_or_default();
                reporter.on_scan_progress(summary.records.len(), &current);
            }
        }
        Ok(summary)
    }

    /// Resolve in-doubt intents left by an interrupted run.
    pub fn recover(&self) -> Result<Vec<ReconcileOutcome>, Error> {
        let state = self.open_state()?;
        let mut journal = Journal::open(journal::journal_path(&state.state_dir))?;
        self.reconcile(&state, &mut journal)
    }

    fn reconcile(&self, state: &State, journal: &mut Journal) -> Result<Vec<ReconcileOutcome>, Error> {
        let outcomes = recovery::reconcile(journal, &ProvenanceStore::new(&state.db))?;
        recovery::backfill_lineage(journal, &state.db)?;
        Ok(outcomes)
    }

    pub fn undo(&self, selection: UndoSelection) -> Result<UndoReport, Error> {
        let state = self.open_state()?;
        let mut journal = Journal::open(journal::journal_path(&state.state_dir))?;
        self.reconcile(&state, &mut journal)?;

        let range = match selection {
            UndoSelection::Range(range) => range,
            UndoSelection::Run(run_id) => {
                let (first, last) = journal
                    .range_for_run(&run_id)
                    .ok_or_else(|| Error::Other(format!("Run {} committed nothing", run_id)))?;
                first..=last
            }
            UndoSelection::LastRun => {
                let (run_id, first, last) = journal
                    .last_run_range()
                    .ok_or_else(|| Error::Other("Journal has no committed entries".to_string()))?;
                info!("Undoing run {}", run_id);
                first..=last
            }
        };
        undo::undo(&mut journal, &ProvenanceStore::new(&state.db), range)
    }

    /// Drop journal history below `before_seq` and empty the matching
    /// graveyard files.
    pub fn purge(&self, before_seq: u64) -> Result<PurgeSummary, Error> {
        let state = self.open_state()?;
        let mut journal = Journal::open(journal::journal_path(&state.state_dir))?;
        self.reconcile(&state, &mut journal)?;
        journal.purge(before_seq, &state.db)
    }

    /// Stored report for `run_id`, or the latest run.
    pub fn report(&self, run_id: Option<&str>) -> Result<Option<RunReport>, Error> {
        let state = self.open_state()?;
        let session = match run_id {
            Some(id) => state.db.get_run_session(id)?,
            None => state.db.latest_run_session()?,
        };
        match session.and_then(|s| s.report_json) {
            Some(json) => Ok(Some(RunReport::from_json(&json)?)),
            None => Ok(None),
        }
    }

    /// Recorded runs, newest first, with the total count.
    pub fn runs(&self, offset: i64, limit: i64) -> Result<(Vec<RunSession>, i64), Error> {
        let state = self.open_state()?;
        Ok(state.db.list_run_sessions(offset, limit)?)
    }

    /// Extract an archive into the root's extraction area with provenance.
    pub fn extract(&self, archive_path: &Path) -> Result<ExtractionReport, Error> {
        let state = self.open_state()?;
        ArchiveExtractor::new(
            ProvenanceStore::new(&state.db),
            self.config.extraction_dir_for(&self.root),
        )
        .streaming_threshold(self.config.streaming_threshold)
        .extract(archive_path)
    }

    fn open_state(&self) -> Result<State, Error> {
        let state_dir = self.config.state_dir_for(&self.root);
        fs::create_dir_all(&state_dir).map_err(|e| Error::io_at(&state_dir, e))?;
        let db = Database::open(state_dir.join(DATABASE_FILE_NAME))?;
        Ok(State { db, state_dir })
    }
}

/// Roots from the configuration with nested ones collapsed.
pub fn configured_roots(config: &AppConfig) -> Vec<PathBuf> {
    config::non_overlapping_directories(config.root_paths.clone())
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

fn new_run_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d-%H%M%S-%3f"),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
