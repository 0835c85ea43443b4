//! Machine-readable summary of one run, stored as JSON in `run_session`.

use crate::dedup::DedupStats;
use crate::executor::ChunkResult;
use crate::journal::recovery::ReconcileOutcome;
use crate::plan::chunk::{ApprovalToken, Chunk};
use crate::plan::step::StepKind;
use crate::plan::{Plan, Refusal};
use crate::scanner::ScanSummary;
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathNote {
    pub path: PathBuf,
    pub reason: String,
}

impl From<&Refusal> for PathNote {
    fn from(refusal: &Refusal) -> Self {
        PathNote {
            path: refusal.path.clone(),
            reason: refusal.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateSummary {
    pub groups: usize,
    pub duplicate_files: usize,
    pub reclaimable_bytes: u64,
    pub relocated: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunk_id: String,
    pub partition: String,
    pub steps: usize,
    pub committed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub requires_approval: bool,
}

/// A gated chunk that was not applied. `token` is what `approve` accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithheldChunk {
    pub chunk_id: String,
    pub steps: usize,
    pub lowest_confidence: f64,
    pub token: String,
}

impl WithheldChunk {
    pub fn for_chunk(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            steps: chunk.len(),
            lowest_confidence: chunk.steps.iter().map(|s| s.confidence).fold(1.0, f64::min),
            token: ApprovalToken::for_chunk(chunk).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub chunk_id: String,
    pub kind: String,
    pub path: PathBuf,
    pub error: String,
    pub surfaced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub cancelled: bool,
    pub files_scanned: usize,
    pub bytes_scanned: u64,
    pub quarantined: Vec<PathNote>,
    pub guarded_roots: Vec<PathNote>,
    /// Guard refusals from planning and execution.
    pub refusals: Vec<PathNote>,
    pub rejected: Vec<PathNote>,
    pub settled: usize,
    pub unclassified: usize,
    pub nested_skipped: usize,
    pub duplicates: DuplicateSummary,
    /// Committed steps per top-level destination folder.
    pub moves_by_destination: BTreeMap<String, usize>,
    pub chunks: Vec<ChunkSummary>,
    pub withheld: Vec<WithheldChunk>,
    pub errors: Vec<StepError>,
    pub reconciled: Vec<ReconcileOutcome>,
    pub journal_range: Option<(u64, u64)>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, root: &Path, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            root: root.to_path_buf(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            cancelled: false,
            files_scanned: 0,
            bytes_scanned: 0,
            quarantined: Vec::new(),
            guarded_roots: Vec::new(),
            refusals: Vec::new(),
            rejected: Vec::new(),
            settled: 0,
            unclassified: 0,
            nested_skipped: 0,
            duplicates: DuplicateSummary::default(),
            moves_by_destination: BTreeMap::new(),
            chunks: Vec::new(),
            withheld: Vec::new(),
            errors: Vec::new(),
            reconciled: Vec::new(),
            journal_range: None,
        }
    }

    pub fn record_scan(&mut self, scan: &ScanSummary) {
        self.files_scanned = scan.records.len();
        self.bytes_scanned = scan.total_bytes();
        self.quarantined = scan
            .quarantined
            .iter()
            .map(|q| PathNote {
                path: q.path.clone(),
                reason: q.reason.clone(),
            })
            .collect();
        self.guarded_roots = scan
            .guarded_roots
            .iter()
            .map(|(path, reason)| PathNote {
                path: path.clone(),
                reason: reason.clone(),
            })
            .collect();
    }

    pub fn record_plan(&mut self, plan: &Plan, stats: &DedupStats) {
        self.refusals.extend(plan.refusals.iter().map(PathNote::from));
        self.rejected.extend(plan.rejected.iter().map(PathNote::from));
        self.settled = plan.settled;
        self.unclassified = plan.unclassified;
        self.nested_skipped = plan.nested_skipped;
        self.duplicates.groups = stats.groups;
        self.duplicates.duplicate_files = stats.duplicate_files;
        self.duplicates.reclaimable_bytes = stats.reclaimable_bytes;
    }

    pub fn record_chunk(&mut self, chunk: &Chunk, result: &ChunkResult) {
        if result.withheld {
            self.withheld.push(WithheldChunk::for_chunk(chunk));
        }

        for entry in &result.committed {
            match entry.step.kind {
                StepKind::RelocateDuplicate => self.duplicates.relocated += 1,
                StepKind::Delete => self.duplicates.deleted += 1,
                _ => {}
            }
            *self
                .moves_by_destination
                .entry(top_level_folder(&self.root, &entry.effect.new_path))
                .or_default() += 1;
        }

        for failure in &result.errors {
            let error = StepError {
                chunk_id: chunk.id.clone(),
                kind: failure.step.kind.to_string(),
                path: failure.step.source.clone(),
                error: failure.error.clone(),
                surfaced: failure.surfaced,
            };
            if failure.surfaced {
                self.refusals.push(PathNote {
                    path: error.path.clone(),
                    reason: error.error.clone(),
                });
            }
            self.errors.push(error);
        }

        self.chunks.push(ChunkSummary {
            chunk_id: chunk.id.clone(),
            partition: chunk.partition.to_string(),
            steps: chunk.len(),
            committed: result.committed.len(),
            skipped: result.skipped.len(),
            failed: result.errors.len(),
            requires_approval: chunk.requires_approval,
        });
    }

    pub fn committed(&self) -> usize {
        self.chunks.iter().map(|c| c.committed).sum()
    }

    pub fn status(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.dry_run {
            "dry_run"
        } else if !self.errors.is_empty() || !self.withheld.is_empty() {
            "partial"
        } else {
            "completed"
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }
}

/// First component of `path` below `root`, or the parent directory for
/// destinations outside it.
fn top_level_folder(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(relative) => match relative.components().next() {
            Some(Component::Normal(name)) if relative.components().count() > 1 => {
                name.to_string_lossy().into_owned()
            }
            _ => ".".to_string(),
        },
        Err(_) => path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}
