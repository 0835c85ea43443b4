use crate::classify::ProposalOrigin;
use crate::hasher::ContentHash;
use crate::provenance::ArchiveId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Move,
    Rename,
    RelocateDuplicate,
    Delete,
    NoOp,
}

impl StepKind {
    /// Steps of this kind always need an approval token.
    pub fn always_gated(self) -> bool {
        matches!(self, StepKind::Delete)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepKind::Move => "move",
            StepKind::Rename => "rename",
            StepKind::RelocateDuplicate => "relocate-duplicate",
            StepKind::Delete => "delete",
            StepKind::NoOp => "no-op",
        };
        f.write_str(label)
    }
}

/// One proposed filesystem action. Built by the planner, consumed once by the
/// executor and then archived inside its journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub kind: StepKind,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub hash: ContentHash,
    pub size: u64,
    #[serde(default)]
    pub chunk_id: String,
    #[serde(default)]
    pub category: Option<String>,
    pub confidence: f64,
    pub origin: ProposalOrigin,
    #[serde(default)]
    pub archive_id: Option<ArchiveId>,
    /// For duplicate relocations and deletes: where the retained copy lives
    /// once earlier chunks have committed.
    #[serde(default)]
    pub canonical: Option<PathBuf>,
}

impl StepSpec {
    pub fn new(kind: StepKind, source: PathBuf, destination: PathBuf, hash: ContentHash, size: u64) -> Self {
        Self {
            kind,
            source,
            destination,
            hash,
            size,
            chunk_id: String::new(),
            category: None,
            confidence: 1.0,
            origin: ProposalOrigin::Rule,
            archive_id: None,
            canonical: None,
        }
    }
}
