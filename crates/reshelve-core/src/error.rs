use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Extraction tried to claim a path already owned by another archive.
    #[error(
        "Provenance collision on {}: already extracted from archive {existing}, refusing {incoming}",
        path.display()
    )]
    DuplicateProvenance {
        path: PathBuf,
        existing: String,
        incoming: String,
    },

    #[error("Refusing to touch {}: {guard}", path.display())]
    GuardedPath { path: PathBuf, guard: String },

    #[error("Refusing {}: outside the organize root {}", path.display(), root.display())]
    EscapesRoot { path: PathBuf, root: PathBuf },

    #[error("Precondition failed for {}: {reason}", path.display())]
    Precondition { path: PathBuf, reason: String },

    /// Undo stopped at `seq`. Entries in `reverted` were restored before the stop.
    #[error("Undo stopped at journal entry #{seq}: {reason}")]
    UndoConflict {
        seq: u64,
        reason: String,
        reverted: Vec<u64>,
    },

    #[error("Chunk {chunk_id} needs an approval token before it can be applied")]
    LowConfidenceBlocked { chunk_id: String },

    #[error("Journal is corrupt (bad lines: {lines:?}); new commits are halted")]
    JournalCorrupt { lines: Vec<usize> },

    #[error("Journal {} is locked by another process", .0.display())]
    JournalLocked(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Errors the operator must always see, never folded into a generic count.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            Error::GuardedPath { .. }
                | Error::DuplicateProvenance { .. }
                | Error::UndoConflict { .. }
                | Error::EscapesRoot { .. }
        )
    }
}
