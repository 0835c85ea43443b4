/// An archive whose contents were extracted by the engine.
#[derive(Debug, Clone)]
pub struct ArchiveRow {
    pub archive_id: String,
    pub archive_name: String,
    pub source_path: String,
    pub content_hash: String,
    pub extracted_at: String,
    pub file_count: i64,
}

/// One extracted file's origin.
#[derive(Debug, Clone)]
pub struct ProvenanceRow {
    pub id: i64,
    pub extracted_path: String,
    pub content_hash: String,
    pub archive_id: String,
    pub internal_path: String,
    pub extracted_at: String,
    pub parent_dir: String,
}

/// A committed relocation (or its undo) recorded for provenance lookups.
#[derive(Debug, Clone)]
pub struct LineageRow {
    pub id: i64,
    pub from_path: String,
    pub to_path: String,
    pub journal_seq: i64,
    pub direction: String,
    pub recorded_at: String,
}

#[derive(Debug, Clone)]
pub struct CachedHash {
    pub path: String,
    pub file_size: i64,
    pub mtime_nanos: i64,
    pub signature: i64,
    pub content_hash: String,
}

/// One invocation of the organize pipeline.
#[derive(Debug, Clone)]
pub struct RunSession {
    pub id: i64,
    pub run_id: String,
    pub root_path: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub files_scanned: i64,
    pub report_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PurgeAudit {
    pub id: i64,
    pub purged_at: String,
    pub before_seq: i64,
    pub entries_removed: i64,
    pub blobs_removed: i64,
    pub note: Option<String>,
}
