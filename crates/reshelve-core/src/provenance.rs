use crate::hasher::ContentHash;
use crate::storage::models::{ArchiveRow, ProvenanceRow};
use crate::storage::Database;
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Hops followed backwards through relocation lineage before giving up.
const MAX_LINEAGE_DEPTH: usize = 64;

/// Identifies one extracted archive: the short content hash of the archive file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveId(String);

impl ArchiveId {
    pub fn new(id: impl Into<String>) -> Self {
        ArchiveId(id.into())
    }

    pub fn from_content(hash: &ContentHash) -> Self {
        ArchiveId(hash.short().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub archive_id: ArchiveId,
    pub internal_path: String,
    pub extracted_path: PathBuf,
    pub content_hash: ContentHash,
    pub extracted_at: DateTime<Utc>,
    pub parent_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Provenance {
    Tracked(ProvenanceRecord),
    Untracked,
}

impl Provenance {
    pub fn record(&self) -> Option<&ProvenanceRecord> {
        match self {
            Provenance::Tracked(record) => Some(record),
            Provenance::Untracked => None,
        }
    }

    pub fn archive_id(&self) -> Option<&ArchiveId> {
        self.record().map(|r| &r.archive_id)
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self, Provenance::Tracked(_))
    }
}

pub enum ProvenanceKey<'k> {
    Path(&'k Path),
    Hash(&'k ContentHash),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub archive_id: ArchiveId,
    pub name: String,
    pub source_path: PathBuf,
    pub extracted_at: DateTime<Utc>,
    pub file_count: u64,
}

impl ArchiveInfo {
    /// Archive file name without its archive extensions (`photos.tar.gz` -> `photos`).
    pub fn stem(&self) -> String {
        archive_stem(&self.name)
    }
}

pub fn archive_stem(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    for suffix in [".tar.gz", ".tar.bz2", ".tar.xz", ".tgz", ".tar", ".zip"] {
        if lower.ends_with(suffix) && lower.len() > suffix.len() {
            return name[..name.len() - suffix.len()].to_string();
        }
    }
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineageDirection {
    Apply,
    Undo,
}

impl LineageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            LineageDirection::Apply => "apply",
            LineageDirection::Undo => "undo",
        }
    }
}

/// Durable record of where extracted files came from. Append-only: rows are
/// never updated or removed.
pub struct ProvenanceStore<'a> {
    db: &'a Database,
}

impl<'a> ProvenanceStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn register_archive(
        &self,
        archive_id: &ArchiveId,
        name: &str,
        source_path: &Path,
        content_hash: &ContentHash,
        extracted_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let inserted = self.db.insert_archive(&ArchiveRow {
            archive_id: archive_id.as_str().to_string(),
            archive_name: name.to_string(),
            source_path: source_path.to_string_lossy().into_owned(),
            content_hash: content_hash.as_str().to_string(),
            extracted_at: extracted_at.to_rfc3339(),
            file_count: 0,
        })?;
        if inserted == 0 {
            debug!("Archive {} already registered", archive_id);
        }
        Ok(())
    }

    pub fn finish_archive(&self, archive_id: &ArchiveId) -> Result<u64, Error> {
        let count = self.db.count_provenance_for_archive(archive_id.as_str())?;
        self.db
            .update_archive_file_count(archive_id.as_str(), count)?;
        Ok(count as u64)
    }

    /// Record that `extracted_path` came out of `archive_id`.
    ///
    /// Re-recording the same path for the same archive is a no-op. A path
    /// already owned by a different archive is refused.
    pub fn record_extraction(
        &self,
        archive_id: &ArchiveId,
        internal_path: &str,
        extracted_path: &Path,
        content_hash: &ContentHash,
        timestamp: DateTime<Utc>,
    ) -> Result<(), Error> {
        let key = extracted_path.to_string_lossy();
        if let Some(existing) = self.db.get_provenance_by_path(&key)? {
            if existing.archive_id == archive_id.as_str() {
                debug!("Provenance for {} already recorded", key);
                return Ok(());
            }
            return Err(Error::DuplicateProvenance {
                path: extracted_path.to_path_buf(),
                existing: existing.archive_id,
                incoming: archive_id.as_str().to_string(),
            });
        }

        let parent_dir = extracted_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.db.insert_provenance(&ProvenanceRow {
            id: 0,
            extracted_path: key.into_owned(),
            content_hash: content_hash.as_str().to_string(),
            archive_id: archive_id.as_str().to_string(),
            internal_path: internal_path.to_string(),
            extracted_at: timestamp.to_rfc3339(),
            parent_dir,
        })?;
        Ok(())
    }

    /// Note that a committed step moved a file. Recording the same journal
    /// sequence twice in one direction is ignored.
    pub fn record_relocation(
        &self,
        from: &Path,
        to: &Path,
        seq: u64,
        direction: LineageDirection,
    ) -> Result<(), Error> {
        self.db.insert_lineage(
            &from.to_string_lossy(),
            &to.to_string_lossy(),
            seq as i64,
            direction.as_str(),
        )?;
        Ok(())
    }

    pub fn lookup(&self, key: ProvenanceKey<'_>) -> Result<Provenance, Error> {
        match key {
            ProvenanceKey::Path(path) => self.lookup_path(path),
            ProvenanceKey::Hash(hash) => {
                let rows = self.db.get_provenance_by_hash(hash.as_str())?;
                match rows.into_iter().next() {
                    Some(row) => Ok(Provenance::Tracked(to_record(row)?)),
                    None => Ok(Provenance::Untracked),
                }
            }
        }
    }

    /// Provenance for a file currently at `path` with content `hash`. Lineage
    /// leading to a record for different content is treated as untracked.
    pub fn lookup_file(&self, path: &Path, hash: &ContentHash) -> Result<Provenance, Error> {
        match self.lookup_path(path)? {
            Provenance::Tracked(record) if &record.content_hash == hash => {
                Ok(Provenance::Tracked(record))
            }
            _ => Ok(Provenance::Untracked),
        }
    }

    fn lookup_path(&self, path: &Path) -> Result<Provenance, Error> {
        let mut current = path.to_string_lossy().into_owned();
        let mut before_id = i64::MAX;
        for _ in 0..MAX_LINEAGE_DEPTH {
            if let Some(row) = self.db.get_provenance_by_path(&current)? {
                return Ok(Provenance::Tracked(to_record(row)?));
            }
            match self.db.latest_lineage_into(&current, before_id)? {
                Some(hop) => {
                    current = hop.from_path;
                    before_id = hop.id;
                }
                None => return Ok(Provenance::Untracked),
            }
        }
        warn!("Lineage for {} deeper than {} hops", path.display(), MAX_LINEAGE_DEPTH);
        Ok(Provenance::Untracked)
    }

    pub fn archives(&self) -> Result<Vec<ArchiveInfo>, Error> {
        self.db
            .list_archives()?
            .into_iter()
            .map(|row| {
                Ok(ArchiveInfo {
                    archive_id: ArchiveId::new(row.archive_id),
                    name: row.archive_name,
                    source_path: PathBuf::from(row.source_path),
                    extracted_at: parse_timestamp(&row.extracted_at)?,
                    file_count: row.file_count.max(0) as u64,
                })
            })
            .collect()
    }
}

fn to_record(row: ProvenanceRow) -> Result<ProvenanceRecord, Error> {
    Ok(ProvenanceRecord {
        archive_id: ArchiveId::new(row.archive_id),
        internal_path: row.internal_path,
        extracted_path: PathBuf::from(row.extracted_path),
        content_hash: ContentHash::from_hex(row.content_hash),
        extracted_at: parse_timestamp(&row.extracted_at)?,
        parent_dir: PathBuf::from(row.parent_dir),
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("Bad timestamp '{}' in provenance store: {}", raw, e)))
}
