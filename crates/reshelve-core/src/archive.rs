//! Tar archive extraction that records where every produced file came from.

use crate::hasher::{digest, ContentHash};
use crate::provenance::{archive_stem, ArchiveId, ProvenanceStore};
use crate::Error;
use chrono::Utc;
use flate2::read::GzDecoder;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
}

impl Compression {
    fn detect(path: &Path) -> Result<Self, Error> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Compression::Gzip)
        } else if name.ends_with(".tar") {
            Ok(Compression::None)
        } else {
            Err(Error::Other(format!(
                "Unsupported archive format: {}",
                path.display()
            )))
        }
    }
}

/// An entry that was not extracted.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedEntry {
    pub internal_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub archive_id: ArchiveId,
    pub archive_name: String,
    pub destination: PathBuf,
    pub extracted: Vec<PathBuf>,
    /// Entries already on disk with identical content from an earlier extraction.
    pub already_present: Vec<PathBuf>,
    pub rejected: Vec<RejectedEntry>,
    /// Paths owned by a different archive; their records were left untouched.
    pub collisions: Vec<String>,
    pub file_count: u64,
}

/// Extracts `.tar`, `.tar.gz` and `.tgz` archives beneath an extraction
/// directory, one folder per archive stem.
pub struct ArchiveExtractor<'a> {
    provenance: ProvenanceStore<'a>,
    extraction_dir: PathBuf,
    streaming_threshold: u64,
}

impl<'a> ArchiveExtractor<'a> {
    pub fn new(provenance: ProvenanceStore<'a>, extraction_dir: impl Into<PathBuf>) -> Self {
        Self {
            provenance,
            extraction_dir: extraction_dir.into(),
            streaming_threshold: crate::config::DEFAULT_STREAMING_THRESHOLD,
        }
    }

    pub fn streaming_threshold(mut self, threshold: u64) -> Self {
        self.streaming_threshold = threshold;
        self
    }

    /// Extract `archive_path` and record provenance for every regular file.
    ///
    /// Existing files are never overwritten. Extracting the same archive
    /// twice is idempotent.
    pub fn extract(&self, archive_path: &Path) -> Result<ExtractionReport, Error> {
        let compression = Compression::detect(archive_path)?;
        let archive_hash = digest::hash_file(archive_path, self.streaming_threshold)
            .map_err(|e| Error::io_at(archive_path, e))?;
        let archive_id = ArchiveId::from_content(&archive_hash);
        let archive_name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive_id.to_string());
        let destination = self.extraction_dir.join(archive_stem(&archive_name));
        let now = Utc::now();

        info!(
            "Extracting {} as archive {} into {}",
            archive_path.display(),
            archive_id,
            destination.display()
        );
        self.provenance
            .register_archive(&archive_id, &archive_name, archive_path, &archive_hash, now)?;
        fs::create_dir_all(&destination).map_err(|e| Error::io_at(&destination, e))?;

        let mut report = ExtractionReport {
            archive_id: archive_id.clone(),
            archive_name,
            destination: destination.clone(),
            extracted: Vec::new(),
            already_present: Vec::new(),
            rejected: Vec::new(),
            collisions: Vec::new(),
            file_count: 0,
        };

        let mut archive = open_archive(archive_path, compression)?;
        let entries = archive
            .entries()
            .map_err(|e| Error::io_at(archive_path, e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| Error::io_at(archive_path, e))?;
            let internal_path = match entry.path() {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(e) => {
                    warn!("Unreadable entry name in {}: {}", archive_path.display(), e);
                    report.rejected.push(RejectedEntry {
                        internal_path: String::new(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                continue;
            }
            if entry_type != EntryType::Regular && entry_type != EntryType::Continuous {
                report.rejected.push(RejectedEntry {
                    internal_path,
                    reason: format!("unsupported entry type {:?}", entry_type),
                });
                continue;
            }
            let Some(relative) = safe_relative(&internal_path) else {
                warn!("Rejecting unsafe entry path {:?}", internal_path);
                report.rejected.push(RejectedEntry {
                    internal_path,
                    reason: "path escapes the extraction directory".to_string(),
                });
                continue;
            };

            let target = destination.join(&relative);
            let hash = match self.write_entry(&mut entry, &target) {
                Ok(Written::New(hash)) => {
                    report.extracted.push(target.clone());
                    hash
                }
                Ok(Written::Existing(hash)) => {
                    report.already_present.push(target.clone());
                    hash
                }
                Ok(Written::Conflict(reason)) => {
                    warn!("Not extracting {}: {}", target.display(), reason);
                    report.rejected.push(RejectedEntry {
                        internal_path,
                        reason,
                    });
                    continue;
                }
                Err(e) => {
                    warn!("Failed to extract {}: {}", target.display(), e);
                    report.rejected.push(RejectedEntry {
                        internal_path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match self
                .provenance
                .record_extraction(&archive_id, &internal_path, &target, &hash, now)
            {
                Ok(()) => {}
                Err(e @ Error::DuplicateProvenance { .. }) => {
                    warn!("{}", e);
                    report.collisions.push(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        report.file_count = self.provenance.finish_archive(&archive_id)?;
        info!(
            "Archive {}: {} extracted, {} already present, {} rejected, {} collisions",
            archive_id,
            report.extracted.len(),
            report.already_present.len(),
            report.rejected.len(),
            report.collisions.len()
        );
        Ok(report)
    }

    fn write_entry(&self, entry: &mut impl Read, target: &Path) -> io::Result<Written> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(target) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return self.compare_existing(entry, target);
            }
            Err(e) => return Err(e),
        };
        let written = io::copy(entry, &mut file).and_then(|_| file.sync_all());
        drop(file);
        if let Err(e) = written {
            let _ = fs::remove_file(target);
            return Err(e);
        }
        debug!("Extracted {}", target.display());
        digest::hash_file(target, self.streaming_threshold).map(Written::New)
    }

    fn compare_existing(&self, entry: &mut impl Read, target: &Path) -> io::Result<Written> {
        let mut hasher = blake3::Hasher::new();
        io::copy(entry, &mut hasher)?;
        let incoming = ContentHash::from(hasher.finalize());
        let existing = digest::hash_file(target, self.streaming_threshold)?;
        if existing == incoming {
            Ok(Written::Existing(existing))
        } else {
            Ok(Written::Conflict(format!(
                "{} already exists with different content",
                target.display()
            )))
        }
    }
}

enum Written {
    New(ContentHash),
    Existing(ContentHash),
    Conflict(String),
}

fn open_archive(path: &Path, compression: Compression) -> Result<Archive<Box<dyn Read>>, Error> {
    let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
    let reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(file)),
        Compression::None => Box::new(file),
    };
    Ok(Archive::new(reader))
}

/// Normalize an entry path, refusing absolute paths and `..` components.
fn safe_relative(internal: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(internal).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}
