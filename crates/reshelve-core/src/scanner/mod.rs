pub mod walk;

use crate::hasher::cache::{self, HashRequest};
use crate::hasher::ContentHash;
use crate::storage::Database;
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::warn;
use walk::{CandidateWalk, WalkItem, WalkOptions};

/// A hashed file as seen during one scan pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub hash: ContentHash,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub signature: u64,
}

/// A file that could not be read. Never planned, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    Record(FileRecord),
    Quarantined(QuarantinedFile),
    GuardedRoot { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct FingerprintOptions {
    pub walk: WalkOptions,
    pub streaming_threshold: u64,
    pub batch_size: usize,
    pub workers: usize,
}

impl Default for FingerprintOptions {
    fn default() -> Self {
        Self {
            walk: WalkOptions::default(),
            streaming_threshold: crate::config::DEFAULT_STREAMING_THRESHOLD,
            batch_size: 256,
            workers: 0,
        }
    }
}

/// Produces FileRecords for a tree. Hashing runs on a bounded rayon pool; the
/// optional database supplies the hash cache.
pub struct Fingerprinter<'a> {
    db: Option<&'a Database>,
    options: FingerprintOptions,
    pool: rayon::ThreadPool,
}

impl<'a> Fingerprinter<'a> {
    pub fn new(db: Option<&'a Database>, options: FingerprintOptions) -> Result<Self, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers)
            .thread_name(|i| format!("reshelve-hash-{}", i))
            .build()
            .map_err(|e| Error::Other(format!("Failed to build hash pool: {}", e)))?;
        Ok(Self { db, options, pool })
    }

    /// Lazily scan `root`. Events come out in traversal order.
    pub fn scan(&self, root: &Path) -> ScanStream<'_, 'a> {
        ScanStream {
            fingerprinter: self,
            walk: CandidateWalk::new(root, self.options.walk.clone()),
            pending: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    /// Restart a scan after `cursor` (the last path fully processed).
    pub fn resume(&self, root: &Path, cursor: PathBuf) -> ScanStream<'_, 'a> {
        let mut walk_options = self.options.walk.clone();
        walk_options.resume_after = Some(cursor.clone());
        ScanStream {
            fingerprinter: self,
            walk: CandidateWalk::new(root, walk_options),
            pending: VecDeque::new(),
            cursor: Some(cursor),
            exhausted: false,
        }
    }
}

pub struct ScanStream<'f, 'a> {
    fingerprinter: &'f Fingerprinter<'a>,
    walk: CandidateWalk,
    pending: VecDeque<ScanEvent>,
    cursor: Option<PathBuf>,
    exhausted: bool,
}

impl ScanStream<'_, '_> {
    /// Last path handed out; pass it to `Fingerprinter::resume` to continue.
    pub fn cursor(&self) -> Option<&Path> {
        self.cursor.as_deref()
    }

    fn fill(&mut self) {
        let batch_size = self.fingerprinter.options.batch_size.max(1);
        let mut requests: Vec<HashRequest> = Vec::with_capacity(batch_size);
        let mut modified: Vec<DateTime<Utc>> = Vec::with_capacity(batch_size);

        while requests.len() < batch_size {
            match self.walk.next() {
                Some(WalkItem::File(candidate)) => {
                    let mtime = DateTime::<Utc>::from(candidate.modified);
                    requests.push(HashRequest {
                        path: candidate.path,
                        size: candidate.size,
                        mtime_nanos: mtime.timestamp_nanos_opt().unwrap_or_default(),
                    });
                    modified.push(mtime);
                }
                Some(WalkItem::Unreadable(path, reason)) => {
                    self.pending
                        .push_back(ScanEvent::Quarantined(QuarantinedFile { path, reason }));
                }
                Some(WalkItem::Guarded(path, reason)) => {
                    self.pending.push_back(ScanEvent::GuardedRoot { path, reason });
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }

        if requests.is_empty() {
            return;
        }

        let results = cache::resolve_batch(
            self.fingerprinter.db,
            &self.fingerprinter.pool,
            &requests,
            self.fingerprinter.options.streaming_threshold,
        );

        for ((request, mtime), result) in requests.into_iter().zip(modified).zip(results) {
            match result {
                Ok(hashed) => self.pending.push_back(ScanEvent::Record(FileRecord {
                    path: request.path,
                    hash: hashed.hash,
                    size: request.size,
                    modified: mtime,
                    signature: hashed.signature,
                })),
                Err(e) => {
                    warn!("Quarantining {}: {}", request.path.display(), e);
                    self.pending.push_back(ScanEvent::Quarantined(QuarantinedFile {
                        path: request.path,
                        reason: e.to_string(),
                    }));
                }
            }
        }
    }
}

impl Iterator for ScanStream<'_, '_> {
    type Item = ScanEvent;

    fn next(&mut self) -> Option<ScanEvent> {
        while self.pending.is_empty() && !self.exhausted {
            self.fill();
        }
        let event = self.pending.pop_front()?;
        match &event {
            ScanEvent::Record(r) => self.cursor = Some(r.path.clone()),
            ScanEvent::Quarantined(q) => self.cursor = Some(q.path.clone()),
            ScanEvent::GuardedRoot { .. } => {}
        }
        Some(event)
    }
}

/// Everything one full pass produced, in traversal order.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub records: Vec<FileRecord>,
    pub quarantined: Vec<QuarantinedFile>,
    pub guarded_roots: Vec<(PathBuf, String)>,
}

impl ScanSummary {
    pub fn collect(stream: impl Iterator<Item = ScanEvent>) -> Self {
        let mut summary = ScanSummary::default();
        for event in stream {
            summary.push(event);
        }
        summary
    }

    pub fn push(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::Record(r) => self.records.push(r),
            ScanEvent::Quarantined(q) => self.quarantined.push(q),
            ScanEvent::GuardedRoot { path, reason } => self.guarded_roots.push((path, reason)),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_scan_yields_records_in_order_across_batches() {
        let dir = tempdir().unwrap();
        for i in 0..7 {
            fs::write(dir.path().join(format!("f{}.txt", i)), format!("content {}", i)).unwrap();
        }
        let options = FingerprintOptions {
            batch_size: 3,
            workers: 2,
            ..FingerprintOptions::default()
        };
        let fp = Fingerprinter::new(None, options).unwrap();
        let summary = ScanSummary::collect(fp.scan(dir.path()));
        assert_eq!(summary.records.len(), 7);
        let names: Vec<String> = summary
            .records
            .iter()
            .map(|r| r.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_identical_content_gets_identical_hash() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "same").unwrap();
        fs::write(dir.path().join("b.txt"), "same").unwrap();
        fs::write(dir.path().join("c.txt"), "different").unwrap();
        let fp = Fingerprinter::new(None, FingerprintOptions::default()).unwrap();
        let records = ScanSummary::collect(fp.scan(dir.path())).records;
        assert_eq!(records[0].hash, records[1].hash);
        assert_ne!(records[0].hash, records[2].hash);
    }

    #[test]
    fn test_resume_continues_after_cursor() {
        let dir = tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            fs::write(dir.path().join(name), name).unwrap();
        }
        let options = FingerprintOptions {
            batch_size: 1,
            ..FingerprintOptions::default()
        };
        let fp = Fingerprinter::new(None, options).unwrap();
        let mut stream = fp.scan(dir.path());
        stream.next().unwrap();
        stream.next().unwrap();
        let cursor = stream.cursor().unwrap().to_path_buf();
        assert_eq!(cursor, dir.path().join("b.txt"));

        let rest = ScanSummary::collect(fp.resume(dir.path(), cursor)).records;
        let names: Vec<PathBuf> = rest.into_iter().map(|r| r.path).collect();
        assert_eq!(names, vec![dir.path().join("c.txt"), dir.path().join("d.txt")]);
    }

    #[test]
    fn test_file_removed_after_listing_is_quarantined() {
        let dir = tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(dir.path().join(name), name).unwrap();
        }
        let options = FingerprintOptions {
            batch_size: 1,
            ..FingerprintOptions::default()
        };
        let fp = Fingerprinter::new(None, options).unwrap();
        let mut stream = fp.scan(dir.path());
        assert!(matches!(stream.next(), Some(ScanEvent::Record(_))));

        // The sorted walk has already listed b.txt
        fs::remove_file(dir.path().join("b.txt")).unwrap();
        let rest = ScanSummary::collect(stream);

        assert_eq!(rest.quarantined.len(), 1);
        assert_eq!(rest.quarantined[0].path, dir.path().join("b.txt"));
        assert_eq!(rest.records.len(), 1);
        assert_eq!(rest.records[0].path, dir.path().join("c.txt"));
    }
}

