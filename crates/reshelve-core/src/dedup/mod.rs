mod canonical;

use crate::config::MixedOriginPolicy;
use crate::hasher::digest::path_digest;
use crate::hasher::ContentHash;
use crate::plan::step::{StepKind, StepSpec};
use crate::provenance::Provenance;
use crate::scanner::FileRecord;
use ahash::AHashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// One observed file in a content group.
#[derive(Debug, Clone)]
pub struct Member {
    pub record: FileRecord,
    pub provenance: Provenance,
}

/// Files sharing one content hash. `members` is kept in canonical order; the
/// canonical is `members[canonical]`.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub hash: ContentHash,
    pub members: Vec<Member>,
    canonical: usize,
}

impl DedupEntry {
    pub fn canonical(&self) -> &Member {
        &self.members[self.canonical]
    }

    pub fn duplicates(&self) -> impl Iterator<Item = &Member> {
        let canonical = self.canonical;
        self.members
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != canonical)
            .map(|(_, m)| m)
    }

    pub fn is_duplicated(&self) -> bool {
        self.members.len() > 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub groups: usize,
    pub duplicate_files: usize,
    pub reclaimable_bytes: u64,
}

/// Content hash -> canonical member plus duplicates. Rebuilt every run from
/// the scan; previous canonical choices are honored while still valid.
pub struct DedupIndex {
    policy: MixedOriginPolicy,
    entries: AHashMap<ContentHash, DedupEntry>,
    sticky: AHashMap<ContentHash, PathBuf>,
}

impl DedupIndex {
    pub fn new(policy: MixedOriginPolicy) -> Self {
        Self {
            policy,
            entries: AHashMap::new(),
            sticky: AHashMap::new(),
        }
    }

    /// Seed canonical choices from an earlier run.
    pub fn with_sticky_choices(mut self, choices: impl IntoIterator<Item = (ContentHash, PathBuf)>) -> Self {
        self.sticky = choices.into_iter().collect();
        self
    }

    pub fn observe(&mut self, record: FileRecord, provenance: Provenance) {
        let hash = record.hash.clone();
        let member = Member { record, provenance };
        let policy = self.policy;

        let entry = self.entries.entry(hash.clone()).or_insert_with(|| DedupEntry {
            hash: hash.clone(),
            members: Vec::new(),
            canonical: 0,
        });
        if entry
            .members
            .iter()
            .any(|m| m.record.path == member.record.path)
        {
            trace!("Already observed {}", member.record.path.display());
            return;
        }

        let at = entry
            .members
            .partition_point(|m| canonical::compare(m, &member, policy).is_lt());
        entry.members.insert(at, member);

        entry.canonical = self
            .sticky
            .get(&hash)
            .and_then(|sticky| entry.members.iter().position(|m| &m.record.path == sticky))
            .unwrap_or(0);
    }

    pub fn canonical_path(&self, hash: &ContentHash) -> Option<&Path> {
        self.entries
            .get(hash)
            .map(|e| e.canonical().record.path.as_path())
    }

    /// True when `path` was observed and is not the canonical of its group.
    pub fn is_duplicate(&self, record: &FileRecord) -> bool {
        self.canonical_path(&record.hash)
            .map(|canonical| canonical != record.path)
            .unwrap_or(false)
    }

    /// Entries with more than one member, in hash order.
    pub fn duplicate_groups(&self) -> Vec<&DedupEntry> {
        let mut groups: Vec<&DedupEntry> =
            self.entries.values().filter(|e| e.is_duplicated()).collect();
        groups.sort_by(|a, b| a.hash.cmp(&b.hash));
        groups
    }

    pub fn stats(&self) -> DedupStats {
        let groups = self.duplicate_groups();
        DedupStats {
            groups: groups.len(),
            duplicate_files: groups.iter().map(|g| g.members.len() - 1).sum(),
            reclaimable_bytes: groups
                .iter()
                .map(|g| g.canonical().record.size * (g.members.len() as u64 - 1))
                .sum(),
        }
    }

    /// Move every non-canonical member into the flat, hash-keyed `duplicates_dir`.
    /// Never deletes anything.
    pub fn plan_relocations(&self, duplicates_dir: &Path) -> Vec<StepSpec> {
        self.plan_duplicate_steps(StepKind::RelocateDuplicate, duplicates_dir)
    }

    /// The gated alternative to `plan_relocations`: send duplicates to the
    /// engine's graveyard. The planner only ever places these in chunks that
    /// need an approval token.
    pub fn plan_deletions(&self, graveyard: &Path) -> Vec<StepSpec> {
        self.plan_duplicate_steps(StepKind::Delete, graveyard)
    }

    fn plan_duplicate_steps(&self, kind: StepKind, area: &Path) -> Vec<StepSpec> {
        let mut steps = Vec::new();
        for group in self.duplicate_groups() {
            let canonical = group.canonical();
            for member in group.duplicates() {
                let mut step = StepSpec::new(
                    kind,
                    member.record.path.clone(),
                    area.join(duplicate_file_name(&member.record)),
                    member.record.hash.clone(),
                    member.record.size,
                );
                step.archive_id = member.provenance.archive_id().cloned();
                step.canonical = Some(canonical.record.path.clone());
                steps.push(step);
            }
        }
        debug!("Planned {} {} steps", steps.len(), kind);
        steps
    }

    /// Canonical path per hash, for persisting across runs.
    pub fn canonical_choices(&self) -> Vec<(ContentHash, PathBuf)> {
        let mut choices: Vec<(ContentHash, PathBuf)> = self
            .entries
            .values()
            .filter(|e| e.is_duplicated())
            .map(|e| (e.hash.clone(), e.canonical().record.path.clone()))
            .collect();
        choices.sort();
        choices
    }
}

/// `<hash16>-<pathdigest8>-<file name>`: stable for a given source path, and
/// two sources with the same name never collide.
pub fn duplicate_file_name(record: &FileRecord) -> String {
    let name = record
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}-{}-{}", record.hash.short(), path_digest(&record.path), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn record(path: &str, hash: &str, mtime_offset: i64) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            hash: ContentHash::from_hex(hash.repeat(32)),
            size: 10,
            modified: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::seconds(mtime_offset),
            signature: 0,
        }
    }

    #[test]
    fn test_one_canonical_regardless_of_observation_order() {
        let files = vec![
            record("/r/A_copy.txt", "a", 0),
            record("/r/A.txt", "a", 100),
            record("/r/B.txt", "b", 0),
        ];
        let mut forward = DedupIndex::new(MixedOriginPolicy::default());
        let mut backward = DedupIndex::new(MixedOriginPolicy::default());
        for f in &files {
            forward.observe(f.clone(), Provenance::Untracked);
        }
        for f in files.iter().rev() {
            backward.observe(f.clone(), Provenance::Untracked);
        }
        let hash = files[0].hash.clone();
        assert_eq!(forward.canonical_path(&hash), Some(Path::new("/r/A.txt")));
        assert_eq!(forward.canonical_choices(), backward.canonical_choices());
        assert_eq!(forward.stats().duplicate_files, 1);
        assert!(forward.is_duplicate(&files[0]));
        assert!(!forward.is_duplicate(&files[2]));
    }

    #[test]
    fn test_sticky_choice_survives_newer_copy() {
        let old = record("/r/Documents/A.txt", "a", 0);
        let newer = record("/r/A (2).txt", "a", 500);
        let mut index = DedupIndex::new(MixedOriginPolicy::default())
            .with_sticky_choices(vec![(old.hash.clone(), old.path.clone())]);
        index.observe(newer.clone(), Provenance::Untracked);
        index.observe(old.clone(), Provenance::Untracked);
        assert_eq!(index.canonical_path(&old.hash), Some(old.path.as_path()));
    }

    #[test]
    fn test_relocations_are_flat_and_hash_keyed() {
        let mut index = DedupIndex::new(MixedOriginPolicy::default());
        index.observe(record("/r/A.txt", "a", 100), Provenance::Untracked);
        index.observe(record("/r/sub/A.txt", "a", 0), Provenance::Untracked);
        index.observe(record("/r/other/A.txt", "a", 0), Provenance::Untracked);

        let steps = index.plan_relocations(Path::new("/r/_duplicates"));
        assert_eq!(steps.len(), 2);
        for step in &steps {
            assert_eq!(step.kind, StepKind::RelocateDuplicate);
            assert_eq!(step.destination.parent(), Some(Path::new("/r/_duplicates")));
            assert!(step
                .destination
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(&"a".repeat(16)));
            assert_eq!(step.canonical.as_deref(), Some(Path::new("/r/A.txt")));
        }
        assert_ne!(steps[0].destination, steps[1].destination);

        let deletes = index.plan_deletions(Path::new("/r/.reshelve/graveyard"));
        assert!(deletes.iter().all(|s| s.kind == StepKind::Delete));
    }
}
