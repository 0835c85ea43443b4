pub mod chunk;
pub mod step;

use crate::classify::{safe_component, Classifier, Proposal};
use crate::config::AppConfig;
use crate::dedup::{DedupIndex, Member};
use crate::executor::guard::GuardSet;
use crate::hasher::{digest, ContentHash};
use crate::provenance::{ArchiveId, ArchiveInfo, ProvenanceRecord};
use ahash::{AHashMap, AHashSet};
use chunk::{Chunk, PartitionKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use step::{StepKind, StepSpec};
use tracing::{debug, info, warn};

/// What happens to non-canonical duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateMode {
    /// Move them into the flat duplicates area.
    #[default]
    Relocate,
    /// Send them to the graveyard. Always approval-gated.
    Delete,
}

/// A file that produced no step, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Refusal {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub chunks: Vec<Chunk>,
    /// Steps dropped because they touched guarded or protected paths.
    pub refusals: Vec<Refusal>,
    /// Proposals that could not be turned into a safe step.
    pub rejected: Vec<Refusal>,
    pub settled: usize,
    pub unclassified: usize,
    pub nested_skipped: usize,
    /// Canonical path per duplicated hash once this plan is committed.
    #[serde(skip)]
    pub canonical_choices: Vec<(ContentHash, PathBuf)>,
}

impl Plan {
    pub fn step_count(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, id: &str) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.id == id)
    }

    pub fn gated_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(|c| c.requires_approval)
    }
}

/// Turns proposals and dedup state into ordered, provenance-coherent chunks.
/// Single-threaded over a fully populated index.
pub struct ChunkPlanner<'a> {
    root: &'a Path,
    config: &'a AppConfig,
    guards: &'a GuardSet,
    archives: AHashMap<ArchiveId, ArchiveInfo>,
    duplicate_mode: DuplicateMode,
}

struct Draft {
    steps: Vec<StepSpec>,
    refusals: Vec<Refusal>,
    rejected: Vec<Refusal>,
    claimed: AHashSet<PathBuf>,
    /// Where each moved file will live once its (ungated) step commits.
    final_location: AHashMap<PathBuf, PathBuf>,
    /// Hash -> existing file that a classification move collapsed onto.
    collapse_targets: AHashMap<ContentHash, PathBuf>,
    handled: AHashSet<PathBuf>,
}

impl<'a> ChunkPlanner<'a> {
    pub fn new(root: &'a Path, config: &'a AppConfig, guards: &'a GuardSet) -> Self {
        Self {
            root,
            config,
            guards,
            archives: AHashMap::new(),
            duplicate_mode: DuplicateMode::default(),
        }
    }

    pub fn with_archives(mut self, archives: impl IntoIterator<Item = ArchiveInfo>) -> Self {
        self.archives = archives
            .into_iter()
            .map(|a| (a.archive_id.clone(), a))
            .collect();
        self
    }

    pub fn with_duplicate_mode(mut self, mode: DuplicateMode) -> Self {
        self.duplicate_mode = mode;
        self
    }

    pub fn plan(&self, members: &[Member], index: &DedupIndex, classifier: &dyn Classifier) -> Plan {
        let mut sorted: Vec<&Member> = members.iter().collect();
        sorted.sort_by(|a, b| a.record.path.cmp(&b.record.path));
        let known: AHashMap<&Path, &ContentHash> = sorted
            .iter()
            .map(|m| (m.record.path.as_path(), &m.record.hash))
            .collect();

        let mut plan = Plan::default();
        let mut draft = Draft {
            steps: Vec::new(),
            refusals: Vec::new(),
            rejected: Vec::new(),
            claimed: AHashSet::new(),
            final_location: AHashMap::new(),
            collapse_targets: AHashMap::new(),
            handled: AHashSet::new(),
        };

        for member in &sorted {
            if index.is_duplicate(&member.record) {
                continue;
            }
            let Some(proposal) = classifier.propose(&member.record) else {
                plan.unclassified += 1;
                continue;
            };
            match self.classification_step(member, proposal, &known, &mut draft) {
                Placement::Step(step) => self.admit(step, &mut draft),
                Placement::Settled => plan.settled += 1,
                Placement::Nested => plan.nested_skipped += 1,
                Placement::Rejected(reason) => draft.rejected.push(Refusal {
                    path: member.record.path.clone(),
                    reason,
                }),
            }
        }

        self.duplicate_steps(index, &mut draft);

        plan.canonical_choices = index
            .canonical_choices()
            .into_iter()
            .map(|(hash, path)| {
                let path = draft
                    .collapse_targets
                    .get(&hash)
                    .cloned()
                    .or_else(|| draft.final_location.get(&path).cloned())
                    .unwrap_or(path);
                (hash, path)
            })
            .collect();
        plan.refusals = draft.refusals;
        plan.rejected = draft.rejected;
        plan.chunks = self.chunk(draft.steps);

        info!(
            "Planned {} steps in {} chunks ({} gated); {} settled, {} refused, {} rejected",
            plan.step_count(),
            plan.chunks.len(),
            plan.gated_chunks().count(),
            plan.settled,
            plan.refusals.len(),
            plan.rejected.len()
        );
        plan
    }

    fn classification_step(
        &self,
        member: &Member,
        proposal: Proposal,
        known: &AHashMap<&Path, &ContentHash>,
        draft: &mut Draft,
    ) -> Placement {
        let record = &member.record;
        let Some(category) = safe_component(&proposal.category) else {
            return Placement::Rejected(format!("unsafe category '{}'", proposal.category));
        };
        let folder = self.config.folder_for(category);
        let Some(folder) = safe_component(&folder).map(str::to_string) else {
            return Placement::Rejected(format!("unsafe folder '{}'", folder));
        };
        let rename_to = match proposal.rename_to.as_deref() {
            Some(name) => match safe_component(name) {
                Some(name) => Some(name.to_string()),
                None => return Placement::Rejected(format!("unsafe file name '{}'", name)),
            },
            None => None,
        };

        let Ok(relative) = record.path.strip_prefix(self.root) else {
            return Placement::Rejected("outside the organize root".to_string());
        };
        let mut components = relative.components();
        let top = components.next();
        let nested = components.next().is_some();
        let in_folder = matches!(top, Some(Component::Normal(name)) if name == folder.as_str());
        let file_name = record
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let archive = member.provenance.record();
        let (kind, destination) = if in_folder {
            match rename_to.filter(|name| *name != file_name) {
                Some(name) => (StepKind::Rename, record.path.with_file_name(name)),
                None => return Placement::Settled,
            }
        } else if let Some(origin) = archive {
            let name = rename_to.unwrap_or(file_name);
            (StepKind::Move, self.archive_destination(&folder, origin, &name))
        } else if nested && !self.config.organize_nested {
            return Placement::Nested;
        } else {
            let name = rename_to.unwrap_or(file_name);
            (StepKind::Move, self.root.join(&folder).join(name))
        };

        if destination == record.path {
            return Placement::Settled;
        }

        let mut step = StepSpec::new(kind, record.path.clone(), destination, record.hash.clone(), record.size);
        step.category = Some(category.to_string());
        step.confidence = proposal.confidence;
        step.origin = proposal.origin;
        step.archive_id = member.provenance.archive_id().cloned();

        match self.resolve_collision(&step.destination, &record.hash, known, draft) {
            Destination::Free => Placement::Step(step),
            Destination::Infixed(path) => {
                step.destination = path;
                Placement::Step(step)
            }
            Destination::SameContent(occupant) => {
                debug!(
                    "{} already present at {}, relocating as duplicate",
                    record.path.display(),
                    occupant.display()
                );
                draft.collapse_targets.insert(record.hash.clone(), occupant.clone());
                let mut collapse = self.duplicate_step(member, &occupant);
                collapse.category = step.category;
                collapse.confidence = step.confidence;
                collapse.origin = step.origin;
                Placement::Step(collapse)
            }
            Destination::Unresolvable(reason) => Placement::Rejected(reason),
        }
    }

    /// `<root>/<folder>/<archive stem>/<path inside archive>`; unsafe inner
    /// components fall back to the bare file name.
    fn archive_destination(&self, folder: &str, origin: &ProvenanceRecord, name: &str) -> PathBuf {
        let stem = self
            .archives
            .get(&origin.archive_id)
            .map(ArchiveInfo::stem)
            .filter(|s| safe_component(s).is_some())
            .unwrap_or_else(|| origin.archive_id.to_string());
        let mut destination = self.root.join(folder).join(stem);

        let inner: Vec<&str> = origin.internal_path.split('/').filter(|c| !c.is_empty()).collect();
        let safe = !inner.is_empty() && inner.iter().all(|c| safe_component(c).is_some());
        if safe {
            for dir in &inner[..inner.len() - 1] {
                destination.push(dir);
            }
        }
        destination.push(name);
        destination
    }

    fn resolve_collision(
        &self,
        destination: &Path,
        hash: &ContentHash,
        known: &AHashMap<&Path, &ContentHash>,
        draft: &Draft,
    ) -> Destination {
        match self.occupant(destination, hash, known, draft) {
            Occupant::None => return Destination::Free,
            Occupant::Same => return Destination::SameContent(destination.to_path_buf()),
            Occupant::Different => {}
        }
        let infixed = with_hash_infix(destination, hash);
        match self.occupant(&infixed, hash, known, draft) {
            Occupant::None => Destination::Infixed(infixed),
            Occupant::Same => Destination::SameContent(infixed),
            Occupant::Different => Destination::Unresolvable(format!(
                "{} and {} are both taken",
                destination.display(),
                infixed.display()
            )),
        }
    }

    fn occupant(
        &self,
        path: &Path,
        hash: &ContentHash,
        known: &AHashMap<&Path, &ContentHash>,
        draft: &Draft,
    ) -> Occupant {
        if draft.claimed.contains(path) {
            return Occupant::Different;
        }
        if path.symlink_metadata().is_err() {
            return Occupant::None;
        }
        let existing = match known.get(path) {
            Some(existing) => Some((*existing).clone()),
            None if path.is_file() => digest::hash_file(path, self.config.streaming_threshold).ok(),
            None => None,
        };
        match existing {
            // An occupant that is itself planned to move is not a stable target
            Some(existing) if &existing == hash && !draft.handled.contains(path) => Occupant::Same,
            _ => Occupant::Different,
        }
    }

    fn duplicate_step(&self, member: &Member, canonical: &Path) -> StepSpec {
        let area = match self.duplicate_mode {
            DuplicateMode::Relocate => self.config.duplicates_dir_for(self.root),
            DuplicateMode::Delete => graveyard_dir(&self.config.state_dir_for(self.root)),
        };
        let kind = match self.duplicate_mode {
            DuplicateMode::Relocate => StepKind::RelocateDuplicate,
            DuplicateMode::Delete => StepKind::Delete,
        };
        let mut step = StepSpec::new(
            kind,
            member.record.path.clone(),
            area.join(crate::dedup::duplicate_file_name(&member.record)),
            member.record.hash.clone(),
            member.record.size,
        );
        step.archive_id = member.provenance.archive_id().cloned();
        step.canonical = Some(canonical.to_path_buf());
        step
    }

    fn duplicate_steps(&self, index: &DedupIndex, draft: &mut Draft) {
        let steps = match self.duplicate_mode {
            DuplicateMode::Relocate => index.plan_relocations(&self.config.duplicates_dir_for(self.root)),
            DuplicateMode::Delete => {
                index.plan_deletions(&graveyard_dir(&self.config.state_dir_for(self.root)))
            }
        };
        for mut step in steps {
            if draft.handled.contains(&step.source) {
                continue;
            }
            let canonical = match draft.collapse_targets.get(&step.hash) {
                Some(target) if *target == step.source => continue,
                Some(target) => target.clone(),
                None => step
                    .canonical
                    .as_ref()
                    .map(|c| draft.final_location.get(c).cloned().unwrap_or_else(|| c.clone()))
                    .unwrap_or_default(),
            };
            step.canonical = Some(canonical);
            if step.destination.symlink_metadata().is_ok() || draft.claimed.contains(&step.destination) {
                draft.rejected.push(Refusal {
                    path: step.source.clone(),
                    reason: format!("{} is already occupied", step.destination.display()),
                });
                continue;
            }
            self.admit(step, draft);
        }
    }

    /// Guard-check both ends and record the step.
    fn admit(&self, step: StepSpec, draft: &mut Draft) {
        for path in [&step.source, &step.destination] {
            if let Err(e) = self.guards.check(path) {
                warn!("Refusing {} step for {}: {}", step.kind, step.source.display(), e);
                draft.refusals.push(Refusal {
                    path: step.source.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        }
        draft.handled.insert(step.source.clone());
        draft.claimed.insert(step.destination.clone());
        if matches!(step.kind, StepKind::Move | StepKind::Rename) && !self.is_gated(&step) {
            draft
                .final_location
                .insert(step.source.clone(), step.destination.clone());
        }
        draft.steps.push(step);
    }

    fn is_gated(&self, step: &StepSpec) -> bool {
        step.kind.always_gated() || step.confidence < self.config.confidence_floor
    }

    fn partition_for(&self, step: &StepSpec) -> PartitionKey {
        if let Some(archive) = &step.archive_id {
            return PartitionKey::Archive(archive.clone());
        }
        match (step.kind, &step.category) {
            (StepKind::RelocateDuplicate | StepKind::Delete, _) => PartitionKey::Duplicates,
            (_, Some(category)) => PartitionKey::Category(self.config.folder_for(category)),
            (_, None) => PartitionKey::Category(String::new()),
        }
    }

    /// Ungated partitions first (archives, categories, duplicates), then the
    /// gated ones in the same order, each cut to `max_chunk_size`.
    fn chunk(&self, steps: Vec<StepSpec>) -> Vec<Chunk> {
        let mut partitions: BTreeMap<(bool, PartitionKey), Vec<StepSpec>> = BTreeMap::new();
        for step in steps {
            let key = (self.is_gated(&step), self.partition_for(&step));
            partitions.entry(key).or_default().push(step);
        }

        let mut chunks = Vec::new();
        for ((gated, partition), mut steps) in partitions {
            steps.sort_by(|a, b| a.source.cmp(&b.source));
            for (n, slice) in steps.chunks(self.config.max_chunk_size.max(1)).enumerate() {
                let id = format!(
                    "{}-{:03}{}",
                    partition.label(),
                    n + 1,
                    if gated { "-confirm" } else { "" }
                );
                let steps = slice
                    .iter()
                    .cloned()
                    .map(|mut s| {
                        s.chunk_id = id.clone();
                        s
                    })
                    .collect();
                chunks.push(Chunk {
                    id,
                    partition: partition.clone(),
                    requires_approval: gated,
                    steps,
                });
            }
        }
        chunks
    }
}

enum Placement {
    Step(StepSpec),
    Settled,
    Nested,
    Rejected(String),
}

enum Destination {
    Free,
    Infixed(PathBuf),
    SameContent(PathBuf),
    Unresolvable(String),
}

enum Occupant {
    None,
    Same,
    Different,
}

pub fn graveyard_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("graveyard")
}

/// `report.pdf` -> `report.<hash8>.pdf`.
pub fn with_hash_infix(path: &Path, hash: &ContentHash) -> PathBuf {
    let infix = &hash.as_str()[..hash.as_str().len().min(8)];
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem, infix, ext.to_string_lossy()),
        None => format!("{}.{}", stem, infix),
    };
    path.with_file_name(name)
}
