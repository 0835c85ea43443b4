use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

use reshelve_core::config::AppConfig;
use reshelve_core::executor::guard::GuardSet;
use reshelve_core::executor::Executor;
use reshelve_core::hasher::{digest, ContentHash};
use reshelve_core::journal::{self, Journal};
use reshelve_core::plan::chunk::{ApprovalToken, Chunk, PartitionKey};
use reshelve_core::plan::step::{StepKind, StepSpec};
use reshelve_core::provenance::ProvenanceStore;
use reshelve_core::storage::Database;
use reshelve_core::{OrganizeEngine, ProgressReporter, SilentReporter, UndoSelection};

fn fixed_time() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn write_file(path: &Path, content: &str, mtime: SystemTime) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
}

fn hash_of(path: &Path) -> ContentHash {
    digest::hash_file(path, u64::MAX).unwrap()
}

fn canonical_root(dir: &Path) -> PathBuf {
    let root = dir.join("root");
    fs::create_dir_all(&root).unwrap();
    fs::canonicalize(root).unwrap()
}

fn engine_for(root: &Path) -> OrganizeEngine {
    OrganizeEngine::new(AppConfig::for_root(root), root).unwrap()
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(files_under(&path));
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

/// Layout:
///   root/Documents/A.txt       ("alpha")
///   root/Documents/A_copy.txt  ("alpha")  <- duplicate of A.txt
///   root/Documents/B.txt       ("beta")
#[test]
fn test_duplicate_relocated_once_and_undo_restores_it() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    let docs = root.join("Documents");
    write_file(&docs.join("A.txt"), "alpha", fixed_time());
    write_file(&docs.join("A_copy.txt"), "alpha", fixed_time());
    write_file(&docs.join("B.txt"), "beta", fixed_time());
    let h1 = hash_of(&docs.join("A.txt"));

    let report = engine_for(&root).run(&SilentReporter).unwrap();

    assert_eq!(report.files_scanned, 3);
    assert_eq!(report.committed(), 1);
    assert_eq!(report.duplicates.groups, 1);
    assert_eq!(report.duplicates.relocated, 1);
    assert_eq!(report.journal_range, Some((1, 1)));
    assert_eq!(report.moves_by_destination.get("_duplicates"), Some(&1));
    assert_eq!(report.status(), "completed");

    assert!(docs.join("A.txt").exists(), "canonical must stay in place");
    assert!(docs.join("B.txt").exists());
    assert!(!docs.join("A_copy.txt").exists());
    let relocated = files_under(&root.join("_duplicates"));
    assert_eq!(relocated.len(), 1);
    assert_eq!(hash_of(&relocated[0]), h1);

    let journal = Journal::read(journal::journal_path(&root.join(".reshelve"))).unwrap();
    let entries: Vec<_> = journal.entries().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].step.kind, StepKind::RelocateDuplicate);
    assert_eq!(entries[0].step.canonical.as_deref(), Some(docs.join("A.txt").as_path()));

    let undo = engine_for(&root).undo(UndoSelection::LastRun).unwrap();
    assert_eq!(undo.reverted, vec![1]);
    assert_eq!(hash_of(&docs.join("A_copy.txt")), h1);
    assert!(!root.join("_duplicates").exists(), "created folder is removed on undo");

    // Undoing again is a no-op
    let again = engine_for(&root).undo(UndoSelection::LastRun).unwrap();
    assert!(again.reverted.is_empty());
    assert_eq!(again.already_undone, vec![1]);
}

#[test]
fn test_rerun_on_organized_tree_plans_nothing() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    write_file(&root.join("report.pdf"), "pdf body", fixed_time());
    write_file(&root.join("notes.txt"), "some notes", fixed_time());
    write_file(&root.join("photo.jpg"), "jpeg bytes", fixed_time());
    write_file(&root.join("photo_copy.jpg"), "jpeg bytes", fixed_time());
    write_file(&root.join("mystery.xyz"), "unknown", fixed_time());
    write_file(&root.join("sub/deep.txt"), "nested", fixed_time());

    let first = engine_for(&root).run(&SilentReporter).unwrap();
    assert_eq!(first.committed(), 4);
    assert_eq!(first.unclassified, 1);
    assert_eq!(first.nested_skipped, 1);
    assert!(root.join("Documents/report.pdf").exists());
    assert!(root.join("Documents/notes.txt").exists());
    assert!(root.join("Images/photo.jpg").exists());
    assert!(!root.join("photo_copy.jpg").exists());
    assert!(root.join("sub/deep.txt").exists());
    assert!(root.join("mystery.xyz").exists());

    let plan = engine_for(&root).plan(&SilentReporter).unwrap().plan;
    assert!(plan.is_empty(), "unexpected steps: {:?}", plan.chunks);
    assert_eq!(plan.settled, 3);

    let second = engine_for(&root).run(&SilentReporter).unwrap();
    assert_eq!(second.committed(), 0);
    assert!(second.journal_range.is_none());
}

#[test]
fn test_plan_is_deterministic() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    for i in 0..20 {
        write_file(&root.join(format!("file{:02}.txt", i)), &format!("body {}", i % 7), fixed_time());
    }

    let first = engine_for(&root).plan(&SilentReporter).unwrap().plan;
    let second = engine_for(&root).plan(&SilentReporter).unwrap().plan;

    let digests = |chunks: &[Chunk]| -> Vec<(String, String)> {
        chunks.iter().map(|c| (c.id.clone(), c.digest())).collect()
    };
    assert_eq!(digests(&first.chunks), digests(&second.chunks));
    // 7 distinct bodies: 7 canonicals moved, 13 duplicates relocated
    assert_eq!(first.step_count(), 20);
}

#[test]
fn test_guarded_and_protected_files_are_never_touched() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    write_file(&root.join("important_taxes.pdf"), "taxes", fixed_time());
    write_file(&root.join("project/readme.txt"), "readme", fixed_time());
    fs::create_dir_all(root.join("project/.git")).unwrap();
    write_file(&root.join("plain.pdf"), "plain", fixed_time());

    let decisions = tmp.path().join("decisions.json");
    fs::write(
        &decisions,
        r#"[{"path": "project/readme.txt", "category": "Documents", "confidence": 1.0},
            {"path": "important_taxes.pdf", "category": "Documents", "confidence": 1.0}]"#,
    )
    .unwrap();

    let report = engine_for(&root)
        .with_decisions(&decisions)
        .run(&SilentReporter)
        .unwrap();

    assert!(root.join("important_taxes.pdf").exists());
    assert!(root.join("project/readme.txt").exists());
    assert!(root.join("Documents/plain.pdf").exists());
    assert_eq!(report.committed(), 1);
    assert!(report
        .refusals
        .iter()
        .any(|r| r.path == root.join("important_taxes.pdf")));
    assert!(report
        .guarded_roots
        .iter()
        .any(|g| g.path == root.join("project")));
}

#[test]
fn test_executor_refuses_guarded_step_even_when_approved() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    let source = root.join("project/src/main.rs");
    write_file(&source, "fn main() {}", fixed_time());
    fs::create_dir_all(root.join("project/.git")).unwrap();

    let config = AppConfig::for_root(&root);
    let guards = GuardSet::new(&root, &config);
    let db = Database::open_in_memory().unwrap();
    let mut journal = Journal::open(tmp.path().join("journal.log")).unwrap();

    let mut step = StepSpec::new(
        StepKind::Move,
        source.clone(),
        root.join("Code/main.rs"),
        hash_of(&source),
        12,
    );
    step.confidence = 1.0;
    let chunk = Chunk {
        id: "category-code-001-confirm".to_string(),
        partition: PartitionKey::Category("Code".to_string()),
        requires_approval: true,
        steps: vec![step],
    };
    let token = ApprovalToken::for_chunk(&chunk);

    let mut executor = Executor::new(&mut journal, ProvenanceStore::new(&db), &guards, "run");
    let result = executor.apply(&chunk, Some(&token)).unwrap();

    assert!(result.committed.is_empty());
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].surfaced);
    assert!(source.exists());
    assert!(!root.join("Code").exists());
    assert_eq!(journal.last_seq(), 0);
}

#[test]
fn test_dry_run_changes_nothing() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    write_file(&root.join("a.pdf"), "a", fixed_time());
    write_file(&root.join("b.jpg"), "b", fixed_time());
    let before = files_under(&root);

    let config = AppConfig {
        dry_run: true,
        ..AppConfig::for_root(&root)
    };
    let report = OrganizeEngine::new(config, &root)
        .unwrap()
        .run(&SilentReporter)
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.status(), "dry_run");
    assert_eq!(report.committed(), 0);
    let after: Vec<PathBuf> = files_under(&root)
        .into_iter()
        .filter(|p| !p.starts_with(root.join(".reshelve")))
        .collect();
    assert_eq!(before, after);
    let journal = Journal::read(journal::journal_path(&root.join(".reshelve"))).unwrap();
    assert_eq!(journal.last_seq(), 0);
}

#[test]
fn test_colliding_destination_gets_hash_infix() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    write_file(&root.join("Documents/report.pdf"), "old report", fixed_time());
    write_file(&root.join("report.pdf"), "new report", fixed_time());
    let incoming = hash_of(&root.join("report.pdf"));

    let report = engine_for(&root).run(&SilentReporter).unwrap();

    assert_eq!(report.committed(), 1);
    let infixed = root.join(format!("Documents/report.{}.pdf", &incoming.as_str()[..8]));
    assert_eq!(fs::read_to_string(&infixed).unwrap(), "new report");
    assert_eq!(
        fs::read_to_string(root.join("Documents/report.pdf")).unwrap(),
        "old report"
    );
}

#[test]
fn test_report_is_stored_per_run() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    write_file(&root.join("a.pdf"), "a", fixed_time());

    let report = engine_for(&root).run(&SilentReporter).unwrap();
    let stored = engine_for(&root).report(None).unwrap().unwrap();
    assert_eq!(stored.run_id, report.run_id);
    assert_eq!(stored.committed(), 1);

    let by_id = engine_for(&root).report(Some(&report.run_id)).unwrap().unwrap();
    assert_eq!(by_id.files_scanned, 1);
    let (runs, total) = engine_for(&root).runs(0, 10).unwrap();
    assert_eq!(total, 1);
    assert_eq!(runs[0].status, "completed");
}

#[test]
fn test_cancelled_run_leaves_tree_alone() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    write_file(&root.join("a.pdf"), "a", fixed_time());

    let cancel = Arc::new(AtomicBool::new(false));
    let engine = engine_for(&root).with_cancel_token(Arc::clone(&cancel));
    cancel.store(true, Ordering::SeqCst);
    let report = engine.run(&SilentReporter).unwrap();

    assert!(report.cancelled);
    assert_eq!(report.status(), "cancelled");
    assert_eq!(report.committed(), 0);
    assert!(root.join("a.pdf").exists());
    let (runs, _) = engine_for(&root).runs(0, 10).unwrap();
    assert_eq!(runs[0].status, "cancelled");
}

#[cfg(unix)]
#[test]
fn test_symlinked_category_folder_does_not_lead_outside_root() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    let outside = tmp.path().join("outside");
    fs::create_dir_all(&outside).unwrap();
    std::os::unix::fs::symlink(&outside, root.join("Documents")).unwrap();
    write_file(&root.join("a.pdf"), "a", fixed_time());

    let report = engine_for(&root).run(&SilentReporter).unwrap();

    assert_eq!(report.committed(), 0);
    assert!(root.join("a.pdf").exists());
    assert!(files_under(&outside).is_empty());
    assert!(report.refusals.iter().any(|r| r.path == root.join("a.pdf")));
}

/// Removes `victim` once `after` files have been fingerprinted, while the
/// walk still holds its directory listing.
struct RemoveDuringScan {
    victim: PathBuf,
    after: usize,
}

impl ProgressReporter for RemoveDuringScan {
    fn on_scan_progress(&self, files_scanned: usize, _current_path: &str) {
        if files_scanned == self.after {
            fs::remove_file(&self.victim).unwrap();
        }
    }
}

#[test]
fn test_vanished_file_is_quarantined_and_never_planned() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    for i in 0..102 {
        write_file(&root.join(format!("note{:03}.txt", i)), &format!("note {}", i), fixed_time());
    }
    let victim = root.join("note101.txt");
    let config = AppConfig {
        hash_batch_size: 1,
        ..AppConfig::for_root(&root)
    };
    let reporter = RemoveDuringScan {
        victim: victim.clone(),
        after: 100,
    };

    let outcome = OrganizeEngine::new(config, &root).unwrap().plan(&reporter).unwrap();

    assert_eq!(outcome.report.files_scanned, 101);
    assert_eq!(outcome.report.quarantined.len(), 1);
    assert_eq!(outcome.report.quarantined[0].path, victim);
    assert_eq!(outcome.plan.step_count(), 101);
    assert!(outcome
        .plan
        .chunks
        .iter()
        .flat_map(|c| c.steps.iter())
        .all(|s| s.source != victim));
}
