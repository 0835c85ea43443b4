use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

use flate2::write::GzEncoder;
use flate2::Compression;
use reshelve_core::config::AppConfig;
use reshelve_core::hasher::digest;
use reshelve_core::journal::recovery::ReconcileOutcome;
use reshelve_core::journal::{self, Journal};
use reshelve_core::plan::step::{StepKind, StepSpec};
use reshelve_core::provenance::{ProvenanceKey, ProvenanceStore};
use reshelve_core::storage::Database;
use reshelve_core::{Error, OrganizeEngine, SilentReporter, UndoSelection};

fn canonical_root(dir: &Path) -> PathBuf {
    let root = dir.join("root");
    fs::create_dir_all(&root).unwrap();
    fs::canonicalize(root).unwrap()
}

fn engine_for(root: &Path) -> OrganizeEngine {
    OrganizeEngine::new(AppConfig::for_root(root), root).unwrap()
}

fn journal_file(root: &Path) -> PathBuf {
    journal::journal_path(&root.join(".reshelve"))
}

fn build_tar_gz(path: &Path, files: &[(&str, &str)]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, body.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

fn move_step(source: &Path, destination: &Path) -> StepSpec {
    let hash = digest::hash_file(source, u64::MAX).unwrap();
    let size = fs::metadata(source).unwrap().len();
    let mut step = StepSpec::new(
        StepKind::Move,
        source.to_path_buf(),
        destination.to_path_buf(),
        hash,
        size,
    );
    step.confidence = 1.0;
    step
}

#[test]
fn test_corrupt_line_halts_new_commits() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    fs::write(root.join("a.pdf"), "first").unwrap();
    assert_eq!(engine_for(&root).run(&SilentReporter).unwrap().committed(), 1);

    // Damage the checksum of the first record (the intent)
    let path = journal_file(&root);
    let raw = fs::read_to_string(&path).unwrap();
    let replacement = if raw.starts_with('0') { "1" } else { "0" };
    fs::write(&path, format!("{}{}", replacement, &raw[1..])).unwrap();

    let journal = Journal::read(&path).unwrap();
    assert_eq!(journal.corrupt_lines(), &[1]);
    assert_eq!(journal.entries().count(), 1, "intact commit stays readable");

    fs::write(root.join("b.pdf"), "second").unwrap();
    let err = engine_for(&root).run(&SilentReporter).unwrap_err();
    assert!(matches!(err, Error::JournalCorrupt { ref lines } if lines == &[1]));
    assert!(root.join("b.pdf").exists());

    // The only entry's intent is the damaged line, so it cannot be replayed
    let err = engine_for(&root).undo(UndoSelection::LastRun).unwrap_err();
    assert!(matches!(err, Error::JournalCorrupt { .. }));
    assert!(root.join("Documents/a.pdf").exists());

    let (runs, _) = engine_for(&root).runs(0, 10).unwrap();
    assert_eq!(runs[0].status, "failed");
}

#[test]
fn test_intact_entry_before_a_corrupt_line_can_still_be_undone() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    fs::write(root.join("a.pdf"), "first").unwrap();
    assert_eq!(engine_for(&root).run(&SilentReporter).unwrap().journal_range, Some((1, 1)));
    fs::write(root.join("b.pdf"), "second").unwrap();
    assert_eq!(engine_for(&root).run(&SilentReporter).unwrap().journal_range, Some((2, 2)));

    // Damage the last line: the commit of #2
    let path = journal_file(&root);
    let raw = fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = raw.lines().map(str::to_string).collect();
    assert_eq!(lines.len(), 4);
    let flipped = if lines[3].starts_with('0') { "1" } else { "0" };
    lines[3] = format!("{}{}", flipped, &lines[3][1..]);
    fs::write(&path, lines.join("\n") + "\n").unwrap();

    let journal = Journal::read(&path).unwrap();
    assert_eq!(journal.corrupt_lines(), &[4]);
    assert_eq!(journal.entries().map(|e| e.seq).collect::<Vec<_>>(), vec![1]);
    assert_eq!(journal.intact_through(), Some(1));

    // The intent whose commit was lost is left alone
    let outcomes = engine_for(&root).recover().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], ReconcileOutcome::Unresolved { seq: 2, .. }));
    assert!(root.join("Documents/b.pdf").exists());

    let undo = engine_for(&root).undo(UndoSelection::Range(1..=1)).unwrap();
    assert_eq!(undo.reverted, vec![1]);
    assert_eq!(fs::read_to_string(root.join("a.pdf")).unwrap(), "first");
    assert!(root.join("Documents/b.pdf").exists());

    let journal = Journal::read(&path).unwrap();
    assert!(journal.is_undone(1));
    assert_eq!(journal.corrupt_lines(), &[4]);

    // New commits stay halted
    fs::write(root.join("c.pdf"), "third").unwrap();
    let err = engine_for(&root).run(&SilentReporter).unwrap_err();
    assert!(matches!(err, Error::JournalCorrupt { .. }));
    assert!(root.join("c.pdf").exists());
}

#[test]
fn test_recovery_completes_applied_intent_and_discards_unapplied_one() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    fs::write(root.join("a.pdf"), "applied before the crash").unwrap();
    fs::write(root.join("b.pdf"), "never moved").unwrap();
    let docs = root.join("Documents");

    {
        let mut journal = Journal::open(journal_file(&root)).unwrap();
        let applied = move_step(&root.join("a.pdf"), &docs.join("a.pdf"));
        journal
            .begin("crashed-run", "category-documents-001", &applied, vec![docs.clone()])
            .unwrap();
        fs::create_dir_all(&docs).unwrap();
        fs::rename(root.join("a.pdf"), docs.join("a.pdf")).unwrap();

        let unapplied = move_step(&root.join("b.pdf"), &docs.join("b.pdf"));
        journal
            .begin("crashed-run", "category-documents-001", &unapplied, Vec::new())
            .unwrap();
    }

    let outcomes = engine_for(&root).recover().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        outcomes[0],
        ReconcileOutcome::Completed {
            seq: 1,
            path: docs.join("a.pdf"),
        }
    );
    assert!(matches!(outcomes[1], ReconcileOutcome::Discarded { seq: 2, .. }));

    let journal = Journal::read(journal_file(&root)).unwrap();
    assert!(journal.pending_intents().is_empty());
    assert_eq!(journal.range_for_run("crashed-run"), Some((1, 1)));

    // Recovery is idempotent
    assert!(engine_for(&root).recover().unwrap().is_empty());

    let undo = engine_for(&root).undo(UndoSelection::LastRun).unwrap();
    assert_eq!(undo.reverted, vec![1]);
    assert_eq!(
        fs::read_to_string(root.join("a.pdf")).unwrap(),
        "applied before the crash"
    );
    assert!(!docs.exists());
}

#[test]
fn test_recovery_removes_interrupted_copy() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    fs::write(root.join("a.pdf"), "copied halfway").unwrap();
    let docs = root.join("Documents");

    {
        let mut journal = Journal::open(journal_file(&root)).unwrap();
        let step = move_step(&root.join("a.pdf"), &docs.join("a.pdf"));
        journal
            .begin("crashed-run", "category-documents-001", &step, vec![docs.clone()])
            .unwrap();
        // The copy finished but the source was never removed
        fs::create_dir_all(&docs).unwrap();
        fs::copy(root.join("a.pdf"), docs.join("a.pdf")).unwrap();
    }

    let outcomes = engine_for(&root).recover().unwrap();
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        ReconcileOutcome::Discarded { seq, reason } => {
            assert_eq!(*seq, 1);
            assert!(reason.contains("interrupted copy"), "{}", reason);
        }
        other => panic!("expected a discard, got {:?}", other),
    }
    assert_eq!(fs::read_to_string(root.join("a.pdf")).unwrap(), "copied halfway");
    assert!(!docs.exists());
    assert!(Journal::read(journal_file(&root)).unwrap().pending_intents().is_empty());
}

#[test]
fn test_recovery_leaves_ambiguous_intent_unresolved() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    fs::write(root.join("a.pdf"), "as planned").unwrap();
    let docs = root.join("Documents");

    {
        let mut journal = Journal::open(journal_file(&root)).unwrap();
        let step = move_step(&root.join("a.pdf"), &docs.join("a.pdf"));
        journal
            .begin("crashed-run", "category-documents-001", &step, Vec::new())
            .unwrap();
    }
    // Edited after the intent was written: neither end matches
    fs::write(root.join("a.pdf"), "edited since").unwrap();

    let outcomes = engine_for(&root).recover().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_unresolved());
    assert!(matches!(outcomes[0], ReconcileOutcome::Unresolved { seq: 1, .. }));
    assert_eq!(fs::read_to_string(root.join("a.pdf")).unwrap(), "edited since");
    assert!(!docs.exists());

    let journal = Journal::read(journal_file(&root)).unwrap();
    assert_eq!(journal.pending_intents().len(), 1);
    assert_eq!(journal.entries().count(), 0);
}

#[test]
fn test_missing_lineage_row_is_backfilled_and_provenance_restored() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    let archive = tmp.path().join("incoming/notes.tar.gz");
    build_tar_gz(
        &archive,
        &[
            ("one.txt", "note one"),
            ("two.txt", "note two"),
            ("three.txt", "note three"),
        ],
    );
    let extracted = engine_for(&root).extract(&archive).unwrap();
    let report = engine_for(&root).run(&SilentReporter).unwrap();
    assert_eq!(report.journal_range, Some((1, 3)));

    let journal = Journal::read(journal_file(&root)).unwrap();
    let middle = journal.entry(2).unwrap().effect.new_path.clone();
    let db_path = root.join(".reshelve/reshelve.db");
    {
        // A lineage insert that failed after its journal commit
        let db = Database::open(&db_path).unwrap();
        db.connection()
            .execute("DELETE FROM path_lineage WHERE journal_seq = 2", [])
            .unwrap();
        assert_eq!(db.lineage_seqs("apply").unwrap(), vec![1, 3]);
        let store = ProvenanceStore::new(&db);
        assert!(!store.lookup(ProvenanceKey::Path(&middle)).unwrap().is_tracked());
    }

    engine_for(&root).recover().unwrap();

    let db = Database::open(&db_path).unwrap();
    assert_eq!(db.lineage_seqs("apply").unwrap(), vec![1, 2, 3]);
    let store = ProvenanceStore::new(&db);
    assert_eq!(
        store.lookup(ProvenanceKey::Path(&middle)).unwrap().archive_id(),
        Some(&extracted.archive_id)
    );
    // Settled again, not re-partitioned by category
    assert!(engine_for(&root).plan(&SilentReporter).unwrap().plan.is_empty());
}

#[test]
fn test_undo_stops_when_a_file_changed_after_commit() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    fs::write(root.join("a.pdf"), "alpha").unwrap();
    fs::write(root.join("b.pdf"), "beta").unwrap();
    let report = engine_for(&root).run(&SilentReporter).unwrap();
    assert_eq!(report.journal_range, Some((1, 2)));

    // b.pdf was committed last, so it is reverted first
    fs::write(root.join("Documents/b.pdf"), "beta, edited").unwrap();

    let err = engine_for(&root).undo(UndoSelection::LastRun).unwrap_err();
    match err {
        Error::UndoConflict { seq, reverted, .. } => {
            assert_eq!(seq, 2);
            assert!(reverted.is_empty());
        }
        other => panic!("expected an undo conflict, got {:?}", other),
    }
    assert!(root.join("Documents/a.pdf").exists());
    assert!(!root.join("a.pdf").exists());

    // The untouched earlier entry can still be reverted on its own
    let undo = engine_for(&root).undo(UndoSelection::Range(1..=1)).unwrap();
    assert_eq!(undo.reverted, vec![1]);
    assert!(root.join("a.pdf").exists());
}

#[test]
fn test_second_writer_is_refused() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    fs::write(root.join("a.pdf"), "alpha").unwrap();

    let _held = Journal::open(journal_file(&root)).unwrap();
    let err = engine_for(&root).run(&SilentReporter).unwrap_err();
    assert!(matches!(err, Error::JournalLocked(_)));
    assert!(root.join("a.pdf").exists());
}

#[test]
fn test_purge_drops_history_and_keeps_numbering() {
    let tmp = tempdir().unwrap();
    let root = canonical_root(tmp.path());
    fs::write(root.join("a.pdf"), "alpha").unwrap();
    engine_for(&root).run(&SilentReporter).unwrap();
    fs::write(root.join("b.pdf"), "beta").unwrap();
    engine_for(&root).run(&SilentReporter).unwrap();

    let summary = engine_for(&root).purge(2).unwrap();
    assert_eq!(summary.entries_removed, 1);

    let journal = Journal::read(journal_file(&root)).unwrap();
    assert_eq!(journal.entries().map(|e| e.seq).collect::<Vec<_>>(), vec![2]);
    assert_eq!(journal.last_seq(), 2);

    {
        let db = Database::open(root.join(".reshelve/reshelve.db")).unwrap();
        let audits = db.list_purge_audits().unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].before_seq, 2);
        assert_eq!(audits[0].entries_removed, 1);
    }

    fs::write(root.join("c.pdf"), "gamma").unwrap();
    let report = engine_for(&root).run(&SilentReporter).unwrap();
    assert_eq!(report.journal_range, Some((3, 3)));
}
