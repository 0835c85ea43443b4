use super::models::*;
use super::sqlite::Database;
use rusqlite::{params, OptionalExtension, Result, Row};
use tracing::debug;

fn provenance_from_row(row: &Row<'_>) -> Result<ProvenanceRow> {
    Ok(ProvenanceRow {
        id: row.get(0)?,
        extracted_path: row.get(1)?,
        content_hash: row.get(2)?,
        archive_id: row.get(3)?,
        internal_path: row.get(4)?,
        extracted_at: row.get(5)?,
        parent_dir: row.get(6)?,
    })
}

fn run_session_from_row(row: &Row<'_>) -> Result<RunSession> {
    Ok(RunSession {
        id: row.get(0)?,
        run_id: row.get(1)?,
        root_path: row.get(2)?,
        started_at: row.get(3)?,
        completed_at: row.get(4)?,
        status: row.get(5)?,
        files_scanned: row.get(6)?,
        report_json: row.get(7)?,
    })
}

const PROVENANCE_COLUMNS: &str =
    "id, extracted_path, content_hash, archive_id, internal_path, extracted_at, parent_dir";
const RUN_SESSION_COLUMNS: &str =
    "id, run_id, root_path, started_at, completed_at, status, files_scanned, report_json";

impl Database {
    // ── Archives & Provenance ────────────────────────────────────

    /// Insert an archive row; re-registering the same archive id is a no-op.
    pub fn insert_archive(&self, archive: &ArchiveRow) -> Result<usize> {
        self.connection().execute(
            "INSERT OR IGNORE INTO archive \
             (archive_id, archive_name, source_path, content_hash, extracted_at, file_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                archive.archive_id,
                archive.archive_name,
                archive.source_path,
                archive.content_hash,
                archive.extracted_at,
                archive.file_count,
            ],
        )
    }

    pub fn update_archive_file_count(&self, archive_id: &str, file_count: i64) -> Result<()> {
        self.connection().execute(
            "UPDATE archive SET file_count = ?1 WHERE archive_id = ?2",
            params![file_count, archive_id],
        )?;
        Ok(())
    }

    pub fn list_archives(&self) -> Result<Vec<ArchiveRow>> {
        let mut stmt = self.connection().prepare(
            "SELECT archive_id, archive_name, source_path, content_hash, extracted_at, file_count \
             FROM archive ORDER BY extracted_at, archive_id",
        )?;
        let archives = stmt
            .query_map([], |row| {
                Ok(ArchiveRow {
                    archive_id: row.get(0)?,
                    archive_name: row.get(1)?,
                    source_path: row.get(2)?,
                    content_hash: row.get(3)?,
                    extracted_at: row.get(4)?,
                    file_count: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(archives)
    }

    pub fn insert_provenance(&self, row: &ProvenanceRow) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO provenance \
             (extracted_path, content_hash, archive_id, internal_path, extracted_at, parent_dir) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.extracted_path,
                row.content_hash,
                row.archive_id,
                row.internal_path,
                row.extracted_at,
                row.parent_dir,
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn get_provenance_by_path(&self, path: &str) -> Result<Option<ProvenanceRow>> {
        self.connection()
            .query_row(
                &format!("SELECT {PROVENANCE_COLUMNS} FROM provenance WHERE extracted_path = ?1"),
                params![path],
                provenance_from_row,
            )
            .optional()
    }

    /// All provenance rows for a content hash, earliest extraction first.
    pub fn get_provenance_by_hash(&self, content_hash: &str) -> Result<Vec<ProvenanceRow>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {PROVENANCE_COLUMNS} FROM provenance WHERE content_hash = ?1 \
             ORDER BY extracted_at, id"
        ))?;
        let rows = stmt
            .query_map(params![content_hash], provenance_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_provenance_for_archive(&self, archive_id: &str) -> Result<i64> {
        self.connection().query_row(
            "SELECT COUNT(*) FROM provenance WHERE archive_id = ?1",
            params![archive_id],
            |row| row.get(0),
        )
    }

    // ── Lineage ──────────────────────────────────────────────────

    /// Returns 0 when the (seq, direction) pair was already recorded.
    pub fn insert_lineage(
        &self,
        from_path: &str,
        to_path: &str,
        journal_seq: i64,
        direction: &str,
    ) -> Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "INSERT OR IGNORE INTO path_lineage \
             (from_path, to_path, journal_seq, direction, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![from_path, to_path, journal_seq, direction, now],
        )
    }

    /// The most recent lineage row (with id below `before_id`) that moved
    /// something into `to_path`.
    pub fn latest_lineage_into(&self, to_path: &str, before_id: i64) -> Result<Option<LineageRow>> {
        self.connection()
            .query_row(
                "SELECT id, from_path, to_path, journal_seq, direction, recorded_at \
                 FROM path_lineage WHERE to_path = ?1 AND id < ?2 ORDER BY id DESC LIMIT 1",
                params![to_path, before_id],
                |row| {
                    Ok(LineageRow {
                        id: row.get(0)?,
                        from_path: row.get(1)?,
                        to_path: row.get(2)?,
                        journal_seq: row.get(3)?,
                        direction: row.get(4)?,
                        recorded_at: row.get(5)?,
                    })
                },
            )
            .optional()
    }

    /// Journal sequence numbers that have a lineage row in `direction`.
    pub fn lineage_seqs(&self, direction: &str) -> Result<Vec<i64>> {
        let mut stmt = self
            .connection()
            .prepare("SELECT journal_seq FROM path_lineage WHERE direction = ?1 ORDER BY journal_seq")?;
        let seqs = stmt
            .query_map(params![direction], |row| row.get(0))?
            .collect::<Result<Vec<i64>>>()?;
        Ok(seqs)
    }

    // ── Hash Cache ───────────────────────────────────────────────

    pub fn get_cached_hash(&self, path: &str) -> Result<Option<CachedHash>> {
        self.connection()
            .query_row(
                "SELECT path, file_size, mtime_nanos, signature, content_hash \
                 FROM hash_cache WHERE path = ?1",
                params![path],
                |row| {
                    Ok(CachedHash {
                        path: row.get(0)?,
                        file_size: row.get(1)?,
                        mtime_nanos: row.get(2)?,
                        signature: row.get(3)?,
                        content_hash: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    pub fn upsert_cached_hashes(&self, entries: &[CachedHash]) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO hash_cache (path, file_size, mtime_nanos, signature, content_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(path) DO UPDATE SET \
                     file_size = excluded.file_size, \
                     mtime_nanos = excluded.mtime_nanos, \
                     signature = excluded.signature, \
                     content_hash = excluded.content_hash",
            )?;
            for entry in entries {
                count += stmt.execute(params![
                    entry.path,
                    entry.file_size,
                    entry.mtime_nanos,
                    entry.signature,
                    entry.content_hash,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Upserted {} hash cache entries", count);
        Ok(count)
    }

    pub fn count_cached_hashes(&self) -> Result<i64> {
        self.connection()
            .query_row("SELECT COUNT(*) FROM hash_cache", [], |row| row.get(0))
    }

    // ── Canonical Choices ────────────────────────────────────────

    pub fn load_canonical_choices(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .connection()
            .prepare("SELECT content_hash, canonical_path FROM canonical_choice")?;
        let choices = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>>>()?;
        Ok(choices)
    }

    pub fn store_canonical_choices(&self, choices: &[(String, String)]) -> Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO canonical_choice (content_hash, canonical_path, chosen_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(content_hash) DO UPDATE SET \
                     canonical_path = excluded.canonical_path, \
                     chosen_at = excluded.chosen_at \
                 WHERE canonical_path != excluded.canonical_path",
            )?;
            for (hash, path) in choices {
                count += stmt.execute(params![hash, path, now])?;
            }
        }
        tx.commit()?;
        debug!("Stored {} canonical choices", count);
        Ok(count)
    }

    // ── Run Sessions ─────────────────────────────────────────────

    pub fn create_run_session(&self, run_id: &str, root_path: &str) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "INSERT INTO run_session (run_id, root_path, started_at, status) \
             VALUES (?1, ?2, ?3, 'running')",
            params![run_id, root_path, now],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn complete_run_session(
        &self,
        run_id: &str,
        status: &str,
        files_scanned: i64,
        report_json: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "UPDATE run_session SET completed_at = ?1, status = ?2, files_scanned = ?3, \
             report_json = ?4 WHERE run_id = ?5",
            params![now, status, files_scanned, report_json, run_id],
        )?;
        Ok(())
    }

    pub fn get_run_session(&self, run_id: &str) -> Result<Option<RunSession>> {
        self.connection()
            .query_row(
                &format!("SELECT {RUN_SESSION_COLUMNS} FROM run_session WHERE run_id = ?1"),
                params![run_id],
                run_session_from_row,
            )
            .optional()
    }

    pub fn latest_run_session(&self) -> Result<Option<RunSession>> {
        self.connection()
            .query_row(
                &format!(
                    "SELECT {RUN_SESSION_COLUMNS} FROM run_session \
                     WHERE report_json IS NOT NULL ORDER BY id DESC LIMIT 1"
                ),
                [],
                run_session_from_row,
            )
            .optional()
    }

    /// Newest first. Returns (sessions, total_session_count).
    pub fn list_run_sessions(&self, offset: i64, limit: i64) -> Result<(Vec<RunSession>, i64)> {
        let total: i64 = self
            .connection()
            .query_row("SELECT COUNT(*) FROM run_session", [], |row| row.get(0))?;
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {RUN_SESSION_COLUMNS} FROM run_session ORDER BY id DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let sessions = stmt
            .query_map(params![limit, offset], run_session_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok((sessions, total))
    }

    // ── Purge Audit ──────────────────────────────────────────────

    pub fn insert_purge_audit(
        &self,
        before_seq: i64,
        entries_removed: i64,
        blobs_removed: i64,
        note: Option<&str>,
    ) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "INSERT INTO purge_audit (purged_at, before_seq, entries_removed, blobs_removed, note) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![now, before_seq, entries_removed, blobs_removed, note],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn list_purge_audits(&self) -> Result<Vec<PurgeAudit>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, purged_at, before_seq, entries_removed, blobs_removed, note \
             FROM purge_audit ORDER BY id",
        )?;
        let audits = stmt
            .query_map([], |row| {
                Ok(PurgeAudit {
                    id: row.get(0)?,
                    purged_at: row.get(1)?,
                    before_seq: row.get(2)?,
                    entries_removed: row.get(3)?,
                    blobs_removed: row.get(4)?,
                    note: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(audits)
    }
}
