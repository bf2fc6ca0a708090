//! SQLite-backed document store for units, the revision arena and derived state.

use crate::approval::FlagUpdate;
use crate::error::{LedgerError, Result};
use crate::models::{
    PendingVideoText, ProjectAggregate, ScoredReference, SpellIssue, TextUnit,
    TranslationRevision, UnitKey, VideoTextCandidate, VolumeAggregate,
};
use crate::search::IndexOp;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS text_units (
        project TEXT NOT NULL,
        volume TEXT NOT NULL,
        number INTEGER NOT NULL,
        source_text TEXT NOT NULL,
        letters INTEGER NOT NULL,
        has_translate INTEGER NOT NULL DEFAULT 0,
        translate_approved INTEGER NOT NULL DEFAULT 0,
        video_refs TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (project, volume, number)
    );

    CREATE TABLE IF NOT EXISTS revisions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project TEXT NOT NULL,
        volume TEXT NOT NULL,
        number INTEGER NOT NULL,
        text TEXT NOT NULL,
        author TEXT NOT NULL,
        editor TEXT NOT NULL,
        created_at TEXT NOT NULL,
        next_id INTEGER,
        first_id INTEGER,
        deleted INTEGER NOT NULL DEFAULT 0,
        is_translate INTEGER NOT NULL,
        letters INTEGER NOT NULL,
        spell_issues TEXT NOT NULL DEFAULT '[]'
    );
    CREATE INDEX IF NOT EXISTS idx_revisions_project ON revisions(project);
    CREATE INDEX IF NOT EXISTS idx_revisions_key ON revisions(project, volume, number);

    CREATE TABLE IF NOT EXISTS revision_heads (
        project TEXT NOT NULL,
        volume TEXT NOT NULL,
        number INTEGER NOT NULL,
        head_id INTEGER NOT NULL,
        PRIMARY KEY (project, volume, number)
    );

    CREATE TABLE IF NOT EXISTS volume_aggregates (
        project TEXT NOT NULL,
        volume TEXT NOT NULL,
        letters INTEGER NOT NULL DEFAULT 0,
        texts INTEGER NOT NULL DEFAULT 0,
        translated_letters INTEGER NOT NULL DEFAULT 0,
        translated_texts INTEGER NOT NULL DEFAULT 0,
        approved_letters INTEGER NOT NULL DEFAULT 0,
        approved_texts INTEGER NOT NULL DEFAULT 0,
        last_submit TEXT,
        PRIMARY KEY (project, volume)
    );

    CREATE TABLE IF NOT EXISTS project_aggregates (
        project TEXT PRIMARY KEY,
        letters INTEGER NOT NULL DEFAULT 0,
        texts INTEGER NOT NULL DEFAULT 0,
        translated_letters INTEGER NOT NULL DEFAULT 0,
        translated_texts INTEGER NOT NULL DEFAULT 0,
        approved_letters INTEGER NOT NULL DEFAULT 0,
        approved_texts INTEGER NOT NULL DEFAULT 0,
        last_submit TEXT
    );

    CREATE TABLE IF NOT EXISTS pending_video_texts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project TEXT NOT NULL,
        video_id TEXT NOT NULL,
        frame INTEGER NOT NULL,
        text TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS index_outbox (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        op TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
";

const UNIT_COLUMNS: &str =
    "project, volume, number, source_text, letters, has_translate, translate_approved, video_refs";

const REVISION_COLUMNS: &str = "id, project, volume, number, text, author, editor, created_at, \
     next_id, first_id, deleted, is_translate, letters, spell_issues";

/// A revision about to be appended
#[derive(Debug, Clone)]
pub struct RevisionDraft {
    pub key: UnitKey,
    pub text: String,
    /// Who submitted this revision
    pub submitter: String,
    /// Revision the submitter believes is the live head
    pub prev_revision_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub is_translate: bool,
    pub letters: i64,
    pub spell_issues: Vec<SpellIssue>,
}

/// What one append changed
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub revision: TranslationRevision,
    /// Previous chain tail, now pointing at `revision`
    pub superseded: Option<TranslationRevision>,
    /// `prev_revision_id` was given but no longer the live head
    pub stale_head_link: bool,
    pub flags: FlagUpdate,
}

/// Result of soft-deleting a revision
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub revision: TranslationRevision,
    /// The revision was the live head, so the unit lost its translation
    pub was_live_head: bool,
    /// Already deleted before this call
    pub already_deleted: bool,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and ensure the schema exists
    pub fn new(database_path: &str) -> Result<Self> {
        let conn = Connection::open(database_path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-transaction drops the Transaction, which rolls back, so the
        // connection behind a poisoned lock is still consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ==================== Text Units ====================

    /// Insert extracted units; units already present keep their state.
    /// Returns how many were new.
    pub fn insert_units(&self, units: &[TextUnit]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO text_units (project, volume, number, source_text, letters)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for unit in units {
                inserted += stmt.execute(params![
                    unit.key.project,
                    unit.key.volume,
                    unit.key.number,
                    unit.source_text,
                    unit.letters
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_unit(&self, key: &UnitKey) -> Result<Option<TextUnit>> {
        let conn = self.conn();
        Ok(load_unit(&conn, key)?)
    }

    /// Every unit of the given volumes, ordered by position
    pub fn units_in_volumes(&self, project: &str, volumes: &[String]) -> Result<Vec<TextUnit>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM text_units WHERE project = ?1 AND volume = ?2 ORDER BY number",
            UNIT_COLUMNS
        ))?;
        let mut units = Vec::new();
        for volume in volumes {
            let rows = stmt.query_map(params![project, volume], row_to_unit)?;
            for unit in rows {
                units.push(unit?);
            }
        }
        Ok(units)
    }

    pub fn volumes(&self, project: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT DISTINCT volume FROM text_units WHERE project = ?1 ORDER BY volume")?;
        let volumes = stmt
            .query_map(params![project], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(volumes)
    }

    pub fn projects(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT project FROM text_units ORDER BY project")?;
        let projects = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(projects)
    }

    /// Overwrite a unit's reference list (read-modify-write by the caller)
    pub fn set_unit_references(&self, key: &UnitKey, references: &[ScoredReference]) -> Result<()> {
        let json = serde_json::to_string(references)?;
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE text_units SET video_refs = ?1
             WHERE project = ?2 AND volume = ?3 AND number = ?4",
            params![json, key.project, key.volume, key.number],
        )?;
        if updated == 0 {
            return Err(LedgerError::UnitNotFound(key.clone()));
        }
        Ok(())
    }

    // ==================== Revisions ====================

    /// Append a revision to the key's chain in one transaction.
    ///
    /// The head-pointer row is the compare-and-swap point: the new revision is
    /// always linked behind the tail it names, so two concurrent appends can
    /// never both end up with `next_id IS NULL`.
    pub fn append_revision<F>(&self, draft: &RevisionDraft, propagate: F) -> Result<AppendOutcome>
    where
        F: FnOnce(&TextUnit) -> FlagUpdate,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let unit = load_unit(&tx, &draft.key)?
            .ok_or_else(|| LedgerError::UnitNotFound(draft.key.clone()))?;

        let tail_id: Option<i64> = tx
            .query_row(
                "SELECT head_id FROM revision_heads
                 WHERE project = ?1 AND volume = ?2 AND number = ?3",
                params![draft.key.project, draft.key.volume, draft.key.number],
                |row| row.get(0),
            )
            .optional()?;
        let tail = match tail_id {
            Some(id) => load_revision(&tx, id)?,
            None => None,
        };

        let mut author = draft.submitter.clone();
        let mut stale_head_link = false;
        if let Some(prev_id) = draft.prev_revision_id {
            let prev = load_revision(&tx, prev_id)?
                .filter(|prev| prev.key == draft.key)
                .ok_or(LedgerError::RevisionNotFound(prev_id))?;
            author = prev.author.clone();
            stale_head_link = tail_id != Some(prev.id) || !prev.is_live_head();
        }
        let first_id = tail.as_ref().map(TranslationRevision::chain_root);

        tx.execute(
            "INSERT INTO revisions (project, volume, number, text, author, editor, created_at,
                                    next_id, first_id, deleted, is_translate, letters, spell_issues)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, 0, ?9, ?10, ?11)",
            params![
                draft.key.project,
                draft.key.volume,
                draft.key.number,
                draft.text,
                author,
                draft.submitter,
                draft.created_at,
                first_id,
                draft.is_translate,
                draft.letters,
                serde_json::to_string(&draft.spell_issues)?,
            ],
        )?;
        let new_id = tx.last_insert_rowid();

        let superseded = match tail {
            Some(mut tail) => {
                tx.execute(
                    "UPDATE revisions SET next_id = ?1 WHERE id = ?2 AND next_id IS NULL",
                    params![new_id, tail.id],
                )?;
                tail.next_id = Some(new_id);
                Some(tail)
            }
            None => None,
        };

        tx.execute(
            "INSERT INTO revision_heads (project, volume, number, head_id) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(project, volume, number) DO UPDATE SET head_id = excluded.head_id",
            params![draft.key.project, draft.key.volume, draft.key.number, new_id],
        )?;

        let flags = propagate(&unit);
        if flags.changed {
            tx.execute(
                "UPDATE text_units SET has_translate = ?1, translate_approved = ?2
                 WHERE project = ?3 AND volume = ?4 AND number = ?5",
                params![
                    flags.has_translate,
                    flags.translate_approved,
                    draft.key.project,
                    draft.key.volume,
                    draft.key.number
                ],
            )?;
        }

        let revision = load_revision(&tx, new_id)?.ok_or(LedgerError::RevisionNotFound(new_id))?;
        tx.commit()?;

        Ok(AppendOutcome {
            revision,
            superseded,
            stale_head_link,
            flags,
        })
    }

    pub fn get_revision(&self, id: i64) -> Result<Option<TranslationRevision>> {
        let conn = self.conn();
        Ok(load_revision(&conn, id)?)
    }

    /// The live head of a key, if its chain tail is not deleted
    pub fn head_revision(&self, key: &UnitKey) -> Result<Option<TranslationRevision>> {
        let conn = self.conn();
        let revision = conn
            .query_row(
                &format!(
                    "SELECT {} FROM revisions WHERE id = (
                         SELECT head_id FROM revision_heads
                         WHERE project = ?1 AND volume = ?2 AND number = ?3)",
                    REVISION_COLUMNS
                ),
                params![key.project, key.volume, key.number],
                row_to_revision,
            )
            .optional()?;
        Ok(revision.filter(TranslationRevision::is_live_head))
    }

    /// The key's chain from its first revision to its tail, deleted links included
    pub fn chain(&self, key: &UnitKey) -> Result<Vec<TranslationRevision>> {
        let conn = self.conn();
        let tail_id: Option<i64> = conn
            .query_row(
                "SELECT head_id FROM revision_heads
                 WHERE project = ?1 AND volume = ?2 AND number = ?3",
                params![key.project, key.volume, key.number],
                |row| row.get(0),
            )
            .optional()?;
        let Some(tail) = tail_id.map(|id| load_revision(&conn, id)).transpose()?.flatten() else {
            return Ok(Vec::new());
        };

        let mut chain = Vec::new();
        let mut cursor = load_revision(&conn, tail.chain_root())?;
        while let Some(revision) = cursor {
            let next = revision.next_id;
            chain.push(revision);
            cursor = match next {
                Some(id) => load_revision(&conn, id)?,
                None => None,
            };
        }
        Ok(chain)
    }

    /// Every revision stored for a key, in id order
    pub fn revisions_for_key(&self, key: &UnitKey) -> Result<Vec<TranslationRevision>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM revisions
             WHERE project = ?1 AND volume = ?2 AND number = ?3 ORDER BY id",
            REVISION_COLUMNS
        ))?;
        let revisions = stmt
            .query_map(params![key.project, key.volume, key.number], row_to_revision)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(revisions)
    }

    /// Live heads across a project
    pub fn live_heads(&self, project: &str) -> Result<Vec<TranslationRevision>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM revisions
             WHERE project = ?1 AND deleted = 0 AND next_id IS NULL
             ORDER BY volume, number",
            REVISION_COLUMNS
        ))?;
        let revisions = stmt
            .query_map(params![project], row_to_revision)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(revisions)
    }

    /// Soft-delete a revision; the chain is not relinked
    pub fn mark_deleted(&self, id: i64) -> Result<DeleteOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut revision = load_revision(&tx, id)?.ok_or(LedgerError::RevisionNotFound(id))?;
        if revision.deleted {
            return Ok(DeleteOutcome {
                revision,
                was_live_head: false,
                already_deleted: true,
            });
        }

        let was_live_head = revision.is_live_head();
        tx.execute("UPDATE revisions SET deleted = 1 WHERE id = ?1", params![id])?;
        if was_live_head {
            tx.execute(
                "UPDATE text_units SET has_translate = 0, translate_approved = 0
                 WHERE project = ?1 AND volume = ?2 AND number = ?3",
                params![revision.key.project, revision.key.volume, revision.key.number],
            )?;
        }
        tx.commit()?;

        revision.deleted = true;
        Ok(DeleteOutcome {
            revision,
            was_live_head,
            already_deleted: false,
        })
    }

    /// Spelling issues summed over a project's live heads
    pub fn spell_issue_total(&self, project: &str) -> Result<u64> {
        let conn = self.conn();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(json_array_length(spell_issues)), 0) FROM revisions
             WHERE project = ?1 AND deleted = 0 AND next_id IS NULL",
            params![project],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    // ==================== Aggregates ====================

    /// Count a volume straight from its units; `last_submit` is left empty
    pub fn compute_volume_counts(&self, project: &str, volume: &str) -> Result<VolumeAggregate> {
        let conn = self.conn();
        let aggregate = conn.query_row(
            "SELECT
                COALESCE(SUM(letters), 0),
                COUNT(*),
                COALESCE(SUM(CASE WHEN has_translate = 1 THEN letters ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN has_translate = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN translate_approved = 1 THEN letters ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN translate_approved = 1 THEN 1 ELSE 0 END), 0)
             FROM text_units WHERE project = ?1 AND volume = ?2",
            params![project, volume],
            |row| {
                Ok(VolumeAggregate {
                    project: project.to_string(),
                    volume: volume.to_string(),
                    letters: row.get(0)?,
                    texts: row.get(1)?,
                    translated_letters: row.get(2)?,
                    translated_texts: row.get(3)?,
                    approved_letters: row.get(4)?,
                    approved_texts: row.get(5)?,
                    last_submit: None,
                })
            },
        )?;
        Ok(aggregate)
    }

    /// Replace a volume's counters; its `last_submit` is preserved
    pub fn store_volume_aggregate(&self, aggregate: &VolumeAggregate) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO volume_aggregates (project, volume, letters, texts, translated_letters,
                                            translated_texts, approved_letters, approved_texts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(project, volume) DO UPDATE SET
                letters = excluded.letters,
                texts = excluded.texts,
                translated_letters = excluded.translated_letters,
                translated_texts = excluded.translated_texts,
                approved_letters = excluded.approved_letters,
                approved_texts = excluded.approved_texts",
            params![
                aggregate.project,
                aggregate.volume,
                aggregate.letters,
                aggregate.texts,
                aggregate.translated_letters,
                aggregate.translated_texts,
                aggregate.approved_letters,
                aggregate.approved_texts
            ],
        )?;
        Ok(())
    }

    pub fn get_volume_aggregate(
        &self,
        project: &str,
        volume: &str,
    ) -> Result<Option<VolumeAggregate>> {
        let conn = self.conn();
        let aggregate = conn
            .query_row(
                "SELECT project, volume, letters, texts, translated_letters, translated_texts,
                        approved_letters, approved_texts, last_submit
                 FROM volume_aggregates WHERE project = ?1 AND volume = ?2",
                params![project, volume],
                row_to_volume_aggregate,
            )
            .optional()?;
        Ok(aggregate)
    }

    pub fn volume_aggregates(&self, project: &str) -> Result<Vec<VolumeAggregate>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT project, volume, letters, texts, translated_letters, translated_texts,
                    approved_letters, approved_texts, last_submit
             FROM volume_aggregates WHERE project = ?1 ORDER BY volume",
        )?;
        let aggregates = stmt
            .query_map(params![project], row_to_volume_aggregate)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(aggregates)
    }

    /// Replace a project's counters; its `last_submit` is preserved
    pub fn store_project_aggregate(&self, aggregate: &ProjectAggregate) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO project_aggregates (project, letters, texts, translated_letters,
                                             translated_texts, approved_letters, approved_texts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(project) DO UPDATE SET
                letters = excluded.letters,
                texts = excluded.texts,
                translated_letters = excluded.translated_letters,
                translated_texts = excluded.translated_texts,
                approved_letters = excluded.approved_letters,
                approved_texts = excluded.approved_texts",
            params![
                aggregate.project,
                aggregate.letters,
                aggregate.texts,
                aggregate.translated_letters,
                aggregate.translated_texts,
                aggregate.approved_letters,
                aggregate.approved_texts
            ],
        )?;
        Ok(())
    }

    pub fn get_project_aggregate(&self, project: &str) -> Result<Option<ProjectAggregate>> {
        let conn = self.conn();
        let aggregate = conn
            .query_row(
                "SELECT project, letters, texts, translated_letters, translated_texts,
                        approved_letters, approved_texts, last_submit
                 FROM project_aggregates WHERE project = ?1",
                params![project],
                |row| {
                    Ok(ProjectAggregate {
                        project: row.get(0)?,
                        letters: row.get(1)?,
                        texts: row.get(2)?,
                        translated_letters: row.get(3)?,
                        translated_texts: row.get(4)?,
                        approved_letters: row.get(5)?,
                        approved_texts: row.get(6)?,
                        last_submit: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(aggregate)
    }

    /// Record a submit time on the volume and project rows
    pub fn touch_last_submit(&self, project: &str, volume: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO volume_aggregates (project, volume, last_submit) VALUES (?1, ?2, ?3)
             ON CONFLICT(project, volume) DO UPDATE SET last_submit = excluded.last_submit",
            params![project, volume, at],
        )?;
        tx.execute(
            "INSERT INTO project_aggregates (project, last_submit) VALUES (?1, ?2)
             ON CONFLICT(project) DO UPDATE SET last_submit = excluded.last_submit",
            params![project, at],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ==================== Pending Video Texts ====================

    pub fn enqueue_video_text(&self, project: &str, candidate: &VideoTextCandidate) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO pending_video_texts (project, video_id, frame, text)
             VALUES (?1, ?2, ?3, ?4)",
            params![project, candidate.video_id, candidate.frame, candidate.text],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Pending candidates with ids above `after_id`, oldest first
    pub fn pending_video_texts(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<PendingVideoText>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, project, video_id, frame, text FROM pending_video_texts
             WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let pending = stmt
            .query_map(params![after_id, limit as i64], |row| {
                Ok(PendingVideoText {
                    id: row.get(0)?,
                    project: row.get(1)?,
                    candidate: VideoTextCandidate {
                        video_id: row.get(2)?,
                        frame: row.get(3)?,
                        text: row.get(4)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pending)
    }

    pub fn remove_video_text(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let removed = conn.execute("DELETE FROM pending_video_texts WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn pending_video_text_count(&self) -> Result<usize> {
        let conn = self.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_video_texts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ==================== Index Outbox ====================

    /// Persist an index write that failed so it can be replayed
    pub fn push_index_op(&self, op: &IndexOp) -> Result<i64> {
        let json = serde_json::to_string(op)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO index_outbox (op, created_at) VALUES (?1, ?2)",
            params![json, Utc::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Deferred index writes, oldest first
    pub fn index_outbox(&self, limit: usize) -> Result<Vec<(i64, IndexOp)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, op FROM index_outbox ORDER BY id LIMIT ?1")?;
        let ops = stmt
            .query_map(params![limit as i64], |row| Ok((row.get(0)?, json_column(row, 1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    pub fn index_outbox_len(&self) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM index_outbox", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn remove_index_op(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM index_outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ==================== Project Lifecycle ====================

    /// Remove every row that belongs to a project
    pub fn delete_project(&self, project: &str) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let units = tx.execute("DELETE FROM text_units WHERE project = ?1", params![project])?;
        for table in [
            "revisions",
            "revision_heads",
            "volume_aggregates",
            "project_aggregates",
            "pending_video_texts",
        ] {
            tx.execute(&format!("DELETE FROM {} WHERE project = ?1", table), params![project])?;
        }
        delete_project_outbox(&tx, project)?;
        tx.commit()?;
        Ok(units)
    }
}

/// Deferred writes for a deleted project must not resurrect its documents
fn delete_project_outbox(tx: &Transaction<'_>, project: &str) -> rusqlite::Result<usize> {
    tx.execute(
        "DELETE FROM index_outbox
         WHERE json_extract(op, '$.key.project') = ?1 OR json_extract(op, '$.project') = ?1",
        params![project],
    )
}

fn load_unit(conn: &Connection, key: &UnitKey) -> rusqlite::Result<Option<TextUnit>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM text_units WHERE project = ?1 AND volume = ?2 AND number = ?3",
            UNIT_COLUMNS
        ),
        params![key.project, key.volume, key.number],
        row_to_unit,
    )
    .optional()
}

fn load_revision(conn: &Connection, id: i64) -> rusqlite::Result<Option<TranslationRevision>> {
    conn.query_row(
        &format!("SELECT {} FROM revisions WHERE id = ?1", REVISION_COLUMNS),
        params![id],
        row_to_revision,
    )
    .optional()
}

fn row_to_unit(row: &Row<'_>) -> rusqlite::Result<TextUnit> {
    Ok(TextUnit {
        key: UnitKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get(2)?),
        source_text: row.get(3)?,
        letters: row.get(4)?,
        has_translate: row.get(5)?,
        translate_approved: row.get(6)?,
        references: json_column(row, 7)?,
    })
}

fn row_to_revision(row: &Row<'_>) -> rusqlite::Result<TranslationRevision> {
    Ok(TranslationRevision {
        id: row.get(0)?,
        key: UnitKey::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get(3)?),
        text: row.get(4)?,
        author: row.get(5)?,
        editor: row.get(6)?,
        created_at: row.get(7)?,
        next_id: row.get(8)?,
        first_id: row.get(9)?,
        deleted: row.get(10)?,
        is_translate: row.get(11)?,
        letters: row.get(12)?,
        spell_issues: json_column(row, 13)?,
    })
}

fn row_to_volume_aggregate(row: &Row<'_>) -> rusqlite::Result<VolumeAggregate> {
    Ok(VolumeAggregate {
        project: row.get(0)?,
        volume: row.get(1)?,
        letters: row.get(2)?,
        texts: row.get(3)?,
        translated_letters: row.get(4)?,
        translated_texts: row.get(5)?,
        approved_letters: row.get(6)?,
        approved_texts: row.get(7)?,
        last_submit: row.get(8)?,
    })
}

/// Decode a JSON text column
fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
