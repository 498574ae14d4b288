//! Item repository: one row per (run, message) with the committed pipeline
//! step and the artifacts produced so far.

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, OptionalExtension, Row};

use super::enrichment_repo::EnrichmentStatus;
use super::{parse_column, Database, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Pending,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(format!("unknown item status '{}'", other)),
        }
    }
}

/// Last durably committed pipeline step of an item.
///
/// Steps are ordered; `FailedExtract` is a terminal branch off `Uploaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemStep {
    None,
    Fetched,
    Saved,
    Uploaded,
    Parsed,
    Persisted,
    FailedExtract,
}

impl ItemStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStep::None => "none",
            ItemStep::Fetched => "fetched",
            ItemStep::Saved => "saved",
            ItemStep::Uploaded => "uploaded",
            ItemStep::Parsed => "parsed",
            ItemStep::Persisted => "persisted",
            ItemStep::FailedExtract => "failed_extract",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStep::Persisted | ItemStep::FailedExtract)
    }
}

impl fmt::Display for ItemStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ItemStep::None),
            "fetched" => Ok(ItemStep::Fetched),
            "saved" => Ok(ItemStep::Saved),
            "uploaded" => Ok(ItemStep::Uploaded),
            "parsed" => Ok(ItemStep::Parsed),
            "persisted" => Ok(ItemStep::Persisted),
            "failed_extract" => Ok(ItemStep::FailedExtract),
            other => Err(format!("unknown item step '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ItemRow {
    pub id: String,
    pub run_id: String,
    pub external_message_id: String,
    pub subject: Option<String>,
    pub received_at: Option<String>,
    pub status: ItemStatus,
    pub step: ItemStep,
    pub attachment_id: Option<String>,
    pub attachment_name: Option<String>,
    pub content_type: Option<String>,
    pub content_hash: Option<String>,
    pub storage_path: Option<String>,
    pub resume_id: Option<String>,
    pub attempts: u32,
    pub enrichment_status: Option<EnrichmentStatus>,
    pub enrichment_retry_at: Option<String>,
    pub enrichment_error: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ItemRow {
    /// A fresh item for a message discovered by a run.
    pub fn new(
        run_id: &str,
        external_message_id: &str,
        subject: Option<String>,
        received_at: Option<String>,
        now: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            external_message_id: external_message_id.to_string(),
            subject,
            received_at,
            status: ItemStatus::Pending,
            step: ItemStep::None,
            attachment_id: None,
            attachment_name: None,
            content_type: None,
            content_hash: None,
            storage_path: None,
            resume_id: None,
            attempts: 0,
            enrichment_status: None,
            enrichment_retry_at: None,
            enrichment_error: None,
            last_error: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    /// True if the item reached the no-text-layer branch.
    pub fn is_poisoned(&self) -> bool {
        self.step == ItemStep::FailedExtract
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let enrichment_status: Option<String> = row.get("enrichment_status")?;
        let enrichment_status = match enrichment_status {
            Some(raw) => Some(raw.parse::<EnrichmentStatus>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(DatabaseError::InvalidValue {
                        column: "enrichment_status".to_string(),
                        reason: e,
                    }),
                )
            })?),
            None => None,
        };

        Ok(Self {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            external_message_id: row.get("external_message_id")?,
            subject: row.get("subject")?,
            received_at: row.get("received_at")?,
            status: parse_column(row, "status")?,
            step: parse_column(row, "step")?,
            attachment_id: row.get("attachment_id")?,
            attachment_name: row.get("attachment_name")?,
            content_type: row.get("content_type")?,
            content_hash: row.get("content_hash")?,
            storage_path: row.get("storage_path")?,
            resume_id: row.get("resume_id")?,
            attempts: row.get("attempts")?,
            enrichment_status,
            enrichment_retry_at: row.get("enrichment_retry_at")?,
            enrichment_error: row.get("enrichment_error")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Per-run item counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemSummary {
    pub total: i64,
    pub pending: i64,
    pub completed: i64,
    pub failed: i64,
    pub poisoned: i64,
    pub with_resume: i64,
}

/// Inserts the item unless one already exists for (run, message), then
/// returns the stored row. Re-discovering a message never resets progress.
pub fn upsert(db: &Database, item: &ItemRow) -> Result<ItemRow, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR IGNORE INTO items (id, run_id, external_message_id, subject, received_at,
             status, step, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                item.id,
                item.run_id,
                item.external_message_id,
                item.subject,
                item.received_at,
                item.status.as_str(),
                item.step.as_str(),
                item.attempts,
                item.created_at,
                item.updated_at,
            ],
        )?;
        Ok(conn.query_row(
            "SELECT * FROM items WHERE run_id = ?1 AND external_message_id = ?2",
            params![item.run_id, item.external_message_id],
            ItemRow::from_row,
        )?)
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ItemRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM items WHERE id = ?1",
                params![id],
                ItemRow::from_row,
            )
            .optional()?)
    })
}

/// Lists the items of a run in discovery order.
pub fn find_by_run(db: &Database, run_id: &str) -> Result<Vec<ItemRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM items WHERE run_id = ?1 ORDER BY created_at, rowid")?;
        let rows = stmt
            .query_map(params![run_id], ItemRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// The most recently touched unfinished item for the same mailbox message
/// in another run, if it committed any step.
pub fn find_resumable(
    db: &Database,
    mailbox: &str,
    external_message_id: &str,
    exclude_run_id: &str,
) -> Result<Option<ItemRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT items.* FROM items JOIN runs ON runs.id = items.run_id
                 WHERE runs.mailbox = ?1 AND items.external_message_id = ?2
                   AND items.run_id != ?3 AND items.status != 'completed'
                   AND items.step NOT IN ('none', 'persisted', 'failed_extract')
                 ORDER BY items.updated_at DESC, items.rowid DESC
                 LIMIT 1",
                params![mailbox, external_message_id, exclude_run_id],
                ItemRow::from_row,
            )
            .optional()?)
    })
}

/// Copies the committed step and artifacts of `previous` onto a fresh item
/// so the new run continues where the earlier one stopped. Items that have
/// made progress of their own are left alone.
pub fn adopt_progress(
    db: &Database,
    id: &str,
    previous: &ItemRow,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE items SET step = ?2, attachment_id = ?3, attachment_name = ?4,
             content_type = ?5, content_hash = ?6, storage_path = ?7, resume_id = ?8,
             updated_at = ?9
             WHERE id = ?1 AND step = 'none' AND attempts = 0",
            params![
                id,
                previous.step.as_str(),
                previous.attachment_id,
                previous.attachment_name,
                previous.content_type,
                previous.content_hash,
                previous.storage_path,
                previous.resume_id,
                now,
            ],
        )?;
        Ok(changed > 0)
    })
}

/// Writes the step and the artifacts committed with it in one statement.
///
/// Status returns to `pending` since a committed step is progress.
pub fn commit_step(db: &Database, item: &ItemRow, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE items SET step = ?2, status = ?3, attachment_id = ?4, attachment_name = ?5,
             content_type = ?6, content_hash = ?7, storage_path = ?8, resume_id = ?9,
             updated_at = ?10
             WHERE id = ?1",
            params![
                item.id,
                item.step.as_str(),
                item.status.as_str(),
                item.attachment_id,
                item.attachment_name,
                item.content_type,
                item.content_hash,
                item.storage_path,
                item.resume_id,
                now,
            ],
        )?;
        Ok(())
    })
}

/// Records an unhandled failure. The committed step is preserved.
pub fn record_failure(
    db: &Database,
    id: &str,
    error: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE items SET status = 'failed', attempts = attempts + 1, last_error = ?2,
             updated_at = ?3
             WHERE id = ?1",
            params![id, error, now],
        )?;
        Ok(())
    })
}

/// Marks an item as poisoned: step `failed_extract`, attempts forced to the
/// ceiling so it is never retried.
pub fn mark_poisoned(
    db: &Database,
    id: &str,
    error: &str,
    max_attempts: u32,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE items SET status = 'failed', step = 'failed_extract',
             attempts = MAX(attempts, ?3), last_error = ?2, updated_at = ?4
             WHERE id = ?1",
            params![id, error, max_attempts, now],
        )?;
        Ok(())
    })
}

/// Mirrors an enrichment job outcome onto every item of the resume.
pub fn update_enrichment_by_resume(
    db: &Database,
    resume_id: &str,
    status: EnrichmentStatus,
    retry_at: Option<&str>,
    error: Option<&str>,
    now: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE items SET enrichment_status = ?2, enrichment_retry_at = ?3,
             enrichment_error = ?4, updated_at = ?5
             WHERE resume_id = ?1",
            params![resume_id, status.as_str(), retry_at, error, now],
        )?;
        Ok(changed)
    })
}

/// Counts items of a run by outcome.
pub fn summary_for_run(db: &Database, run_id: &str) -> Result<ItemSummary, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN step = 'failed_extract' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN resume_id IS NOT NULL THEN 1 ELSE 0 END), 0)
             FROM items WHERE run_id = ?1",
            params![run_id],
            |r| {
                Ok(ItemSummary {
                    total: r.get(0)?,
                    pending: r.get(1)?,
                    completed: r.get(2)?,
                    failed: r.get(3)?,
                    poisoned: r.get(4)?,
                    with_resume: r.get(5)?,
                })
            },
        )?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_repo;
    use crate::db::{now_ts, resume_repo};

    fn setup() -> Database {
        let db = Database::open_in_memory().expect("Failed to create test database");
        run_repo::insert(
            &db,
            &run_repo::tests::sample_run("run-1", "2026-01-01T00:00:00.000000Z"),
        )
        .unwrap();
        db
    }

    fn new_item(message_id: &str) -> ItemRow {
        ItemRow::new(
            "run-1",
            message_id,
            Some("Application: Engineer".to_string()),
            Some("2026-01-01T10:00:00.000000Z".to_string()),
            &now_ts(),
        )
    }

    #[test]
    fn test_upsert_is_idempotent_and_keeps_progress() {
        let db = setup();
        let mut first = upsert(&db, &new_item("msg-1")).unwrap();
        first.step = ItemStep::Fetched;
        first.attachment_id = Some("att-1".to_string());
        commit_step(&db, &first, &now_ts()).unwrap();

        let again = upsert(&db, &new_item("msg-1")).unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.step, ItemStep::Fetched);
        assert_eq!(again.attachment_id.as_deref(), Some("att-1"));
        assert_eq!(find_by_run(&db, "run-1").unwrap().len(), 1);
    }

    #[test]
    fn test_find_resumable_picks_unfinished_item_of_same_mailbox() {
        let db = setup();
        let mut earlier = upsert(&db, &new_item("msg-1")).unwrap();
        earlier.step = ItemStep::Saved;
        earlier.attachment_id = Some("att-1".to_string());
        earlier.content_hash = Some("abc".to_string());
        commit_step(&db, &earlier, &now_ts()).unwrap();
        record_failure(&db, &earlier.id, "reset", &now_ts()).unwrap();

        run_repo::insert(
            &db,
            &run_repo::tests::sample_run("run-2", "2026-01-02T00:00:00.000000Z"),
        )
        .unwrap();
        let mut other_mailbox = run_repo::tests::sample_run("run-3", "2026-01-03T00:00:00.000000Z");
        other_mailbox.mailbox = "hr@example.com".to_string();
        run_repo::insert(&db, &other_mailbox).unwrap();

        let found = find_resumable(&db, "careers@example.com", "msg-1", "run-2")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, earlier.id);
        assert!(find_resumable(&db, "hr@example.com", "msg-1", "run-3")
            .unwrap()
            .is_none());
        assert!(find_resumable(&db, "careers@example.com", "msg-1", "run-1")
            .unwrap()
            .is_none());

        let fresh = upsert(
            &db,
            &ItemRow::new("run-2", "msg-1", None, None, &now_ts()),
        )
        .unwrap();
        assert!(adopt_progress(&db, &fresh.id, &found, &now_ts()).unwrap());
        let adopted = find_by_id(&db, &fresh.id).unwrap().unwrap();
        assert_eq!(adopted.step, ItemStep::Saved);
        assert_eq!(adopted.attachment_id.as_deref(), Some("att-1"));
        assert_eq!(adopted.content_hash.as_deref(), Some("abc"));
        assert_eq!(adopted.attempts, 0);
        assert_eq!(adopted.status, ItemStatus::Pending);

        // Only a fresh item takes over progress.
        assert!(!adopt_progress(&db, &fresh.id, &found, &now_ts()).unwrap());
    }

    #[test]
    fn test_completed_item_is_not_resumable() {
        let db = setup();
        let mut done = upsert(&db, &new_item("msg-1")).unwrap();
        done.step = ItemStep::Persisted;
        done.status = ItemStatus::Completed;
        commit_step(&db, &done, &now_ts()).unwrap();

        assert!(find_resumable(&db, "careers@example.com", "msg-1", "run-2")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_failure_preserves_step() {
        let db = setup();
        let mut item = upsert(&db, &new_item("msg-1")).unwrap();
        item.step = ItemStep::Saved;
        commit_step(&db, &item, &now_ts()).unwrap();

        record_failure(&db, &item.id, "download reset", &now_ts()).unwrap();
        let stored = find_by_id(&db, &item.id).unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Failed);
        assert_eq!(stored.step, ItemStep::Saved);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("download reset"));
    }

    #[test]
    fn test_poison_forces_attempt_ceiling() {
        let db = setup();
        let item = upsert(&db, &new_item("msg-1")).unwrap();
        mark_poisoned(&db, &item.id, "no text layer", 3, &now_ts()).unwrap();

        let stored = find_by_id(&db, &item.id).unwrap().unwrap();
        assert!(stored.is_poisoned());
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.status, ItemStatus::Failed);
    }

    #[test]
    fn test_enrichment_mirror_and_summary() {
        let db = setup();
        let resume = resume_repo::tests::sample_resume("hash-a", "msg-1");
        resume_repo::insert(&db, &resume).unwrap();

        let mut done = upsert(&db, &new_item("msg-1")).unwrap();
        done.step = ItemStep::Persisted;
        done.status = ItemStatus::Completed;
        done.resume_id = Some(resume.id.clone());
        commit_step(&db, &done, &now_ts()).unwrap();

        let failed = upsert(&db, &new_item("msg-2")).unwrap();
        mark_poisoned(&db, &failed.id, "no text layer", 3, &now_ts()).unwrap();
        upsert(&db, &new_item("msg-3")).unwrap();

        let changed = update_enrichment_by_resume(
            &db,
            &resume.id,
            EnrichmentStatus::Pending,
            Some("2026-01-01T11:00:00.000000Z"),
            Some("timeout"),
            &now_ts(),
        )
        .unwrap();
        assert_eq!(changed, 1);
        let mirrored = find_by_id(&db, &done.id).unwrap().unwrap();
        assert_eq!(mirrored.enrichment_status, Some(EnrichmentStatus::Pending));
        assert_eq!(mirrored.enrichment_error.as_deref(), Some("timeout"));

        let summary = summary_for_run(&db, "run-1").unwrap();
        assert_eq!(
            summary,
            ItemSummary {
                total: 3,
                pending: 1,
                completed: 1,
                failed: 1,
                poisoned: 1,
                with_resume: 1,
            }
        );
    }

    #[test]
    fn test_step_ordering() {
        assert!(ItemStep::None < ItemStep::Fetched);
        assert!(ItemStep::Uploaded < ItemStep::Parsed);
        assert!(ItemStep::Persisted.is_terminal());
        assert_eq!("failed_extract".parse::<ItemStep>().unwrap(), ItemStep::FailedExtract);
    }
}
