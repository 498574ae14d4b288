//! Resume repository: at most one row per (content hash, source message id).

use rusqlite::{params, OptionalExtension, Row};

use super::{is_unique_violation, Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct ResumeRow {
    pub id: String,
    pub content_hash: String,
    pub source_message_id: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub storage_path: String,
    pub raw_text: Option<String>,
    pub parsed_at: Option<String>,
    pub created_at: String,
}

impl ResumeRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            content_hash: row.get("content_hash")?,
            source_message_id: row.get("source_message_id")?,
            filename: row.get("filename")?,
            content_type: row.get("content_type")?,
            storage_path: row.get("storage_path")?,
            raw_text: row.get("raw_text")?,
            parsed_at: row.get("parsed_at")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert(db: &Database, resume: &ResumeRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO resumes (id, content_hash, source_message_id, filename, content_type,
             storage_path, raw_text, parsed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                resume.id,
                resume.content_hash,
                resume.source_message_id,
                resume.filename,
                resume.content_type,
                resume.storage_path,
                resume.raw_text,
                resume.parsed_at,
                resume.created_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ResumeRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM resumes WHERE id = ?1",
                params![id],
                ResumeRow::from_row,
            )
            .optional()?)
    })
}

/// Exact dedup lookup on (content hash, source message id).
pub fn find_by_hash_and_message(
    db: &Database,
    content_hash: &str,
    source_message_id: &str,
) -> Result<Option<ResumeRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM resumes WHERE content_hash = ?1 AND source_message_id = ?2",
                params![content_hash, source_message_id],
                ResumeRow::from_row,
            )
            .optional()?)
    })
}

/// Inserts the resume, or returns the row already stored for its
/// (hash, message id). The boolean is true when a new row was created.
pub fn get_or_create(db: &Database, resume: &ResumeRow) -> Result<(ResumeRow, bool), DatabaseError> {
    match insert(db, resume) {
        Ok(()) => Ok((resume.clone(), true)),
        Err(DatabaseError::Sqlite(e)) if is_unique_violation(&e) => {
            let existing =
                find_by_hash_and_message(db, &resume.content_hash, &resume.source_message_id)?
                    .ok_or_else(|| DatabaseError::NotFound {
                        entity: "resume",
                        id: format!("{}:{}", resume.content_hash, resume.source_message_id),
                    })?;
            log::debug!(
                "Resume for hash {} already exists as {}",
                resume.content_hash,
                existing.id
            );
            Ok((existing, false))
        }
        Err(e) => Err(e),
    }
}

/// Stores extracted text (or an extraction sentinel) and the parse time.
pub fn set_text(
    db: &Database,
    id: &str,
    raw_text: &str,
    parsed_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE resumes SET raw_text = ?2, parsed_at = ?3 WHERE id = ?1",
            params![id, raw_text, parsed_at],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "resume",
                id: id.to_string(),
            });
        }
        Ok(())
    })
}

/// Number of resumes sharing a content hash across all messages.
pub fn count_by_hash(db: &Database, content_hash: &str) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM resumes WHERE content_hash = ?1",
            params![content_hash],
            |r| r.get(0),
        )?)
    })
}
