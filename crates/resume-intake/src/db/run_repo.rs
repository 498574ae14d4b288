//! Run repository: operations on the `runs` table.
//!
//! Every status write is a conditional update. A Run in a terminal state
//! (succeeded, failed, canceled) is never modified again.

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, OptionalExtension, Row};

use crate::search::SearchMode;

use super::{parse_column, Database, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Enqueued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Enqueued,
        RunStatus::Running,
        RunStatus::Succeeded,
        RunStatus::Failed,
        RunStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Enqueued => "enqueued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown run status '{}'", s))
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: String,
    pub mailbox: String,
    pub job_id: String,
    pub search_text: Option<String>,
    pub mode: SearchMode,
    pub lookback_days: u32,
    pub status: RunStatus,
    pub attempts: u32,
    pub total_messages: i64,
    pub processed_messages: i64,
    pub last_error: Option<String>,
    pub enqueued_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            mailbox: row.get("mailbox")?,
            job_id: row.get("job_id")?,
            search_text: row.get("search_text")?,
            mode: parse_column(row, "mode")?,
            lookback_days: row.get("lookback_days")?,
            status: parse_column(row, "status")?,
            attempts: row.get("attempts")?,
            total_messages: row.get("total_messages")?,
            processed_messages: row.get("processed_messages")?,
            last_error: row.get("last_error")?,
            enqueued_at: row.get("enqueued_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new run row.
pub fn insert(db: &Database, run: &RunRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO runs (id, mailbox, job_id, search_text, mode, lookback_days, status,
             attempts, total_messages, processed_messages, last_error, enqueued_at, started_at,
             finished_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                run.id,
                run.mailbox,
                run.job_id,
                run.search_text,
                run.mode.as_str(),
                run.lookback_days,
                run.status.as_str(),
                run.attempts,
                run.total_messages,
                run.processed_messages,
                run.last_error,
                run.enqueued_at,
                run.started_at,
                run.finished_at,
                run.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a run by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM runs WHERE id = ?1",
                params![id],
                RunRow::from_row,
            )
            .optional()?)
    })
}

/// Returns only the status of a run; used by cancellation checks.
pub fn status_of(db: &Database, id: &str) -> Result<Option<RunStatus>, DatabaseError> {
    db.with_conn(|conn| {
        let raw: Option<String> = conn
            .query_row(
                "SELECT status FROM runs WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|s| {
            s.parse::<RunStatus>()
                .map_err(|reason| DatabaseError::InvalidValue {
                    column: "status".to_string(),
                    reason,
                })
        })
        .transpose()
    })
}

/// Oldest enqueued run by enqueue time; insertion order breaks ties.
pub fn find_oldest_enqueued(db: &Database) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM runs WHERE status = 'enqueued'
                 ORDER BY enqueued_at ASC, rowid ASC LIMIT 1",
                [],
                RunRow::from_row,
            )
            .optional()?)
    })
}

/// The currently running run, if any.
pub fn find_running(db: &Database) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM runs WHERE status = 'running' ORDER BY started_at LIMIT 1",
                [],
                RunRow::from_row,
            )
            .optional()?)
    })
}

/// Lists runs with the given status in FIFO order.
pub fn find_by_status(db: &Database, status: RunStatus) -> Result<Vec<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM runs WHERE status = ?1 ORDER BY enqueued_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![status.as_str()], RunRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Compare-and-swap promotion: `enqueued -> running`, only if the run is
/// still enqueued and no other run is running. Returns false when the race
/// was lost; the run is left untouched in that case.
pub fn try_promote(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE runs SET status = 'running', attempts = attempts + 1,
             started_at = ?2, updated_at = ?2, last_error = NULL
             WHERE id = ?1 AND status = 'enqueued'
               AND NOT EXISTS (SELECT 1 FROM runs WHERE status = 'running')",
            params![id, now],
        )?;
        Ok(changed == 1)
    })
}

/// Records the number of candidate messages a run will examine and resets
/// the processed counter for this attempt.
pub fn set_total_messages(
    db: &Database,
    id: &str,
    total: i64,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE runs SET total_messages = ?2, processed_messages = 0, updated_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id, total, now],
        )?;
        Ok(())
    })
}

pub fn increment_processed(db: &Database, id: &str, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE runs SET processed_messages = processed_messages + 1, updated_at = ?2
             WHERE id = ?1 AND status = 'running'",
            params![id, now],
        )?;
        Ok(())
    })
}

/// Moves a running run to a terminal status. Returns false if the run was
/// no longer running (canceled by an operator meanwhile).
pub fn finish(
    db: &Database,
    id: &str,
    status: RunStatus,
    last_error: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    debug_assert!(status.is_terminal());
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE runs SET status = ?2, last_error = ?3, finished_at = ?4, updated_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![id, status.as_str(), last_error, now],
        )?;
        Ok(changed == 1)
    })
}

/// Fails a run straight from `enqueued` (invalid data discovered before it
/// could start).
pub fn reject(db: &Database, id: &str, last_error: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE runs SET status = 'failed', last_error = ?2, finished_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'enqueued'",
            params![id, last_error, now],
        )?;
        Ok(changed == 1)
    })
}

/// Returns a running run to the queue, keeping its original enqueue time so
/// it stays at the head of the FIFO.
pub fn requeue(
    db: &Database,
    id: &str,
    last_error: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE runs SET status = 'enqueued', last_error = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id, last_error, now],
        )?;
        Ok(changed == 1)
    })
}

/// Operator cancellation. Only non-terminal runs can be canceled.
pub fn cancel(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE runs SET status = 'canceled', finished_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status IN ('enqueued', 'running')",
            params![id, now],
        )?;
        Ok(changed == 1)
    })
}

/// Number of runs per status.
pub fn counts_by_status(db: &Database) -> Result<Vec<(RunStatus, i64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM runs GROUP BY status")?;
        let raw = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(status, count)| {
                status
                    .parse::<RunStatus>()
                    .map(|s| (s, count))
                    .map_err(|reason| DatabaseError::InvalidValue {
                        column: "status".to_string(),
                        reason,
                    })
            })
            .collect()
    })
}
