//! Enrichment job repository.
//!
//! One job per (resume, job posting). Workers claim jobs with a conditional
//! `pending -> running` update so a job is never processed twice at once.

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, OptionalExtension, Row};

use super::{parse_column, Database, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnrichmentStatus {
    Pending,
    Running,
    Succeeded,
    IngestFailed,
    ScanFailed,
    Error,
}

impl EnrichmentStatus {
    pub const ALL: [EnrichmentStatus; 6] = [
        EnrichmentStatus::Pending,
        EnrichmentStatus::Running,
        EnrichmentStatus::Succeeded,
        EnrichmentStatus::IngestFailed,
        EnrichmentStatus::ScanFailed,
        EnrichmentStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Running => "running",
            EnrichmentStatus::Succeeded => "succeeded",
            EnrichmentStatus::IngestFailed => "ingest_failed",
            EnrichmentStatus::ScanFailed => "scan_failed",
            EnrichmentStatus::Error => "error",
        }
    }

    /// Failed states that a later enqueue revives.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EnrichmentStatus::IngestFailed | EnrichmentStatus::ScanFailed | EnrichmentStatus::Error
        )
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnrichmentStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown enrichment status '{}'", s))
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentJobRow {
    pub id: String,
    pub resume_id: String,
    pub job_id: String,
    pub run_id: Option<String>,
    pub status: EnrichmentStatus,
    pub attempts: u32,
    pub next_retry_at: String,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl EnrichmentJobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            resume_id: row.get("resume_id")?,
            job_id: row.get("job_id")?,
            run_id: row.get("run_id")?,
            status: parse_column(row, "status")?,
            attempts: row.get("attempts")?,
            next_retry_at: row.get("next_retry_at")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Result of an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new pending job was created.
    Queued,
    /// A failed job was reset to pending.
    Revived,
    /// The job was already pending; its schedule is left alone.
    AlreadyPending,
    /// A worker currently holds the job.
    InFlight,
    /// The job already succeeded.
    Skipped,
}

impl EnqueueOutcome {
    /// True when the job is now due and a worker should be woken.
    pub fn is_due_now(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued | EnqueueOutcome::Revived)
    }
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<EnrichmentJobRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM enrichment_jobs WHERE id = ?1",
                params![id],
                EnrichmentJobRow::from_row,
            )
            .optional()?)
    })
}

pub fn find_by_resume_and_job(
    db: &Database,
    resume_id: &str,
    job_id: &str,
) -> Result<Option<EnrichmentJobRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM enrichment_jobs WHERE resume_id = ?1 AND job_id = ?2",
                params![resume_id, job_id],
                EnrichmentJobRow::from_row,
            )
            .optional()?)
    })
}

/// Creates the job, or revives a failed one to pending with
/// `next_retry_at = now`. Succeeded and in-flight jobs are left unchanged.
pub fn enqueue(
    db: &Database,
    resume_id: &str,
    job_id: &str,
    run_id: Option<&str>,
    now: &str,
) -> Result<EnqueueOutcome, DatabaseError> {
    db.with_conn(|conn| {
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, status FROM enrichment_jobs WHERE resume_id = ?1 AND job_id = ?2",
                params![resume_id, job_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let Some((id, raw_status)) = existing else {
            conn.execute(
                "INSERT INTO enrichment_jobs (id, resume_id, job_id, run_id, status, attempts,
                 next_retry_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5, ?5)",
                params![uuid::Uuid::new_v4().to_string(), resume_id, job_id, run_id, now],
            )?;
            return Ok(EnqueueOutcome::Queued);
        };

        let status = raw_status
            .parse::<EnrichmentStatus>()
            .map_err(|reason| DatabaseError::InvalidValue {
                column: "status".to_string(),
                reason,
            })?;

        match status {
            EnrichmentStatus::Succeeded => Ok(EnqueueOutcome::Skipped),
            EnrichmentStatus::Running => Ok(EnqueueOutcome::InFlight),
            EnrichmentStatus::Pending => Ok(EnqueueOutcome::AlreadyPending),
            EnrichmentStatus::IngestFailed
            | EnrichmentStatus::ScanFailed
            | EnrichmentStatus::Error => {
                conn.execute(
                    "UPDATE enrichment_jobs SET status = 'pending', attempts = 0,
                     next_retry_at = ?2, last_error = NULL, run_id = COALESCE(?3, run_id),
                     updated_at = ?2
                     WHERE id = ?1",
                    params![id, now, run_id],
                )?;
                Ok(EnqueueOutcome::Revived)
            }
        }
    })
}

/// Pending jobs whose retry time has passed, oldest schedule first.
pub fn find_due(
    db: &Database,
    now: &str,
    limit: u32,
) -> Result<Vec<EnrichmentJobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM enrichment_jobs WHERE status = 'pending' AND next_retry_at <= ?1
             ORDER BY next_retry_at ASC, rowid ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![now, limit], EnrichmentJobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Claims a pending job for a worker. Returns false if another worker won.
pub fn try_claim(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE enrichment_jobs SET status = 'running', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        Ok(changed == 1)
    })
}

pub fn mark_succeeded(db: &Database, id: &str, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE enrichment_jobs SET status = 'succeeded', attempts = attempts + 1,
             last_error = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'running'",
            params![id, now],
        )?;
        Ok(())
    })
}

/// Returns a running job to pending with a later retry time.
pub fn schedule_retry(
    db: &Database,
    id: &str,
    next_retry_at: &str,
    error: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE enrichment_jobs SET status = 'pending', attempts = attempts + 1,
             next_retry_at = ?2, last_error = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![id, next_retry_at, error, now],
        )?;
        Ok(())
    })
}

/// Moves a running job to a failed terminal status.
pub fn mark_failed(
    db: &Database,
    id: &str,
    status: EnrichmentStatus,
    error: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    debug_assert!(status.is_failure());
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE enrichment_jobs SET status = ?2, attempts = attempts + 1, last_error = ?3,
             updated_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![id, status.as_str(), error, now],
        )?;
        Ok(())
    })
}

/// Returns jobs stuck in `running` since before `older_than` to pending,
/// due immediately. Used after a worker crash.
pub fn release_stale(db: &Database, older_than: &str, now: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE enrichment_jobs SET status = 'pending', next_retry_at = ?2, updated_at = ?2
             WHERE status = 'running' AND updated_at < ?1",
            params![older_than, now],
        )?;
        if changed > 0 {
            log::info!("Released {} stale enrichment jobs", changed);
        }
        Ok(changed)
    })
}

pub fn counts_by_status(db: &Database) -> Result<Vec<(EnrichmentStatus, i64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM enrichment_jobs GROUP BY status")?;
        let raw = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(status, count)| {
                status
                    .parse::<EnrichmentStatus>()
                    .map(|s| (s, count))
                    .map_err(|reason| DatabaseError::InvalidValue {
                        column: "status".to_string(),
                        reason,
                    })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{now_ts, resume_repo};

    fn setup() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let resume = resume_repo::tests::sample_resume("hash-a", "msg-1");
        resume_repo::insert(&db, &resume).unwrap();
        (db, resume.id)
    }

    fn claim_and(db: &Database, resume_id: &str, f: impl FnOnce(&str)) -> EnrichmentJobRow {
        let job = find_by_resume_and_job(db, resume_id, "job-42").unwrap().unwrap();
        assert!(try_claim(db, &job.id, &now_ts()).unwrap());
        f(&job.id);
        find_by_id(db, &job.id).unwrap().unwrap()
    }

    #[test]
    fn test_enqueue_creates_due_job() {
        let (db, resume_id) = setup();
        let now = now_ts();
        assert_eq!(
            enqueue(&db, &resume_id, "job-42", Some("run-1"), &now).unwrap(),
            EnqueueOutcome::Queued
        );
        let due = find_due(&db, &now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, EnrichmentStatus::Pending);
        assert_eq!(due[0].run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn test_enqueue_skips_succeeded() {
        let (db, resume_id) = setup();
        enqueue(&db, &resume_id, "job-42", None, &now_ts()).unwrap();
        claim_and(&db, &resume_id, |id| mark_succeeded(&db, id, &now_ts()).unwrap());

        assert_eq!(
            enqueue(&db, &resume_id, "job-42", None, &now_ts()).unwrap(),
            EnqueueOutcome::Skipped
        );
    }

    #[test]
    fn test_enqueue_revives_failed() {
        let (db, resume_id) = setup();
        enqueue(&db, &resume_id, "job-42", None, &now_ts()).unwrap();
        let failed = claim_and(&db, &resume_id, |id| {
            mark_failed(&db, id, EnrichmentStatus::ScanFailed, "scanner down", &now_ts()).unwrap()
        });
        assert_eq!(failed.status, EnrichmentStatus::ScanFailed);

        let now = now_ts();
        assert_eq!(
            enqueue(&db, &resume_id, "job-42", Some("run-2"), &now).unwrap(),
            EnqueueOutcome::Revived
        );
        let revived = find_by_id(&db, &failed.id).unwrap().unwrap();
        assert_eq!(revived.status, EnrichmentStatus::Pending);
        assert_eq!(revived.attempts, 0);
        assert_eq!(revived.next_retry_at, now);
        assert!(revived.last_error.is_none());
        assert_eq!(revived.run_id.as_deref(), Some("run-2"));
    }

    #[test]
    fn test_enqueue_leaves_running_alone() {
        let (db, resume_id) = setup();
        enqueue(&db, &resume_id, "job-42", None, &now_ts()).unwrap();
        let job = claim_and(&db, &resume_id, |_| {});
        assert_eq!(
            enqueue(&db, &resume_id, "job-42", None, &now_ts()).unwrap(),
            EnqueueOutcome::InFlight
        );
        assert_eq!(find_by_id(&db, &job.id).unwrap().unwrap().status, EnrichmentStatus::Running);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (db, resume_id) = setup();
        enqueue(&db, &resume_id, "job-42", None, &now_ts()).unwrap();
        let job = find_by_resume_and_job(&db, &resume_id, "job-42").unwrap().unwrap();
        assert!(try_claim(&db, &job.id, &now_ts()).unwrap());
        assert!(!try_claim(&db, &job.id, &now_ts()).unwrap());
    }

    #[test]
    fn test_retry_is_not_due_until_scheduled() {
        let (db, resume_id) = setup();
        enqueue(&db, &resume_id, "job-42", None, "2026-01-01T00:00:00.000000Z").unwrap();
        let job = claim_and(&db, &resume_id, |id| {
            schedule_retry(
                &db,
                id,
                "2026-01-01T00:10:00.000000Z",
                "timeout",
                "2026-01-01T00:00:01.000000Z",
            )
            .unwrap()
        });
        assert_eq!(job.attempts, 1);
        assert!(find_due(&db, "2026-01-01T00:05:00.000000Z", 10).unwrap().is_empty());
        assert_eq!(find_due(&db, "2026-01-01T00:10:00.000000Z", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_release_stale() {
        let (db, resume_id) = setup();
        enqueue(&db, &resume_id, "job-42", None, "2026-01-01T00:00:00.000000Z").unwrap();
        let job = find_by_resume_and_job(&db, &resume_id, "job-42").unwrap().unwrap();
        try_claim(&db, &job.id, "2026-01-01T00:00:00.000000Z").unwrap();

        assert_eq!(
            release_stale(&db, "2025-12-31T00:00:00.000000Z", "2026-01-01T01:00:00.000000Z")
                .unwrap(),
            0
        );
        assert_eq!(
            release_stale(&db, "2026-01-01T00:30:00.000000Z", "2026-01-01T01:00:00.000000Z")
                .unwrap(),
            1
        );
        let released = find_by_id(&db, &job.id).unwrap().unwrap();
        assert_eq!(released.status, EnrichmentStatus::Pending);
        assert_eq!(counts_by_status(&db).unwrap(), vec![(EnrichmentStatus::Pending, 1)]);
    }
}
