//! Job application repository: links between a job posting and a resume.

use rusqlite::{params, OptionalExtension};

use super::{is_unique_violation, Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct JobApplicationRow {
    pub id: String,
    pub job_id: String,
    pub resume_id: String,
    pub created_at: String,
}

/// Outcome of [`link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    AlreadyLinked,
}

/// Creates the job/resume link. A duplicate key means the pair is already
/// linked and is not an error.
pub fn link(
    db: &Database,
    job_id: &str,
    resume_id: &str,
    now: &str,
) -> Result<LinkOutcome, DatabaseError> {
    let id = uuid::Uuid::new_v4().to_string();
    let result = db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO job_applications (id, job_id, resume_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, job_id, resume_id, now],
        )?;
        Ok(())
    });

    match result {
        Ok(()) => Ok(LinkOutcome::Created),
        Err(DatabaseError::Sqlite(e)) if is_unique_violation(&e) => {
            log::debug!("Resume {} already linked to job {}", resume_id, job_id);
            Ok(LinkOutcome::AlreadyLinked)
        }
        Err(e) => Err(e),
    }
}

pub fn find(
    db: &Database,
    job_id: &str,
    resume_id: &str,
) -> Result<Option<JobApplicationRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT id, job_id, resume_id, created_at FROM job_applications
                 WHERE job_id = ?1 AND resume_id = ?2",
                params![job_id, resume_id],
                |row| {
                    Ok(JobApplicationRow {
                        id: row.get(0)?,
                        job_id: row.get(1)?,
                        resume_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?)
    })
}

pub fn count_for_job(db: &Database, job_id: &str) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM job_applications WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?)
    })
}
