use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::db::enrichment_repo::{self, EnqueueOutcome, EnrichmentJobRow};
use crate::db::{format_ts, item_repo, now_ts, Database, DatabaseError};

/// Producer side of the enrichment handoff.
///
/// Jobs are durable rows; the optional channel only wakes an idle worker
/// early when a job becomes due now.
#[derive(Clone)]
pub struct EnrichmentQueue {
    db: Database,
    wake: Option<mpsc::Sender<()>>,
}

impl EnrichmentQueue {
    pub fn new(db: Database) -> Self {
        Self { db, wake: None }
    }

    /// Queue plus the receiver a worker listens on.
    pub fn with_wake(db: Database, capacity: usize) -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { db, wake: Some(tx) }, rx)
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Creates the job or revives a failed one; a succeeded job is skipped.
    pub fn enqueue(
        &self,
        resume_id: &str,
        job_id: &str,
        run_id: Option<&str>,
    ) -> Result<EnqueueOutcome, DatabaseError> {
        let outcome = enrichment_repo::enqueue(&self.db, resume_id, job_id, run_id, &now_ts())?;
        tracing::debug!(resume_id, job_id, ?outcome, "Enrichment enqueue");
        if outcome.is_due_now() {
            self.notify();
        }
        Ok(outcome)
    }

    /// Copies the job's status, retry time and error onto every item of the
    /// resume.
    pub fn mirror(&self, resume_id: &str, job_id: &str) -> Result<(), DatabaseError> {
        if let Some(job) = enrichment_repo::find_by_resume_and_job(&self.db, resume_id, job_id)? {
            mirror_job(&self.db, &job)?;
        }
        Ok(())
    }

    /// Returns jobs stuck in `running` longer than `stale_after` to pending.
    pub fn release_stale(&self, stale_after: Duration) -> Result<usize, DatabaseError> {
        let age = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        let released = enrichment_repo::release_stale(
            &self.db,
            &format_ts(Utc::now() - age),
            &now_ts(),
        )?;
        if released > 0 {
            self.notify();
        }
        Ok(released)
    }

    fn notify(&self) {
        if let Some(tx) = &self.wake {
            // A full channel already holds a pending wake-up.
            let _ = tx.try_send(());
        }
    }
}

pub(crate) fn mirror_job(db: &Database, job: &EnrichmentJobRow) -> Result<(), DatabaseError> {
    let retry_at = matches!(job.status, enrichment_repo::EnrichmentStatus::Pending)
        .then_some(job.next_retry_at.as_str());
    item_repo::update_enrichment_by_resume(
        db,
        &job.resume_id,
        job.status,
        retry_at,
        job.last_error.as_deref(),
        &now_ts(),
    )?;
    Ok(())
}
