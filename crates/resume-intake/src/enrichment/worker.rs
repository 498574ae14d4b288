use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::EnrichmentConfig;
use crate::db::enrichment_repo::{self, EnrichmentJobRow, EnrichmentStatus};
use crate::db::{format_ts, now_ts, Database, DatabaseError};
use crate::sanitize::truncate_error;

use super::backoff::retry_delay;
use super::enricher::{Enricher, EnrichmentRequest};
use super::error::{EnrichmentError, FailurePhase};
use super::queue::{mirror_job, EnrichmentQueue};

/// How often the idle loop re-checks the shutdown flag.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Result of one claimed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded { job_id: String },
    Retrying { job_id: String, next_retry_at: String },
    Failed { job_id: String, status: EnrichmentStatus },
    /// Another worker claimed the job first.
    Lost { job_id: String },
}

/// Consumes due enrichment jobs with bounded concurrency.
pub struct EnrichmentWorker {
    db: Database,
    enricher: Arc<dyn Enricher>,
    config: EnrichmentConfig,
    timeout: Duration,
}

impl EnrichmentWorker {
    pub fn new(queue: &EnrichmentQueue, enricher: Arc<dyn Enricher>, config: EnrichmentConfig) -> Self {
        let timeout = config.timeout();
        Self {
            db: queue.db().clone(),
            enricher,
            config,
            timeout,
        }
    }

    /// Overrides the per-call hard timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Processes one batch of due jobs.
    pub async fn run_due(&self) -> Result<Vec<AttemptOutcome>, DatabaseError> {
        let due = enrichment_repo::find_due(&self.db, &now_ts(), self.config.batch_size)?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(count = due.len(), "Due enrichment jobs");

        stream::iter(due.into_iter().map(|job| self.attempt(job)))
            .buffer_unordered(self.config.concurrency.max(1))
            .try_collect()
            .await
    }

    /// Polls until `shutdown` is set. A message on `wake` cuts the wait short.
    pub async fn run(&self, mut wake: Option<mpsc::Receiver<()>>, shutdown: Arc<AtomicBool>) {
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs);
        tracing::info!(
            concurrency = self.config.concurrency,
            poll_secs = self.config.poll_interval_secs,
            "Enrichment worker started"
        );

        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.run_due().await {
                tracing::error!(error = %e, "Enrichment batch failed");
            }

            let mut waited = Duration::ZERO;
            while waited < poll_interval && !shutdown.load(Ordering::Relaxed) {
                let slice = SHUTDOWN_CHECK_INTERVAL.min(poll_interval - waited);
                match wake.as_mut() {
                    Some(rx) => match tokio::time::timeout(slice, rx.recv()).await {
                        Ok(Some(())) => break,
                        // Every queue handle is gone; fall back to plain polling.
                        Ok(None) => wake = None,
                        Err(_) => {}
                    },
                    None => tokio::time::sleep(slice).await,
                }
                waited += slice;
            }
        }

        tracing::info!("Enrichment worker stopped");
    }

    async fn attempt(&self, job: EnrichmentJobRow) -> Result<AttemptOutcome, DatabaseError> {
        let span = tracing::info_span!(
            "enrichment",
            job = %job.id,
            resume_id = %job.resume_id,
            attempt = job.attempts + 1
        );
        self.attempt_inner(job).instrument(span).await
    }

    async fn attempt_inner(&self, job: EnrichmentJobRow) -> Result<AttemptOutcome, DatabaseError> {
        if !enrichment_repo::try_claim(&self.db, &job.id, &now_ts())? {
            return Ok(AttemptOutcome::Lost { job_id: job.id });
        }

        let request = EnrichmentRequest {
            resume_id: job.resume_id.clone(),
            job_id: job.job_id.clone(),
            run_id: job.run_id.clone(),
            timeout: self.timeout,
        };
        let result = match tokio::time::timeout(self.timeout, self.enricher.enrich(&request)).await {
            Ok(result) => result,
            Err(_) => Err(EnrichmentError::Timeout(self.timeout)),
        };

        let attempts = job.attempts + 1;
        let outcome = match result {
            Ok(()) => {
                enrichment_repo::mark_succeeded(&self.db, &job.id, &now_ts())?;
                tracing::info!("Enrichment succeeded");
                AttemptOutcome::Succeeded {
                    job_id: job.id.clone(),
                }
            }
            Err(e) if e.is_retryable() && attempts < self.config.max_attempts => {
                let delay = retry_delay(
                    attempts,
                    Duration::from_secs(self.config.backoff_base_secs),
                    Duration::from_secs(self.config.backoff_max_secs),
                );
                let next_retry_at = format_ts(
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
                );
                enrichment_repo::schedule_retry(
                    &self.db,
                    &job.id,
                    &next_retry_at,
                    &truncate_error(&e.to_string()),
                    &now_ts(),
                )?;
                tracing::warn!(error = %e, next_retry_at = %next_retry_at, "Enrichment failed, retrying");
                AttemptOutcome::Retrying {
                    job_id: job.id.clone(),
                    next_retry_at,
                }
            }
            Err(e) => {
                let status = terminal_status(&e);
                enrichment_repo::mark_failed(
                    &self.db,
                    &job.id,
                    status,
                    &truncate_error(&e.to_string()),
                    &now_ts(),
                )?;
                tracing::error!(error = %e, status = status.as_str(), "Enrichment failed");
                AttemptOutcome::Failed {
                    job_id: job.id.clone(),
                    status,
                }
            }
        };

        if let Some(updated) = enrichment_repo::find_by_id(&self.db, &job.id)? {
            mirror_job(&self.db, &updated)?;
        }
        Ok(outcome)
    }
}

/// Status for a job that will not be retried. Exhausted retryable failures
/// are attributed to the phase that failed.
fn terminal_status(error: &EnrichmentError) -> EnrichmentStatus {
    if !error.is_retryable() {
        return EnrichmentStatus::Error;
    }
    match error.phase() {
        Some(FailurePhase::Scan) => EnrichmentStatus::ScanFailed,
        Some(FailurePhase::Ingest) | None => EnrichmentStatus::IngestFailed,
    }
}
