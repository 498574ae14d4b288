//! Run lifecycle: FIFO queue, single active run, execution and recovery.

pub mod error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use tracing::Instrument;

use crate::config::CoordinatorConfig;
use crate::db::item_repo::{self, ItemRow, ItemStep};
use crate::db::run_repo::{self, RunRow, RunStatus};
use crate::db::{format_ts, now_ts, Database, DatabaseError};
use crate::pipeline::{ItemOutcome, ItemPipeline, ProgressEvent, ProgressReporter, RunScope};
use crate::sanitize::truncate_error;
use crate::search::{
    CancelSignal, RunCancelSignal, SearchError, SearchMode, SearchOrchestrator, SearchRequest,
};

pub use error::{validate_job_reference, validate_mailbox, CoordinatorError};

const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(250);

const INTERRUPTED_ERROR: &str = "Run interrupted by shutdown or crash";

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub mailbox: String,
    pub job_id: String,
    pub query: Option<String>,
    pub mode: SearchMode,
    /// Falls back to the search config when unset.
    pub lookback_days: Option<u32>,
}

/// Validates and records a new run at the back of the queue.
pub fn enqueue_run(
    db: &Database,
    request: EnqueueRequest,
    default_lookback_days: u32,
) -> Result<RunRow, CoordinatorError> {
    validate_mailbox(&request.mailbox)?;
    validate_job_reference(&request.job_id)?;

    let now = now_ts();
    let run = RunRow {
        id: uuid::Uuid::new_v4().to_string(),
        mailbox: request.mailbox.trim().to_string(),
        job_id: request.job_id,
        search_text: request.query.filter(|q| !q.trim().is_empty()),
        mode: request.mode,
        lookback_days: request.lookback_days.unwrap_or(default_lookback_days),
        status: RunStatus::Enqueued,
        attempts: 0,
        total_messages: 0,
        processed_messages: 0,
        last_error: None,
        enqueued_at: now.clone(),
        started_at: None,
        finished_at: None,
        updated_at: now,
    };
    run_repo::insert(db, &run)?;
    tracing::info!(run_id = %run.id, job_id = %run.job_id, mode = %run.mode, "Run enqueued");
    Ok(run)
}

/// Cancels an enqueued or running run. Returns false if it was already
/// terminal.
pub fn cancel_run(db: &Database, run_id: &str) -> Result<bool, CoordinatorError> {
    if run_repo::status_of(db, run_id)?.is_none() {
        return Err(CoordinatorError::NotFound(run_id.to_string()));
    }
    let canceled = run_repo::cancel(db, run_id, &now_ts())?;
    if canceled {
        tracing::info!(run_id, "Run canceled");
    }
    Ok(canceled)
}

pub struct RunCoordinator {
    db: Database,
    search: SearchOrchestrator,
    pipeline: ItemPipeline,
    config: CoordinatorConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl RunCoordinator {
    pub fn new(
        db: Database,
        search: SearchOrchestrator,
        pipeline: ItemPipeline,
        config: CoordinatorConfig,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            db,
            search,
            pipeline,
            config,
            progress,
        }
    }

    pub fn enqueue(&self, request: EnqueueRequest) -> Result<RunRow, CoordinatorError> {
        enqueue_run(&self.db, request, self.search.config().lookback_days)
    }

    pub fn cancel(&self, run_id: &str) -> Result<bool, CoordinatorError> {
        cancel_run(&self.db, run_id)
    }

    /// Promotes the oldest enqueued run unless another run is active.
    ///
    /// A run whose job reference is invalid is failed here and the next one
    /// is considered.
    pub fn promote_next(&self) -> Result<Option<RunRow>, CoordinatorError> {
        loop {
            let Some(candidate) = run_repo::find_oldest_enqueued(&self.db)? else {
                return Ok(None);
            };

            if let Err(e) = validate_job_reference(&candidate.job_id) {
                tracing::error!(run_id = %candidate.id, error = %e, "Rejecting run");
                run_repo::reject(&self.db, &candidate.id, &truncate_error(&e.to_string()), &now_ts())?;
                continue;
            }

            if !run_repo::try_promote(&self.db, &candidate.id, &now_ts())? {
                return Ok(None);
            }
            return Ok(run_repo::find_by_id(&self.db, &candidate.id)?);
        }
    }

    /// Returns runs left `running` by a dead process to the queue, or fails
    /// them once their attempts are used up.
    pub fn recover_interrupted(&self) -> Result<usize, CoordinatorError> {
        let running = run_repo::find_by_status(&self.db, RunStatus::Running)?;
        for run in &running {
            if run.attempts >= self.config.max_run_attempts {
                run_repo::finish(&self.db, &run.id, RunStatus::Failed, Some(INTERRUPTED_ERROR), &now_ts())?;
                tracing::warn!(run_id = %run.id, attempts = run.attempts, "Interrupted run failed");
            } else {
                run_repo::requeue(&self.db, &run.id, Some(INTERRUPTED_ERROR), &now_ts())?;
                tracing::info!(run_id = %run.id, "Interrupted run re-enqueued");
            }
        }
        Ok(running.len())
    }

    /// Promotes and executes at most one run. Returns the status the run
    /// ended in, or `None` if nothing was promoted.
    pub async fn tick(&self) -> Result<Option<RunStatus>, CoordinatorError> {
        let Some(run) = self.promote_next()? else {
            return Ok(None);
        };

        match self.execute(&run).await {
            Ok(status) => Ok(Some(status)),
            Err(e) => {
                // Free the single running slot before surfacing the error.
                let message = truncate_error(&e.to_string());
                run_repo::finish(&self.db, &run.id, RunStatus::Failed, Some(&message), &now_ts())?;
                self.report_finished(&run.id)?;
                Err(e.into())
            }
        }
    }

    /// Runs [`tick`](Self::tick) until `shutdown` is set.
    pub async fn run_loop(&self, shutdown: Arc<AtomicBool>) {
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs);
        tracing::info!(poll_secs = self.config.poll_interval_secs, "Run coordinator started");

        while !shutdown.load(Ordering::Relaxed) {
            match self.tick().await {
                // Check for the next queued run straight away.
                Ok(Some(status)) if status.is_terminal() => continue,
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Run execution failed"),
            }

            let mut waited = Duration::ZERO;
            while waited < poll_interval && !shutdown.load(Ordering::Relaxed) {
                let slice = SHUTDOWN_CHECK_INTERVAL.min(poll_interval - waited);
                tokio::time::sleep(slice).await;
                waited += slice;
            }
        }

        tracing::info!("Run coordinator stopped");
    }

    /// Executes a promoted run: search, record items, drive each item
    /// through the pipeline with bounded fan-out, then retry the items that
    /// failed transiently.
    pub async fn execute(&self, run: &RunRow) -> Result<RunStatus, DatabaseError> {
        let span = tracing::info_span!("run", run_id = %run.id, job_id = %run.job_id, attempt = run.attempts);
        self.execute_inner(run).instrument(span).await
    }

    async fn execute_inner(&self, run: &RunRow) -> Result<RunStatus, DatabaseError> {
        let cancel = RunCancelSignal::new(self.db.clone(), run.id.clone());
        let request = SearchRequest {
            mailbox: run.mailbox.clone(),
            query: run.search_text.clone(),
            lookback_days: run.lookback_days,
            mode: run.mode,
        };

        let outcome = match self.search.search(&request, &cancel).await {
            Ok(outcome) => outcome,
            Err(SearchError::Database(e)) => return Err(e),
            Err(e) => return self.search_failed(run, e),
        };
        if outcome.canceled {
            return self.settle(run, ItemTally::default());
        }

        tracing::info!(
            mode = %outcome.mode,
            messages = outcome.messages.len(),
            pages = outcome.pages_fetched,
            "Search finished"
        );
        run_repo::set_total_messages(&self.db, &run.id, outcome.messages.len() as i64, &now_ts())?;

        let now = now_ts();
        let items = outcome
            .messages
            .iter()
            .map(|msg| {
                let item = ItemRow::new(
                    &run.id,
                    &msg.id,
                    msg.subject.clone(),
                    Some(format_ts(msg.received_at)),
                    &now,
                );
                let item = item_repo::upsert(&self.db, &item)?;
                self.resume_from_earlier_run(run, item)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let scope = RunScope {
            run_id: run.id.clone(),
            mailbox: run.mailbox.clone(),
            job_id: run.job_id.clone(),
        };
        let (scope, cancel, pipeline, db) = (&scope, &cancel, &self.pipeline, &self.db);
        let concurrency = pipeline.config().download_concurrency.max(1);
        let finished: Vec<(usize, Option<ItemOutcome>)> =
            stream::iter(items.iter().cloned().enumerate())
                .map(move |(index, item)| async move {
                    if cancel.is_canceled()? {
                        return Ok::<_, DatabaseError>((index, None));
                    }
                    let outcome = pipeline.process(scope, item).await?;
                    run_repo::increment_processed(db, &scope.run_id, &now_ts())?;
                    Ok((index, Some(outcome)))
                })
                .buffer_unordered(concurrency)
                .try_collect()
                .await?;

        let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; items.len()];
        for (index, outcome) in finished {
            outcomes[index] = outcome;
        }
        self.retry_failed_items(scope, cancel, &items, &mut outcomes).await?;

        self.settle(run, ItemTally::from_outcomes(&outcomes))
    }

    /// Gives a fresh item the committed progress of the same message from an
    /// earlier run of this mailbox, so finished side effects are not redone.
    fn resume_from_earlier_run(
        &self,
        run: &RunRow,
        item: ItemRow,
    ) -> Result<ItemRow, DatabaseError> {
        if item.step != ItemStep::None || item.attempts > 0 {
            return Ok(item);
        }
        let Some(previous) =
            item_repo::find_resumable(&self.db, &run.mailbox, &item.external_message_id, &run.id)?
        else {
            return Ok(item);
        };
        if !item_repo::adopt_progress(&self.db, &item.id, &previous, &now_ts())? {
            return Ok(item);
        }
        tracing::info!(
            item_id = %item.id,
            from_item = %previous.id,
            step = %previous.step,
            "Resuming item from earlier run"
        );
        Ok(item_repo::find_by_id(&self.db, &item.id)?.unwrap_or(item))
    }

    /// Re-runs items whose last failure was retryable until each one is
    /// completed, poisoned or out of attempts, or the run is canceled.
    async fn retry_failed_items(
        &self,
        scope: &RunScope,
        cancel: &RunCancelSignal,
        items: &[ItemRow],
        outcomes: &mut [Option<ItemOutcome>],
    ) -> Result<(), DatabaseError> {
        let delay = Duration::from_millis(self.pipeline.config().retry_delay_ms);
        let concurrency = self.pipeline.config().download_concurrency.max(1);
        let pipeline = &self.pipeline;

        let mut pass = 1;
        loop {
            let mut retry = Vec::new();
            for (index, outcome) in outcomes.iter().enumerate() {
                if !outcome.as_ref().is_some_and(ItemOutcome::is_retryable_failure) {
                    continue;
                }
                if let Some(row) = item_repo::find_by_id(&self.db, &items[index].id)? {
                    if pipeline.should_process(&row) {
                        retry.push((index, row));
                    }
                }
            }
            if retry.is_empty() || cancel.is_canceled()? {
                return Ok(());
            }

            pass += 1;
            tracing::info!(pass, items = retry.len(), "Retrying failed items");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let results: Vec<(usize, ItemOutcome)> = stream::iter(retry)
                .map(move |(index, row)| async move {
                    Ok::<_, DatabaseError>((index, pipeline.process(scope, row).await?))
                })
                .buffer_unordered(concurrency)
                .try_collect()
                .await?;
            for (index, outcome) in results {
                outcomes[index] = Some(outcome);
            }
        }
    }

    fn search_failed(&self, run: &RunRow, error: SearchError) -> Result<RunStatus, DatabaseError> {
        let message = truncate_error(&error.to_string());
        if error.is_retryable() && run.attempts < self.config.max_run_attempts {
            tracing::warn!(error = %message, attempts = run.attempts, "Search failed, re-enqueueing run");
            run_repo::requeue(&self.db, &run.id, Some(&message), &now_ts())?;
            return self.current_status(&run.id);
        }

        tracing::error!(error = %message, "Search failed");
        run_repo::finish(&self.db, &run.id, RunStatus::Failed, Some(&message), &now_ts())?;
        self.report_finished(&run.id)?;
        self.current_status(&run.id)
    }

    /// Marks the run succeeded unless it was canceled meanwhile. Item
    /// failures do not fail the run.
    fn settle(&self, run: &RunRow, tally: ItemTally) -> Result<RunStatus, DatabaseError> {
        if run_repo::finish(&self.db, &run.id, RunStatus::Succeeded, None, &now_ts())? {
            tracing::info!(
                completed = tally.completed,
                skipped = tally.skipped,
                failed = tally.failed,
                not_started = tally.not_started,
                "Run succeeded"
            );
        } else {
            tracing::info!(not_started = tally.not_started, "Run stopped after cancellation");
        }
        self.report_finished(&run.id)?;
        self.current_status(&run.id)
    }

    fn report_finished(&self, run_id: &str) -> Result<(), DatabaseError> {
        if let Some(run) = run_repo::find_by_id(&self.db, run_id)? {
            self.progress.report(ProgressEvent::RunFinished {
                run_id: run.id,
                status: run.status,
                processed_messages: run.processed_messages,
            });
        }
        Ok(())
    }

    fn current_status(&self, run_id: &str) -> Result<RunStatus, DatabaseError> {
        run_repo::status_of(&self.db, run_id)?.ok_or_else(|| DatabaseError::NotFound {
            entity: "run",
            id: run_id.to_string(),
        })
    }
}

#[derive(Debug, Default)]
struct ItemTally {
    completed: usize,
    skipped: usize,
    failed: usize,
    not_started: usize,
}

impl ItemTally {
    fn from_outcomes(outcomes: &[Option<ItemOutcome>]) -> Self {
        let mut tally = Self::default();
        for outcome in outcomes {
            match outcome {
                Some(ItemOutcome::Completed { .. }) => tally.completed += 1,
                Some(ItemOutcome::Skipped) => tally.skipped += 1,
                Some(ItemOutcome::Failed { .. }) => tally.failed += 1,
                None => tally.not_started += 1,
            }
        }
        tally
    }
}
