use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::item_repo::ItemStep;
use crate::db::run_repo::RunStatus;

/// Events emitted while runs and items advance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StepCommitted {
        run_id: String,
        item_id: String,
        #[serde(serialize_with = "serialize_step")]
        step: ItemStep,
    },
    ItemFailed {
        run_id: String,
        item_id: String,
        error: String,
        poisoned: bool,
    },
    RunFinished {
        run_id: String,
        #[serde(serialize_with = "serialize_run_status")]
        status: RunStatus,
        processed_messages: i64,
    },
}

fn serialize_step<S: serde::Serializer>(step: &ItemStep, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(step.as_str())
}

fn serialize_run_status<S: serde::Serializer>(
    status: &RunStatus,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(status.as_str())
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Fans events out to any number of subscribers. Sending with no
/// subscribers is not an error.
pub struct BroadcastProgress {
    sender: Arc<broadcast::Sender<ProgressEvent>>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}

/// Logs each event from `receiver` until every sender is dropped and
/// returns how many were logged.
pub async fn log_events(mut receiver: broadcast::Receiver<ProgressEvent>) -> u64 {
    let mut logged = 0;
    loop {
        match receiver.recv().await {
            Ok(event) => {
                log_event(&event);
                logged += 1;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Progress log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return logged,
        }
    }
}

fn log_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::StepCommitted {
            run_id,
            item_id,
            step,
        } => {
            tracing::debug!(
                run_id = %run_id,
                item_id = %item_id,
                step = step.as_str(),
                "Step committed"
            );
        }
        ProgressEvent::ItemFailed {
            run_id,
            item_id,
            error,
            poisoned,
        } => {
            tracing::warn!(
                run_id = %run_id,
                item_id = %item_id,
                poisoned,
                error = %error,
                "Item failed"
            );
        }
        ProgressEvent::RunFinished {
            run_id,
            status,
            processed_messages,
        } => {
            tracing::info!(
                run_id = %run_id,
                status = status.as_str(),
                processed_messages,
                "Run finished"
            );
        }
    }
}
