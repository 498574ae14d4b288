//! Cooperative cancellation checks.
//!
//! Long-running work polls a [`CancelSignal`] between units of work and
//! stops cleanly when it fires. Stopping is not a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::db::run_repo::{self, RunStatus};
use crate::db::{Database, DatabaseError};

pub trait CancelSignal: Send + Sync {
    fn is_canceled(&self) -> Result<bool, DatabaseError>;
}

/// Fires once the persisted run status is no longer `running`.
#[derive(Clone)]
pub struct RunCancelSignal {
    db: Database,
    run_id: String,
}

impl RunCancelSignal {
    pub fn new(db: Database, run_id: impl Into<String>) -> Self {
        Self {
            db,
            run_id: run_id.into(),
        }
    }
}

impl CancelSignal for RunCancelSignal {
    fn is_canceled(&self) -> Result<bool, DatabaseError> {
        Ok(!matches!(
            run_repo::status_of(&self.db, &self.run_id)?,
            Some(RunStatus::Running)
        ))
    }
}

pub struct NeverCancel;

impl CancelSignal for NeverCancel {
    fn is_canceled(&self) -> Result<bool, DatabaseError> {
        Ok(false)
    }
}

/// In-process flag, shared by clones.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl CancelSignal for CancelFlag {
    fn is_canceled(&self) -> Result<bool, DatabaseError> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}
