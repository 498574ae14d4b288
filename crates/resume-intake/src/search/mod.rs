//! Candidate message discovery for a run.

pub mod cancel;
pub mod filter;
pub mod folders;
pub mod orchestrator;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::provider::ProviderError;

pub use cancel::{CancelFlag, CancelSignal, NeverCancel, RunCancelSignal};
pub use orchestrator::{SearchOrchestrator, SearchOutcome, SearchRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchMode {
    /// One provider-native full-text query across all folders.
    GraphSearch,
    /// Folder-by-folder enumeration with date and attachment filters.
    DeepScan,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::GraphSearch => "graph_search",
            SearchMode::DeepScan => "deep_scan",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "graph_search" => Ok(SearchMode::GraphSearch),
            "deep_scan" => Ok(SearchMode::DeepScan),
            other => Err(format!("unknown search mode '{}'", other)),
        }
    }
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Failed to read cancellation state: {0}")]
    Database(#[from] DatabaseError),
}

impl SearchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SearchError::Provider(e) => e.is_retryable(),
            SearchError::Database(_) => false,
        }
    }
}
