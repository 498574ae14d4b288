use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::db::DatabaseError;

/// Which stage of the enrichment service failed. Selects the terminal
/// status once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    Ingest,
    Scan,
}

impl FailurePhase {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ingest" => Some(FailurePhase::Ingest),
            "scan" => Some(FailurePhase::Scan),
            _ => None,
        }
    }
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePhase::Ingest => f.write_str("ingest"),
            FailurePhase::Scan => f.write_str("scan"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("Enrichment timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Enrichment transport error: {0}")]
    Transport(String),

    #[error("Enrichment service returned {status}: {message}")]
    Service {
        status: u16,
        message: String,
        retryable: bool,
        phase: Option<FailurePhase>,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl EnrichmentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EnrichmentError::Timeout(_) | EnrichmentError::Transport(_) => true,
            EnrichmentError::Service { retryable, .. } => *retryable,
            EnrichmentError::Database(_) => false,
        }
    }

    pub fn phase(&self) -> Option<FailurePhase> {
        match self {
            EnrichmentError::Service { phase, .. } => *phase,
            _ => None,
        }
    }
}
