use thiserror::Error;

use crate::db::item_repo::ItemStep;
use crate::db::DatabaseError;
use crate::error::{ExtractError, StorageError};
use crate::provider::ProviderError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Provider request failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// The document has no text layer. Never retried.
    #[error("No text layer: {0}")]
    NoTextLayer(String),

    #[error("Extractor failed: {0}")]
    Extractor(String),

    /// A resumed item lacks data an earlier step should have committed.
    #[error("Item at step '{step}' is missing {field}")]
    MissingArtifact { step: ItemStep, field: &'static str },
}

impl PipelineError {
    pub fn is_poison(&self) -> bool {
        matches!(self, PipelineError::NoTextLayer(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Provider(e) => e.is_retryable(),
            PipelineError::Storage(_) | PipelineError::Database(_) => true,
            _ => false,
        }
    }
}

impl From<ExtractError> for PipelineError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::NoTextLayer(reason) => PipelineError::NoTextLayer(reason),
            other => PipelineError::Extractor(other.to_string()),
        }
    }
}
