use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::error::EnrichmentError;

/// What the enrichment service needs to process one resume for one job.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRequest {
    pub resume_id: String,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip)]
    pub timeout: Duration,
}

/// Downstream enrichment (ingestion and scanning) of a stored resume.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<(), EnrichmentError>;
}
