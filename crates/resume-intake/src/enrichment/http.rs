//! HTTP client for the enrichment service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::sanitize::truncate_to;

use super::enricher::{Enricher, EnrichmentRequest};
use super::error::{EnrichmentError, FailurePhase};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ERROR_BODY_LENGTH: usize = 300;

#[derive(Debug, Deserialize, Default)]
struct ServiceErrorBody {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpEnricher {
    client: Client,
    endpoint: String,
}

impl HttpEnricher {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, EnrichmentError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| EnrichmentError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

/// 408, 429 and 5xx are worth retrying; any other status is final.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn service_error(status: StatusCode, body: &str) -> EnrichmentError {
    let parsed: ServiceErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .unwrap_or_else(|| truncate_to(body, MAX_ERROR_BODY_LENGTH));
    EnrichmentError::Service {
        status: status.as_u16(),
        message,
        retryable: is_retryable_status(status),
        phase: parsed.phase.as_deref().and_then(FailurePhase::parse),
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<(), EnrichmentError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(request.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EnrichmentError::Timeout(request.timeout)
                } else {
                    EnrichmentError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(service_error(status, &body))
    }
}
