use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    /// Transport-level failure (connect, reset, timeout).
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Still rate limited after exhausting local retries.
    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The provider refused the query predicate as too expensive.
    #[error("Provider rejected filter as inefficient: {0}")]
    InefficientFilter(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse provider response: {0}")]
    Parse(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    /// Transient failures worth retrying later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Parse(err.to_string())
        } else {
            ProviderError::Http(err.to_string())
        }
    }
}
