use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database_path: Option<String>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub eligibility: EligibilityConfig,
    #[serde(default)]
    pub pipeline: ItemPipelineConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

impl Config {
    /// Database location, falling back to `~/.resume-intake/data/intake.db`.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(crate::db::default_database_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub graph: Option<GraphConfig>,
}

/// Microsoft Graph application (client-credentials) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_secret_file: Option<String>,
    #[serde(default)]
    pub client_secret_env_var: Option<String>,
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl GraphConfig {
    pub fn token_endpoint(&self) -> String {
        self.token_url.clone().unwrap_or_else(|| {
            format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                self.tenant_id
            )
        })
    }
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_page_size() -> u32 {
    50
}

fn default_max_pages() -> u32 {
    20
}

fn default_retry_after_secs() -> u64 {
    10
}

fn default_max_rate_limit_retries() -> u32 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_skip_folders")]
    pub skip_folders: Vec<String>,
}

fn default_lookback_days() -> u32 {
    30
}

fn default_max_results() -> usize {
    200
}

fn default_skip_folders() -> Vec<String> {
    vec!["Sent Items".to_string()]
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            max_results: default_max_results(),
            skip_folders: default_skip_folders(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityConfig {
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
}

fn default_allowed_extensions() -> Vec<String> {
    ["pdf", "doc", "docx", "txt", "rtf"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_attachment_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            max_attachment_bytes: default_max_attachment_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPipelineConfig {
    #[serde(default = "default_max_item_attempts")]
    pub max_item_attempts: u32,
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    /// Pause before a run re-attempts its retryable item failures.
    #[serde(default = "default_item_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_max_item_attempts() -> u32 {
    3
}

fn default_download_concurrency() -> usize {
    4
}

fn default_item_retry_delay_ms() -> u64 {
    2000
}

impl Default for ItemPipelineConfig {
    fn default() -> Self {
        Self {
            max_item_attempts: default_max_item_attempts(),
            download_concurrency: default_download_concurrency(),
            retry_delay_ms: default_item_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Enrichment service URL. The daemon does not start a worker without it.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_enrichment_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_enrichment_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_enrichment_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_enrichment_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl EnrichmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_enrichment_timeout_secs() -> u64 {
    120
}

fn default_enrichment_max_attempts() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    30
}

fn default_backoff_max_secs() -> u64 {
    3600
}

fn default_enrichment_poll_secs() -> u64 {
    15
}

fn default_batch_size() -> u32 {
    10
}

fn default_enrichment_concurrency() -> usize {
    2
}

fn default_stale_after_secs() -> u64 {
    900
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_enrichment_timeout_secs(),
            max_attempts: default_enrichment_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            poll_interval_secs: default_enrichment_poll_secs(),
            batch_size: default_batch_size(),
            concurrency: default_enrichment_concurrency(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_coordinator_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_run_attempts")]
    pub max_run_attempts: u32,
}

fn default_coordinator_poll_secs() -> u64 {
    10
}

fn default_max_run_attempts() -> u32 {
    3
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_coordinator_poll_secs(),
            max_run_attempts: default_max_run_attempts(),
        }
    }
}
