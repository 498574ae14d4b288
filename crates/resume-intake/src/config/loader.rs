use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.storage.root.trim().is_empty() {
        return Err(invalid("storage.root must not be empty"));
    }

    if config.eligibility.allowed_extensions.is_empty() {
        return Err(invalid("eligibility.allowed_extensions must not be empty"));
    }
    for ext in &config.eligibility.allowed_extensions {
        if ext.is_empty() || ext.starts_with('.') {
            return Err(invalid(format!(
                "Invalid extension '{}': use bare extensions such as \"pdf\"",
                ext
            )));
        }
    }
    if config.eligibility.max_attachment_bytes == 0 {
        return Err(invalid("eligibility.max_attachment_bytes must be > 0"));
    }

    if config.search.max_results == 0 {
        return Err(invalid("search.max_results must be > 0"));
    }
    if config.search.lookback_days == 0 {
        return Err(invalid("search.lookback_days must be > 0"));
    }

    if config.pipeline.max_item_attempts == 0 {
        return Err(invalid("pipeline.max_item_attempts must be > 0"));
    }
    if config.pipeline.download_concurrency == 0 {
        return Err(invalid("pipeline.download_concurrency must be > 0"));
    }

    let enrichment = &config.enrichment;
    if enrichment.max_attempts == 0 {
        return Err(invalid("enrichment.max_attempts must be > 0"));
    }
    if enrichment.concurrency == 0 || enrichment.batch_size == 0 {
        return Err(invalid(
            "enrichment.concurrency and enrichment.batch_size must be > 0",
        ));
    }
    if enrichment.timeout_secs == 0 {
        return Err(invalid("enrichment.timeout_secs must be > 0"));
    }
    if enrichment.backoff_base_secs > enrichment.backoff_max_secs {
        return Err(invalid(format!(
            "enrichment.backoff_base_secs ({}) exceeds backoff_max_secs ({})",
            enrichment.backoff_base_secs, enrichment.backoff_max_secs
        )));
    }

    if config.coordinator.max_run_attempts == 0 {
        return Err(invalid("coordinator.max_run_attempts must be > 0"));
    }

    if let Some(graph) = &config.provider.graph {
        if graph.tenant_id.is_empty() || graph.client_id.is_empty() {
            return Err(invalid("provider.graph requires tenant_id and client_id"));
        }
        if !crate::secrets::has_secret_source(
            graph.client_secret.as_deref(),
            graph.client_secret_file.as_deref(),
            graph.client_secret_env_var.as_deref(),
        ) {
            return Err(invalid(
                "provider.graph requires client_secret, client_secret_file or client_secret_env_var",
            ));
        }
        if graph.page_size == 0 || graph.max_pages == 0 {
            return Err(invalid("provider.graph page_size and max_pages must be > 0"));
        }
    }

    Ok(())
}
