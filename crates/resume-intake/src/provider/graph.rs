//! Microsoft Graph mail provider.
//!
//! Authenticates with the OAuth2 client-credentials grant and caches the
//! access token until shortly before it expires. Every request honours
//! HTTP 429 by sleeping for the server-supplied `Retry-After` (or the
//! configured default) up to `max_rate_limit_retries` times.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::GraphConfig;
use crate::error::ConfigError;
use crate::sanitize::truncate_to;
use crate::secrets::resolve_secret;

use super::{
    AttachmentKind, AttachmentMeta, EmailProvider, Folder, MessageDetail, MessageFilter,
    MessageSummary, Page, ProviderError,
};

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Refresh the token this long before it actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ERROR_BODY_LENGTH: usize = 300;

const MESSAGE_FIELDS: &str = "id,subject,receivedDateTime,hasAttachments,parentFolderId";

struct CachedToken {
    access_token: SecretString,
    expires_at: Instant,
}

pub struct GraphMailProvider {
    client: Client,
    base_url: Url,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    page_size: u32,
    default_retry_after_secs: u64,
    max_rate_limit_retries: u32,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ODataPage<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    received_date_time: DateTime<Utc>,
    #[serde(default)]
    has_attachments: bool,
    #[serde(default)]
    parent_folder_id: Option<String>,
    #[serde(default)]
    attachments: Vec<GraphAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    #[serde(rename = "@odata.type", default)]
    odata_type: Option<String>,
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    is_inline: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    id: String,
    display_name: String,
    #[serde(default)]
    child_folder_count: u32,
}

impl GraphMessage {
    fn summary(&self) -> MessageSummary {
        MessageSummary {
            id: self.id.clone(),
            subject: self.subject.clone(),
            received_at: self.received_date_time,
            has_attachments: self.has_attachments,
            folder_id: self.parent_folder_id.clone(),
        }
    }
}

impl From<GraphAttachment> for AttachmentMeta {
    fn from(a: GraphAttachment) -> Self {
        let kind = match a.odata_type.as_deref() {
            Some("#microsoft.graph.fileAttachment") | None => AttachmentKind::File,
            Some("#microsoft.graph.referenceAttachment") => AttachmentKind::Reference,
            Some(_) => AttachmentKind::Item,
        };
        AttachmentMeta {
            name: a.name.unwrap_or_default(),
            id: a.id,
            content_type: a.content_type,
            size: a.size,
            kind,
            is_inline: a.is_inline,
        }
    }
}

impl From<GraphFolder> for Folder {
    fn from(f: GraphFolder) -> Self {
        Folder {
            id: f.id,
            display_name: f.display_name,
            child_folder_count: f.child_folder_count,
        }
    }
}

/// Parses `Retry-After` as delay seconds, falling back to `default_secs`.
pub(crate) fn parse_retry_after(headers: &HeaderMap, default_secs: u64) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_secs)
}

/// How long to wait before retrying a call that failed with `error`, or
/// `None` if it is not a rate limit or `retries` already reached `max_retries`.
pub(crate) fn rate_limit_delay(
    error: &ProviderError,
    retries: u32,
    max_retries: u32,
) -> Option<Duration> {
    match error {
        ProviderError::RateLimited { retry_after_secs } if retries < max_retries => {
            Some(Duration::from_secs(*retry_after_secs))
        }
        _ => None,
    }
}

fn is_inefficient_filter(body: &str) -> bool {
    body.contains("InefficientFilter")
}

fn filter_expression(filter: &MessageFilter) -> String {
    let since = filter.since.to_rfc3339_opts(SecondsFormat::Secs, true);
    if filter.has_attachments {
        format!("receivedDateTime ge {} and hasAttachments eq true", since)
    } else {
        format!("receivedDateTime ge {}", since)
    }
}

impl GraphMailProvider {
    pub fn from_config(config: &GraphConfig) -> Result<Self, ConfigError> {
        let client_secret = resolve_secret(
            config.client_secret.as_deref(),
            config.client_secret_file.as_deref(),
            config.client_secret_env_var.as_deref(),
        )
        .map_err(|source| ConfigError::Secret {
            field: "provider.graph.client_secret".to_string(),
            source,
        })?;

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::Validation {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| ConfigError::Validation {
                message: format!("provider.graph.base_url is not a valid URL: {}", config.base_url),
            })?;

        Ok(Self {
            client,
            base_url,
            token_url: config.token_endpoint(),
            client_id: config.client_id.clone(),
            client_secret,
            page_size: config.page_size,
            default_retry_after_secs: config.default_retry_after_secs,
            max_rate_limit_retries: config.max_rate_limit_retries,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < token.expires_at {
                return Ok(token.access_token.expose_secret().to_string());
            }
        }

        tracing::debug!("Requesting Graph access token");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("scope", GRAPH_SCOPE),
            ("grant_type", "client_credentials"),
        ];
        let mut retries = 0u32;
        let response = loop {
            let response = self.client.post(&self.token_url).form(&params).send().await?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                let error = ProviderError::RateLimited {
                    retry_after_secs: parse_retry_after(
                        response.headers(),
                        self.default_retry_after_secs,
                    ),
                };
                if self.wait_out_rate_limit(&error, &mut retries).await {
                    continue;
                }
                return Err(error);
            }
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Auth(format!(
                    "token request failed ({}): {}",
                    status,
                    truncate_to(&body, MAX_ERROR_BODY_LENGTH)
                )));
            }
            break response;
        };

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("token response: {}", e)))?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: SecretString::from(token.access_token),
            expires_at: Instant::now() + lifetime,
        });
        Ok(access_token)
    }

    /// Sends a request built by `build`, retrying while rate limited.
    async fn send<F>(&self, build: F) -> Result<Response, ProviderError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut retries = 0u32;
        loop {
            let token = self.access_token().await?;
            let response = build(&self.client).bearer_auth(token).send().await?;
            let error = match self.check_response(response).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            if !self.wait_out_rate_limit(&error, &mut retries).await {
                return Err(error);
            }
        }
    }

    /// Sleeps through a rate limit and counts the retry. False once the
    /// error is not a rate limit or the retry budget is spent.
    async fn wait_out_rate_limit(&self, error: &ProviderError, retries: &mut u32) -> bool {
        let Some(delay) = rate_limit_delay(error, *retries, self.max_rate_limit_retries) else {
            return false;
        };
        *retries += 1;
        tracing::warn!(
            retry_after_secs = delay.as_secs(),
            attempt = *retries,
            "Graph rate limited, backing off"
        );
        tokio::time::sleep(delay).await;
        true
    }

    async fn check_response(&self, response: Response) -> Result<Response, ProviderError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after_secs: parse_retry_after(
                    response.headers(),
                    self.default_retry_after_secs,
                ),
            });
        }
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = truncate_to(&body, MAX_ERROR_BODY_LENGTH);
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(message),
            StatusCode::NOT_FOUND => ProviderError::NotFound(message),
            StatusCode::BAD_REQUEST if is_inefficient_filter(&body) => {
                ProviderError::InefficientFilter(message)
            }
            _ => ProviderError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        eventual_consistency: bool,
    ) -> Result<T, ProviderError> {
        let response = self
            .send(|client| {
                let mut request = client.get(url);
                if !query.is_empty() {
                    request = request.query(query);
                }
                if eventual_consistency {
                    request = request.header("ConsistencyLevel", "eventual");
                }
                request
            })
            .await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }

    /// `base_url` extended with `/users/{mailbox}/...`, each segment
    /// percent-encoded.
    fn user_url(&self, mailbox: &str, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .push("users")
                .push(mailbox)
                .extend(segments);
        }
        url.into()
    }

    async fn message_page(
        &self,
        url: &str,
        query: &[(&str, String)],
        eventual_consistency: bool,
    ) -> Result<Page<MessageSummary>, ProviderError> {
        let page: ODataPage<GraphMessage> = self.get_json(url, query, eventual_consistency).await?;
        Ok(Page {
            items: page.value.iter().map(GraphMessage::summary).collect(),
            next: page.next_link,
        })
    }
}

#[async_trait]
impl EmailProvider for GraphMailProvider {
    async fn search_messages(
        &self,
        mailbox: &str,
        query: &str,
        filter: Option<&MessageFilter>,
        cursor: Option<&str>,
    ) -> Result<Page<MessageSummary>, ProviderError> {
        if let Some(next) = cursor {
            return self.message_page(next, &[], true).await;
        }

        let url = self.user_url(mailbox, &["messages"]);
        let mut params = vec![
            ("$search", format!("\"{}\"", query.replace('"', ""))),
            ("$select", MESSAGE_FIELDS.to_string()),
            ("$top", self.page_size.to_string()),
        ];
        if let Some(filter) = filter {
            params.push(("$filter", filter_expression(filter)));
        }
        self.message_page(&url, &params, true).await
    }

    async fn list_folders(
        &self,
        mailbox: &str,
        parent: Option<&str>,
    ) -> Result<Vec<Folder>, ProviderError> {
        let mut url = match parent {
            Some(id) => self.user_url(mailbox, &["mailFolders", id, "childFolders"]),
            None => self.user_url(mailbox, &["mailFolders"]),
        };
        let mut query = vec![
            ("$top", "100".to_string()),
            ("includeHiddenFolders", "false".to_string()),
        ];

        let mut folders = Vec::new();
        loop {
            let page: ODataPage<GraphFolder> = self.get_json(&url, &query, false).await?;
            folders.extend(page.value.into_iter().map(Folder::from));
            match page.next_link {
                Some(next) => {
                    url = next;
                    query.clear();
                }
                None => break,
            }
        }
        Ok(folders)
    }

    async fn list_folder_messages(
        &self,
        mailbox: &str,
        folder_id: &str,
        filter: &MessageFilter,
        cursor: Option<&str>,
    ) -> Result<Page<MessageSummary>, ProviderError> {
        if let Some(next) = cursor {
            return self.message_page(next, &[], false).await;
        }

        let url = self.user_url(mailbox, &["mailFolders", folder_id, "messages"]);
        let params = [
            ("$filter", filter_expression(filter)),
            ("$orderby", "receivedDateTime desc".to_string()),
            ("$select", MESSAGE_FIELDS.to_string()),
            ("$top", self.page_size.to_string()),
        ];
        self.message_page(&url, &params, false).await
    }

    async fn get_message(
        &self,
        mailbox: &str,
        message_id: &str,
    ) -> Result<MessageDetail, ProviderError> {
        let url = self.user_url(mailbox, &["messages", message_id]);
        let params = [
            ("$select", MESSAGE_FIELDS.to_string()),
            (
                "$expand",
                "attachments($select=id,name,contentType,size,isInline)".to_string(),
            ),
        ];
        let message: GraphMessage = self.get_json(&url, &params, false).await?;
        let summary = message.summary();
        Ok(MessageDetail {
            summary,
            attachments: message
                .attachments
                .into_iter()
                .map(AttachmentMeta::from)
                .collect(),
        })
    }

    async fn get_attachment_bytes(
        &self,
        mailbox: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = self.user_url(
            mailbox,
            &["messages", message_id, "attachments", attachment_id, "$value"],
        );
        let response = self.send(|client| client.get(&url)).await?;
        Ok(response.bytes().await?.to_vec())
    }
}
