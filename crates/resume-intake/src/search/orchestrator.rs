use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SearchConfig;
use crate::provider::{EmailProvider, MessageFilter, MessageSummary, ProviderError};
use crate::sanitize;

use super::filter::{newest_first, retain_candidates, subject_matches};
use super::folders::walk_folders;
use super::{CancelSignal, SearchError, SearchMode};

/// Default ceiling on continuation pages followed per query.
pub const DEFAULT_MAX_PAGES: u32 = 20;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub mailbox: String,
    pub query: Option<String>,
    pub lookback_days: u32,
    pub mode: SearchMode,
}

impl SearchRequest {
    /// Query text with surrounding whitespace removed, if any remains.
    pub fn query_text(&self) -> Option<&str> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }

    /// Graph search needs query text; without it the run deep-scans.
    pub fn effective_mode(&self) -> SearchMode {
        match (self.mode, self.query_text()) {
            (SearchMode::GraphSearch, None) => SearchMode::DeepScan,
            (mode, _) => mode,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub mode: SearchMode,
    pub messages: Vec<MessageSummary>,
    pub pages_fetched: u32,
    /// Enumeration stopped early because the run was canceled.
    pub canceled: bool,
}

pub struct SearchOrchestrator {
    provider: Arc<dyn EmailProvider>,
    config: SearchConfig,
    max_pages: u32,
}

impl SearchOrchestrator {
    pub fn new(provider: Arc<dyn EmailProvider>, config: SearchConfig) -> Self {
        Self {
            provider,
            config,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &dyn CancelSignal,
    ) -> Result<SearchOutcome, SearchError> {
        self.search_at(request, Utc::now(), cancel).await
    }

    /// Same as [`search`](Self::search) with an explicit reference time.
    pub async fn search_at(
        &self,
        request: &SearchRequest,
        now: DateTime<Utc>,
        cancel: &dyn CancelSignal,
    ) -> Result<SearchOutcome, SearchError> {
        let mode = request.effective_mode();
        let cutoff = now - Duration::days(i64::from(request.lookback_days));
        let span = info_span!(
            "search",
            mailbox = %sanitize::fingerprint(&request.mailbox),
            mode = %mode,
        );

        async move {
            let outcome = match (mode, request.query_text()) {
                (SearchMode::GraphSearch, Some(query)) => {
                    self.graph_search(&request.mailbox, query, cutoff, cancel)
                        .await?
                }
                _ => {
                    self.deep_scan(&request.mailbox, request.query_text(), cutoff, cancel)
                        .await?
                }
            };
            info!(
                candidates = outcome.messages.len(),
                pages = outcome.pages_fetched,
                canceled = outcome.canceled,
                "Search finished"
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn graph_search(
        &self,
        mailbox: &str,
        query: &str,
        cutoff: DateTime<Utc>,
        cancel: &dyn CancelSignal,
    ) -> Result<SearchOutcome, SearchError> {
        let filter = MessageFilter {
            since: cutoff,
            has_attachments: true,
        };

        let first = match self
            .provider
            .search_messages(mailbox, query, Some(&filter), None)
            .await
        {
            Err(ProviderError::InefficientFilter(reason)) => {
                warn!(%reason, "Provider rejected search filter, retrying without it");
                self.provider
                    .search_messages(mailbox, query, None, None)
                    .await?
            }
            other => other?,
        };

        let mut pages_fetched = 1;
        let mut canceled = false;
        let mut collected = first.items;
        let mut cursor = first.next;

        while let Some(next) = cursor.take() {
            if pages_fetched >= self.max_pages {
                debug!(pages_fetched, "Page ceiling reached");
                break;
            }
            if cancel.is_canceled()? {
                canceled = true;
                break;
            }
            let page = self
                .provider
                .search_messages(mailbox, query, None, Some(&next))
                .await?;
            pages_fetched += 1;
            collected.extend(page.items);
            cursor = page.next;
        }

        let candidates = retain_candidates(collected, cutoff, Some(query));
        Ok(SearchOutcome {
            mode: SearchMode::GraphSearch,
            messages: newest_first(candidates, self.config.max_results),
            pages_fetched,
            canceled,
        })
    }

    /// Folders are visited in priority order; within a folder messages arrive
    /// newest first and the folder ends at the first message older than the
    /// cutoff. The returned list keeps that visit order.
    async fn deep_scan(
        &self,
        mailbox: &str,
        query: Option<&str>,
        cutoff: DateTime<Utc>,
        cancel: &dyn CancelSignal,
    ) -> Result<SearchOutcome, SearchError> {
        let walk =
            walk_folders(self.provider.as_ref(), mailbox, &self.config.skip_folders, cancel)
                .await?;
        let mut outcome = SearchOutcome {
            mode: SearchMode::DeepScan,
            messages: Vec::new(),
            pages_fetched: 0,
            canceled: walk.canceled,
        };
        if outcome.canceled {
            return Ok(outcome);
        }

        let filter = MessageFilter {
            since: cutoff,
            has_attachments: true,
        };
        let cap = self.config.max_results;
        let mut seen = HashSet::new();

        'folders: for folder in &walk.folders {
            if outcome.messages.len() >= cap {
                break;
            }
            if cancel.is_canceled()? {
                outcome.canceled = true;
                break;
            }
            debug!(folder = %folder.display_name, "Scanning folder");

            let mut cursor: Option<String> = None;
            let mut folder_pages = 0;
            loop {
                let page = self
                    .provider
                    .list_folder_messages(mailbox, &folder.id, &filter, cursor.as_deref())
                    .await?;
                folder_pages += 1;
                outcome.pages_fetched += 1;

                for message in page.items {
                    if message.received_at < cutoff {
                        continue 'folders;
                    }
                    if !message.has_attachments
                        || !query.is_none_or(|q| subject_matches(message.subject.as_deref(), q))
                    {
                        continue;
                    }
                    if !seen.insert(message.id.clone()) {
                        continue;
                    }
                    outcome.messages.push(message);
                    if outcome.messages.len() >= cap {
                        break 'folders;
                    }
                }

                match page.next {
                    Some(next) if folder_pages < self.max_pages => {
                        if cancel.is_canceled()? {
                            outcome.canceled = true;
                            break 'folders;
                        }
                        cursor = Some(next);
                    }
                    _ => break,
                }
            }
        }

        Ok(outcome)
    }
}
