//! Mail provider abstraction.
//!
//! The pipeline only talks to an [`EmailProvider`]; the Microsoft Graph
//! implementation lives in [`graph`]. Tests substitute in-memory fakes.

pub mod eligibility;
pub mod error;
pub mod graph;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use eligibility::{EligibilityFilter, Ineligible};
pub use error::ProviderError;
pub use graph::GraphMailProvider;

/// A message as returned by search or folder listing.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSummary {
    pub id: String,
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
    pub has_attachments: bool,
    pub folder_id: Option<String>,
}

/// A mail folder in the mailbox tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: String,
    pub display_name: String,
    pub child_folder_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// A real file carried in the message.
    File,
    /// An attached message or calendar item.
    Item,
    /// A link to cloud storage.
    Reference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentMeta {
    pub id: String,
    pub name: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub kind: AttachmentKind,
    pub is_inline: bool,
}

/// A message with the metadata of all its attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDetail {
    pub summary: MessageSummary,
    pub attachments: Vec<AttachmentMeta>,
}

/// One page of results and the continuation cursor, if any.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// Provider-side predicate: received on or after `since`, optionally
/// restricted to messages with attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFilter {
    pub since: DateTime<Utc>,
    pub has_attachments: bool,
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Provider-native full-text search across all folders.
    ///
    /// `filter` is the restrictive predicate; some providers reject it in
    /// combination with a query and return [`ProviderError::InefficientFilter`].
    async fn search_messages(
        &self,
        mailbox: &str,
        query: &str,
        filter: Option<&MessageFilter>,
        cursor: Option<&str>,
    ) -> Result<Page<MessageSummary>, ProviderError>;

    /// Lists folders under `parent`, or the top-level folders if `None`.
    async fn list_folders(
        &self,
        mailbox: &str,
        parent: Option<&str>,
    ) -> Result<Vec<Folder>, ProviderError>;

    /// Lists messages in a folder matching the filter, newest first.
    async fn list_folder_messages(
        &self,
        mailbox: &str,
        folder_id: &str,
        filter: &MessageFilter,
        cursor: Option<&str>,
    ) -> Result<Page<MessageSummary>, ProviderError>;

    async fn get_message(
        &self,
        mailbox: &str,
        message_id: &str,
    ) -> Result<MessageDetail, ProviderError>;

    async fn get_attachment_bytes(
        &self,
        mailbox: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError>;
}
