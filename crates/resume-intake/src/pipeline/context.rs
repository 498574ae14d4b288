use crate::db::item_repo::{ItemRow, ItemStep};
use crate::provider::{AttachmentMeta, EmailProvider, MessageDetail};

use super::error::PipelineError;

/// Run-level facts an item needs.
#[derive(Debug, Clone)]
pub struct RunScope {
    pub run_id: String,
    pub mailbox: String,
    pub job_id: String,
}

/// State for one pipeline invocation on one item.
///
/// Data fetched from the provider is cached here so a single invocation
/// fetches the message and the attachment bytes at most once each.
pub struct ItemContext {
    pub item: ItemRow,
    message: Option<MessageDetail>,
    bytes: Option<Vec<u8>>,
}

impl ItemContext {
    pub fn new(item: ItemRow) -> Self {
        Self {
            item,
            message: None,
            bytes: None,
        }
    }

    pub async fn message(
        &mut self,
        provider: &dyn EmailProvider,
        mailbox: &str,
    ) -> Result<&MessageDetail, PipelineError> {
        if self.message.is_none() {
            let detail = provider
                .get_message(mailbox, &self.item.external_message_id)
                .await?;
            self.message = Some(detail);
        }
        self.message
            .as_ref()
            .ok_or(PipelineError::MissingArtifact {
                step: self.item.step,
                field: "message",
            })
    }

    /// Bytes of the selected attachment, downloaded on first use.
    pub async fn bytes(
        &mut self,
        provider: &dyn EmailProvider,
        mailbox: &str,
    ) -> Result<&[u8], PipelineError> {
        if self.bytes.is_none() {
            let attachment_id = self.require(self.item.attachment_id.clone(), "attachment_id")?;
            let bytes = provider
                .get_attachment_bytes(mailbox, &self.item.external_message_id, &attachment_id)
                .await?;
            self.bytes = Some(bytes);
        }
        self.bytes.as_deref().ok_or(PipelineError::MissingArtifact {
            step: self.item.step,
            field: "attachment bytes",
        })
    }

    /// Remembers the attachment chosen for this item.
    pub fn select_attachment(&mut self, attachment: &AttachmentMeta) {
        self.item.attachment_id = Some(attachment.id.clone());
        self.item.attachment_name = Some(attachment.name.clone());
        self.item.content_type = attachment.content_type.clone().or_else(|| {
            mime_guess::from_path(&attachment.name)
                .first()
                .map(|m| m.to_string())
        });
    }

    pub fn require<T>(&self, value: Option<T>, field: &'static str) -> Result<T, PipelineError> {
        value.ok_or(PipelineError::MissingArtifact {
            step: self.item.step,
            field,
        })
    }

    pub fn step(&self) -> ItemStep {
        self.item.step
    }
}
