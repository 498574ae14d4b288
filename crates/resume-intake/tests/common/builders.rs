#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};

use resume_intake::provider::{AttachmentKind, AttachmentMeta, Folder, MessageSummary};

pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}

pub fn message(id: &str, subject: &str, received_at: DateTime<Utc>) -> MessageSummary {
    MessageSummary {
        id: id.to_string(),
        subject: Some(subject.to_string()),
        received_at,
        has_attachments: true,
        folder_id: None,
    }
}

pub fn attachment(id: &str, name: &str, size: u64) -> AttachmentMeta {
    AttachmentMeta {
        id: id.to_string(),
        name: name.to_string(),
        content_type: None,
        size,
        kind: AttachmentKind::File,
        is_inline: false,
    }
}

/// An attachment whose declared size matches `bytes`.
pub fn file(id: &str, name: &str, bytes: &[u8]) -> (AttachmentMeta, Vec<u8>) {
    (attachment(id, name, bytes.len() as u64), bytes.to_vec())
}

pub fn folder(id: &str, name: &str) -> Folder {
    Folder {
        id: id.to_string(),
        display_name: name.to_string(),
        child_folder_count: 0,
    }
}
