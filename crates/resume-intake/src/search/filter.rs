//! Local post-filtering applied to provider results.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::provider::MessageSummary;

/// Every whitespace-separated token of `query` must occur in the subject,
/// ignoring case. A blank query matches everything.
pub fn subject_matches(subject: Option<&str>, query: &str) -> bool {
    let subject = subject.unwrap_or_default().to_lowercase();
    query
        .split_whitespace()
        .all(|token| subject.contains(&token.to_lowercase()))
}

/// Keeps messages with attachments, received at or after `cutoff`, whose
/// subject matches `query`.
pub fn retain_candidates(
    messages: Vec<MessageSummary>,
    cutoff: DateTime<Utc>,
    query: Option<&str>,
) -> Vec<MessageSummary> {
    messages
        .into_iter()
        .filter(|m| m.has_attachments)
        .filter(|m| m.received_at >= cutoff)
        .filter(|m| query.is_none_or(|q| subject_matches(m.subject.as_deref(), q)))
        .collect()
}

/// Sorts newest first, drops repeated message ids and caps the list.
pub fn newest_first(mut messages: Vec<MessageSummary>, cap: usize) -> Vec<MessageSummary> {
    messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
    let mut seen = HashSet::new();
    messages.retain(|m| seen.insert(m.id.clone()));
    messages.truncate(cap);
    messages
}
