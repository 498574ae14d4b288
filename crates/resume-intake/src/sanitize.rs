//! Helpers for sanitizing data before it is persisted or enters tracing span
//! attributes.
//!
//! Spans are safe to share for debugging. Subjects and mailbox addresses are
//! candidate personal data, so only shortened or hashed forms are recorded.

use sha2::{Digest, Sha256};

/// Upper bound for error strings written to the database.
pub const MAX_ERROR_LENGTH: usize = 1000;

/// Maximum length of a sanitized filename, extension included.
const MAX_FILENAME_LENGTH: usize = 120;

/// Truncates an error message to [`MAX_ERROR_LENGTH`] bytes, cutting on a
/// char boundary.
pub fn truncate_error(message: &str) -> String {
    truncate_to(message, MAX_ERROR_LENGTH)
}

/// Truncates `message` to at most `limit` bytes on a char boundary, marking
/// the cut with a trailing ellipsis.
pub fn truncate_to(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }
    let marker = "...";
    let mut end = limit.saturating_sub(marker.len());
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &message[..end], marker)
}

/// Sanitizes an attachment filename for use as an object-storage key segment.
///
/// Keeps alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
/// Leading/trailing dots are trimmed so a name can never climb directories.
pub fn sanitize_filename(filename: &str) -> String {
    let replaced: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = replaced.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        return "attachment".to_string();
    }

    if trimmed.len() > MAX_FILENAME_LENGTH {
        let ext_start = trimmed.rfind('.').unwrap_or(trimmed.len());
        let ext = &trimmed[ext_start..];
        let ext = if ext.len() > 16 { "" } else { ext };
        let base = &trimmed[..MAX_FILENAME_LENGTH - ext.len()];
        format!("{}{}", base, ext)
    } else {
        trimmed.to_string()
    }
}

/// Returns a short deterministic digest of a value for log correlation
/// without exposing the value itself.
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..6])
}

/// Shortens a message subject for span fields.
pub fn redact_subject(subject: &str) -> String {
    truncate_to(subject, 32)
}
