use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid mailbox '{0}'")]
    InvalidMailbox(String),

    /// Data error: never retried.
    #[error("Invalid job reference '{0}'")]
    InvalidJobReference(String),

    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// A job id becomes a storage path segment, so it must be a single
/// non-empty component.
pub fn validate_job_reference(job_id: &str) -> Result<(), CoordinatorError> {
    let trimmed = job_id.trim();
    if trimmed.is_empty()
        || trimmed != job_id
        || job_id.contains(['/', '\\'])
        || job_id.contains("..")
    {
        return Err(CoordinatorError::InvalidJobReference(job_id.to_string()));
    }
    Ok(())
}

pub fn validate_mailbox(mailbox: &str) -> Result<(), CoordinatorError> {
    let mailbox = mailbox.trim();
    match mailbox.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(CoordinatorError::InvalidMailbox(mailbox.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_reference() {
        assert!(validate_job_reference("job-42").is_ok());
        assert!(validate_job_reference("").is_err());
        assert!(validate_job_reference("  ").is_err());
        assert!(validate_job_reference("../etc").is_err());
        assert!(validate_job_reference("a/b").is_err());
        assert!(validate_job_reference("a\\b").is_err());
    }

    #[test]
    fn test_mailbox() {
        assert!(validate_mailbox("careers@example.com").is_ok());
        assert!(validate_mailbox("careers").is_err());
        assert!(validate_mailbox("@example.com").is_err());
    }
}
