//! Content-addressed deduplication.
//!
//! An attachment is identified by the SHA-256 of its raw bytes. A Resume is
//! reused only when both the hash and the source message id match; the same
//! bytes arriving in a different message produce a distinct Resume.

use sha2::{Digest, Sha256};

use crate::db::resume_repo::{self, ResumeRow};
use crate::db::{Database, DatabaseError};

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Exact (hash, message id) match, if one exists.
pub fn find_existing(
    db: &Database,
    content_hash: &str,
    message_id: &str,
) -> Result<Option<ResumeRow>, DatabaseError> {
    resume_repo::find_by_hash_and_message(db, content_hash, message_id)
}
