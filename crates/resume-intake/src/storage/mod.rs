pub mod filesystem;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::sanitize::sanitize_filename;

pub use filesystem::FileObjectStorage;

/// Idempotent object store. Writing an object that already exists is a
/// success and returns the same storage path.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<String, StorageError>;
}

/// Object key for an attachment: `{job_id}/{content_hash}/{filename}`.
pub fn object_path(job_id: &str, content_hash: &str, filename: &str) -> String {
    format!(
        "{}/{}/{}",
        sanitize_filename(job_id),
        content_hash,
        sanitize_filename(filename)
    )
}
