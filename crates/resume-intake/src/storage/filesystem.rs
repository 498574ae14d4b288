use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::StorageError;

use super::ObjectStorage;

/// Object storage backed by a local directory tree.
///
/// Keys are content addressed, so an existing object of the expected size is
/// taken as already uploaded. A shorter leftover from an interrupted write is
/// replaced.
#[derive(Debug, Clone)]
pub struct FileObjectStorage {
    root: PathBuf,
}

impl FileObjectStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let is_plain = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !is_plain {
            return Err(StorageError::InvalidPath(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn write_object(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let write_err = |e| StorageError::WriteObject {
            path: path.to_path_buf(),
            source: e,
        };

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                file.write_all(bytes).map_err(write_err)?;
                file.sync_all().map_err(write_err)?;
                log::debug!("Stored object {} ({} bytes)", path.display(), bytes.len());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = std::fs::metadata(path).map_err(write_err)?.len();
                if existing == bytes.len() as u64 {
                    log::debug!("Object {} already exists", path.display());
                    return Ok(());
                }
                log::warn!(
                    "Replacing partial object {} ({} of {} bytes)",
                    path.display(),
                    existing,
                    bytes.len()
                );
                std::fs::write(path, bytes).map_err(write_err)
            }
            Err(e) => Err(write_err(e)),
        }
    }
}

#[async_trait]
impl ObjectStorage for FileObjectStorage {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        _content_type: Option<&str>,
    ) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        let data = bytes.to_vec();
        let written = target.clone();
        tokio::task::spawn_blocking(move || Self::write_object(&written, &data))
            .await
            .map_err(|e| StorageError::WriteObject {
                path: target.clone(),
                source: std::io::Error::other(e),
            })??;
        Ok(path.to_string())
    }
}
