//! Folder tree traversal and visit ordering for deep scans.

use std::collections::VecDeque;

use crate::provider::{EmailProvider, Folder};

use super::{CancelSignal, SearchError};

/// Visit priority; lower is visited first.
pub fn folder_priority(display_name: &str) -> u8 {
    let name = display_name.trim().to_lowercase();
    if name == "inbox" {
        0
    } else if name.starts_with("sent") {
        1
    } else if name.contains("deleted") || name == "trash" || name == "bin" {
        2
    } else {
        3
    }
}

pub fn is_skipped(display_name: &str, skip_folders: &[String]) -> bool {
    skip_folders
        .iter()
        .any(|skip| skip.trim().eq_ignore_ascii_case(display_name.trim()))
}

/// Folders in visit order plus whether enumeration was cut short.
#[derive(Debug, Default)]
pub struct FolderWalk {
    pub folders: Vec<Folder>,
    pub canceled: bool,
}

/// Breadth-first enumeration of the folder tree. Skipped folders are pruned
/// together with their subtree. The result is stably ordered by
/// [`folder_priority`], so discovery order breaks ties.
pub async fn walk_folders(
    provider: &dyn EmailProvider,
    mailbox: &str,
    skip_folders: &[String],
    cancel: &dyn CancelSignal,
) -> Result<FolderWalk, SearchError> {
    let mut walk = FolderWalk::default();
    let mut queue: VecDeque<Folder> = provider.list_folders(mailbox, None).await?.into();

    while let Some(folder) = queue.pop_front() {
        if is_skipped(&folder.display_name, skip_folders) {
            tracing::debug!(folder = %folder.display_name, "Skipping folder");
            continue;
        }
        if folder.child_folder_count > 0 {
            if cancel.is_canceled()? {
                walk.canceled = true;
                break;
            }
            queue.extend(provider.list_folders(mailbox, Some(&folder.id)).await?);
        }
        walk.folders.push(folder);
    }

    walk.folders
        .sort_by_key(|f| folder_priority(&f.display_name));
    Ok(walk)
}
