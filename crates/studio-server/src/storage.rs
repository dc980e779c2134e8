//! Uploaded chat file storage.
//!
//! A filesystem namespace rooted at `{root}/{user_id}/{conversation_id}/`.
//! File names are sanitized to their final path component so a client cannot
//! escape its directory. Old files are reclaimed by the periodic cleanup.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

/// Chat file storage rooted at a directory.
pub struct ChatStorage {
    root: PathBuf,
}

impl ChatStorage {
    /// Create storage over a root directory (created lazily on write).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Save one uploaded file. Returns the path it was written to.
    pub async fn save_file(
        &self,
        user_id: &str,
        conversation_id: &str,
        filename: &str,
        content: &[u8],
    ) -> std::io::Result<PathBuf> {
        let name = sanitize_filename(filename);
        if name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty file name",
            ));
        }
        let dir = self
            .root
            .join(sanitize_filename(user_id))
            .join(sanitize_filename(conversation_id));
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, content).await?;
        info!(path = %path.display(), bytes = content.len(), "chat file saved");
        Ok(path)
    }

    /// File names uploaded for a conversation, sorted.
    pub async fn list_files(&self, user_id: &str, conversation_id: &str) -> Vec<String> {
        let dir = self
            .root
            .join(sanitize_filename(user_id))
            .join(sanitize_filename(conversation_id));
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return Vec::new();
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        names
    }

    /// Delete files older than `days_to_keep`. Returns how many were removed.
    pub async fn cleanup_old_files(&self, days_to_keep: u64) -> usize {
        let cutoff = SystemTime::now() - Duration::from_secs(days_to_keep * 24 * 3600);
        let mut removed = 0;
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(path);
                } else if meta.modified().is_ok_and(|m| m < cutoff) {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(path = %path.display(), error = %e, "cleanup failed"),
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, days_to_keep, "removed stale chat files");
        }
        removed
    }
}

/// Strip any path components, keeping only the final file name.
fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}
