//! Local storage for uploaded import files
//!
//! Uploads are written under a single directory with generated names and stay
//! there until their job no longer needs them.

use crate::errors::{AppError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory-backed upload store
#[derive(Debug, Clone)]
pub struct UploadStorage {
    root: PathBuf,
}

impl UploadStorage {
    /// Open the store, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| AppError::Storage {
            message: format!("Failed to create upload directory {}: {}", root.display(), e),
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a stored upload with the given key lives at
    pub fn path_for(&self, key: Uuid) -> PathBuf {
        self.root.join(format!("{}.csv", key))
    }

    /// Persist an upload and return its path.
    ///
    /// The file is written under a temporary name and renamed into place, so a
    /// returned path always refers to a complete file.
    pub async fn store(&self, contents: &[u8]) -> Result<PathBuf> {
        let key = Uuid::new_v4();
        let path = self.path_for(key);
        let partial = self.root.join(format!("{}.partial", key));

        tokio::fs::write(&partial, contents).await?;
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        debug!(path = %path.display(), bytes = contents.len(), "Stored upload");
        Ok(path)
    }

    /// Remove a stored upload. A file that is already gone is not an error.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed upload");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "Upload already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
