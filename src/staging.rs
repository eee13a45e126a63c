//! Staged writes: the `.part` twin of a visible path.
//!
//! Every file being written has two names: the visible path `P` and the
//! in-flight `P.<uuid>.part`. A [`StagedFile`] owns the staged name from
//! acquisition to settlement so that a concurrent observer never sees a
//! half-written file under `P`. On success the staged file is promoted to
//! `P` with a single atomic rename; on any error path it is destroyed.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("another writer is active for this path")]
    ActiveWriter,
    #[error("destination already settled")]
    AlreadySettled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Scoped acquisition of a visible path for writing.
pub struct StagedFile {
    visible: PathBuf,
    staged: PathBuf,
}

impl StagedFile {
    /// Acquire `visible` for writing.
    ///
    /// Aborts when a staged twin of the path already exists (another writer
    /// is active, or a crashed write awaits cleanup). A pre-existing file
    /// at the visible path is renamed into the staged name, so append-mode
    /// writers continue from its bytes; a pre-existing directory (left by a
    /// prior archive upload) is removed.
    pub async fn begin(visible: PathBuf) -> Result<Self, StagingError> {
        let name = visible
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StagingError::Io(std::io::Error::other("path has no file name")))?
            .to_string();
        let parent = visible.parent().unwrap_or_else(|| Path::new("."));

        let mut entries = fs::read_dir(parent).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(candidate) = entry.file_name().to_str() {
                if is_staged_twin(candidate, &name) {
                    tracing::warn!(
                        target: "staging",
                        path = %visible.display(),
                        staged = candidate,
                        "Refusing to write: staged twin exists"
                    );
                    return Err(StagingError::ActiveWriter);
                }
            }
        }

        let staged = parent.join(format!("{}.{}.part", name, Uuid::new_v4()));
        match fs::metadata(&visible).await {
            Ok(meta) if meta.is_dir() => {
                tracing::info!(
                    target: "staging",
                    path = %visible.display(),
                    "Removing directory left by a prior upload"
                );
                fs::remove_dir_all(&visible).await?;
            }
            Ok(_) => {
                fs::rename(&visible, &staged).await?;
            }
            Err(_) => {}
        }
        Ok(Self { visible, staged })
    }

    /// Path writes should go to while the acquisition is held.
    pub fn staged_path(&self) -> &Path {
        &self.staged
    }

    /// Open the staged file for writing with restricted permissions.
    ///
    /// `truncate` discards any bytes carried over from a pre-existing
    /// visible file (PUT); otherwise writes append (POST/PATCH).
    pub async fn open(&self, truncate: bool) -> Result<fs::File, StagingError> {
        use std::os::unix::fs::OpenOptionsExt;
        let mut options = fs::OpenOptions::new();
        options.create(true).mode(0o600);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        Ok(options.open(&self.staged).await?)
    }

    /// Promote the staged file to the visible path.
    pub async fn promote(self) -> Result<PathBuf, StagingError> {
        fs::rename(&self.staged, &self.visible).await?;
        Ok(self.visible)
    }

    /// Promote, but only when the visible path is still absent.
    ///
    /// Two writers racing on the same resumable chunk are serialized here:
    /// the loser finds the destination settled, destroys its own copy, and
    /// reports the conflict.
    pub async fn promote_new(self) -> Result<PathBuf, StagingError> {
        if fs::metadata(&self.visible).await.is_ok() {
            self.destroy().await;
            return Err(StagingError::AlreadySettled);
        }
        fs::rename(&self.staged, &self.visible).await?;
        Ok(self.visible)
    }

    /// Remove the staged file. Nothing becomes visible.
    pub async fn destroy(self) {
        if let Err(e) = fs::remove_file(&self.staged).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    target: "staging",
                    staged = %self.staged.display(),
                    error = %e,
                    "Failed to remove staged file"
                );
            }
        }
    }
}

/// True when `candidate` is `<name>.<uuid>.part`.
pub(crate) fn is_staged_twin(candidate: &str, name: &str) -> bool {
    candidate
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(".part"))
        .map(|middle| Uuid::parse_str(middle).is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_write_then_promote() {
        let dir = tempdir().unwrap();
        let visible = dir.path().join("data.bin");
        let staged = StagedFile::begin(visible.clone()).await.unwrap();
        let mut file = staged.open(true).await.unwrap();
        file.write_all(b"hello").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        // nothing visible until promotion
        assert!(!visible.exists());
        let settled = staged.promote().await.unwrap();
        assert_eq!(settled, visible);
        assert_eq!(std::fs::read(&visible).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_append_continues_existing_file() {
        let dir = tempdir().unwrap();
        let visible = dir.path().join("log.txt");
        std::fs::write(&visible, b"first;").unwrap();
        let staged = StagedFile::begin(visible.clone()).await.unwrap();
        // the original file moved aside: observers see nothing settled
        assert!(!visible.exists());
        let mut file = staged.open(false).await.unwrap();
        file.write_all(b"second").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        staged.promote().await.unwrap();
        assert_eq!(std::fs::read(&visible).unwrap(), b"first;second");
    }

    #[tokio::test]
    async fn test_truncate_discards_existing_bytes() {
        let dir = tempdir().unwrap();
        let visible = dir.path().join("data.bin");
        std::fs::write(&visible, b"old-content").unwrap();
        let staged = StagedFile::begin(visible.clone()).await.unwrap();
        let mut file = staged.open(true).await.unwrap();
        file.write_all(b"new").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        staged.promote().await.unwrap();
        assert_eq!(std::fs::read(&visible).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_active_writer_conflict() {
        let dir = tempdir().unwrap();
        let visible = dir.path().join("data.bin");
        let first = StagedFile::begin(visible.clone()).await.unwrap();
        first.open(true).await.unwrap();
        let second = StagedFile::begin(visible.clone()).await;
        assert!(matches!(second, Err(StagingError::ActiveWriter)));
        first.destroy().await;
        // after cleanup the path is writable again
        assert!(StagedFile::begin(visible).await.is_ok());
    }

    #[tokio::test]
    async fn test_unrelated_part_names_do_not_conflict() {
        let dir = tempdir().unwrap();
        // a staged twin of chunk 12 must not block chunk 1
        let other = dir
            .path()
            .join(format!("f.chunk.12.{}.part", Uuid::new_v4()));
        std::fs::write(&other, b"x").unwrap();
        let visible = dir.path().join("f.chunk.1");
        assert!(StagedFile::begin(visible).await.is_ok());
    }

    #[tokio::test]
    async fn test_promote_new_loses_race() {
        let dir = tempdir().unwrap();
        let visible = dir.path().join("f.chunk.1");
        let staged = StagedFile::begin(visible.clone()).await.unwrap();
        let mut file = staged.open(true).await.unwrap();
        file.write_all(b"dup").await.unwrap();
        drop(file);
        // the other writer settles first
        std::fs::write(&visible, b"winner").unwrap();
        let err = staged.promote_new().await;
        assert!(matches!(err, Err(StagingError::AlreadySettled)));
        assert_eq!(std::fs::read(&visible).unwrap(), b"winner");
        // the loser's staged copy is gone
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_destroy_removes_staged_file() {
        let dir = tempdir().unwrap();
        let visible = dir.path().join("data.bin");
        let staged = StagedFile::begin(visible.clone()).await.unwrap();
        let mut file = staged.open(true).await.unwrap();
        file.write_all(b"partial").await.unwrap();
        drop(file);
        staged.destroy().await;
        assert!(!visible.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
