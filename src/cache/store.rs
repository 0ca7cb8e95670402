//! On-disk content store for rewritten module archives.
//!
//! Archives are written to a uniquely named temp file in the store root and
//! renamed into place only once the whole archive has been produced, so a
//! reader never observes a partial archive.  The key's directories are
//! created at commit time; an aborted write leaves the tree untouched.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

use crate::repository::ModuleCoordinate;

/// Readable handle to a stored archive.
pub type StoredArchive = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid store key segment {0:?}")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Persistent byte store keyed by module coordinate and version.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Open a previously committed archive.  `Ok(None)` on miss.
    async fn open(
        &self,
        coordinate: &ModuleCoordinate,
        version: &str,
    ) -> Result<Option<StoredArchive>, StoreError>;

    /// Begin writing a new archive.  Nothing is visible to [`Self::open`]
    /// until [`StagedArchive::commit`] succeeds.
    async fn create(
        &self,
        coordinate: &ModuleCoordinate,
        version: &str,
    ) -> Result<Box<dyn StagedArchive>, StoreError>;
}

/// An archive being written to a [`ContentStore`].
#[async_trait]
pub trait StagedArchive: Send {
    async fn write_all(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Publish the written bytes under the archive's key.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>);
}

// ---------------------------------------------------------------------------
// Filesystem implementation
// ---------------------------------------------------------------------------

/// [`ContentStore`] rooted at a local directory.
///
/// Layout: `{root}/{system}/{repo}/{module}/{version}.tar.gz`
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Compute the final on-disk path for an archive.
    pub fn archive_path(
        &self,
        coordinate: &ModuleCoordinate,
        version: &str,
    ) -> Result<PathBuf, StoreError> {
        for segment in [
            coordinate.system.as_str(),
            coordinate.repo.as_str(),
            coordinate.module.as_str(),
            version,
        ] {
            validate_key_segment(segment)?;
        }
        Ok(self
            .root
            .join(&coordinate.system)
            .join(&coordinate.repo)
            .join(&coordinate.module)
            .join(format!("{version}.tar.gz")))
    }

    /// Unique temp path directly under the root, so concurrent writers of the
    /// same key never share a file.  Dot-prefixed names cannot collide with a
    /// key directory.
    fn temp_path(&self) -> PathBuf {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(".staged.{}.{n}.tmp", std::process::id()))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn open(
        &self,
        coordinate: &ModuleCoordinate,
        version: &str,
    ) -> Result<Option<StoredArchive>, StoreError> {
        let path = self.archive_path(coordinate, version)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(
        &self,
        coordinate: &ModuleCoordinate,
        version: &str,
    ) -> Result<Box<dyn StagedArchive>, StoreError> {
        let final_path = self.archive_path(coordinate, version)?;
        let tmp_path = self.temp_path();
        let file = tokio::fs::File::create(&tmp_path).await?;

        Ok(Box::new(FsStagedArchive {
            file,
            tmp_path,
            final_path,
        }))
    }
}

struct FsStagedArchive {
    file: tokio::fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

#[async_trait]
impl StagedArchive for FsStagedArchive {
    async fn write_all(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let result = async {
            self.file.flush().await?;
            self.file.sync_all().await?;
            if let Some(parent) = self.final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&self.tmp_path, &self.final_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&self.tmp_path).await;
            return Err(e.into());
        }
        debug!(path = %self.final_path.display(), "archive stored");
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let Self { file, tmp_path, .. } = *self;
        drop(file);
        if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
            warn!(path = %tmp_path.display(), error = %e, "failed to remove partial archive");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Reject anything that could escape the store root or collide with the
/// directory structure.
fn validate_key_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0'])
    {
        return Err(StoreError::InvalidKey(segment.to_string()));
    }
    Ok(())
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
