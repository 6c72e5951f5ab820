//! Backend capability trait.

use async_trait::async_trait;
use std::path::Path;

use super::types::{DirEntry, FileAttr};
use super::VfsResult;

/// What a backing resource accessor must be able to do.
///
/// Paths are relative to the backend's root; the router strips the
/// protocol prefix before calling in.
#[async_trait]
pub trait VfsOps: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// Get file attributes.
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr>;

    /// Read directory entries, sorted by name.
    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>>;

    /// Read up to `size` bytes starting at `offset`.
    ///
    /// Returns fewer bytes if EOF is reached.
    async fn read(&self, path: &Path, offset: u64, size: u64) -> VfsResult<Vec<u8>>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Replace the whole contents of a file, creating it (and any missing
    /// parent directories) if needed.
    async fn write_all(&self, path: &Path, data: &[u8]) -> VfsResult<()>;

    /// Create a directory and any missing parents. Existing directories
    /// are not an error.
    async fn mkdir(&self, path: &Path) -> VfsResult<()>;

    /// Remove a file.
    async fn unlink(&self, path: &Path) -> VfsResult<()>;

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Returns true if this filesystem is read-only.
    fn read_only(&self) -> bool;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if a path exists.
    async fn exists(&self, path: &Path) -> bool {
        self.getattr(path).await.is_ok()
    }

    /// Read entire file contents.
    async fn read_all(&self, path: &Path) -> VfsResult<Vec<u8>> {
        let attr = self.getattr(path).await?;
        if attr.is_dir() {
            return Err(super::VfsError::is_a_directory(path.display().to_string()));
        }
        self.read(path, 0, attr.size).await
    }
}
