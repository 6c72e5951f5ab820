//! Local filesystem backend.
//!
//! Provides access to real filesystem paths, with path security
//! to prevent escaping the root directory.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::VfsOps;
use crate::vfs::types::{DirEntry, FileAttr, FileType};

/// Local filesystem backend.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/data/archive`, then `read("run1/chunks.bin")` reads
/// `/data/archive/run1/chunks.bin`. The router builds the `file`
/// protocol backend rooted at `/`, so absolute locators work unchanged.
///
/// Path security is enforced: attempts to escape via `..` are blocked.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    read_only: bool,
}

impl LocalBackend {
    /// Create a new local filesystem rooted at the given path.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            read_only: false,
        }
    }

    /// Create a read-only local filesystem.
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::new(root)
        }
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to an absolute path within the root.
    ///
    /// Returns an error if the path escapes the root (via `..` or a
    /// symlink pointing outside).
    async fn resolve(&self, path: &Path) -> VfsResult<PathBuf> {
        let mut relative = PathBuf::new();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(VfsError::path_escapes_root(path.display().to_string()));
                    }
                }
                Component::Normal(s) => relative.push(s),
            }
        }

        if relative.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }

        let full = self.root.join(&relative);

        // Canonicalize the deepest existing ancestor so symlinks are
        // followed before the containment check.
        let mut existing = full.as_path();
        let mut tail = Vec::new();
        while fs::symlink_metadata(existing).await.is_err() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name.to_owned());
                    existing = parent;
                }
                _ => break,
            }
        }
        let mut canonical = fs::canonicalize(existing).await.map_err(VfsError::from)?;
        for name in tail.into_iter().rev() {
            canonical.push(name);
        }

        if !canonical.starts_with(&self.root) {
            return Err(VfsError::path_escapes_root(format!(
                "{} is not under {}",
                canonical.display(),
                self.root.display()
            )));
        }

        Ok(canonical)
    }

    /// Check if write operations are allowed.
    fn check_writable(&self) -> VfsResult<()> {
        if self.read_only {
            Err(VfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Convert std::fs::Metadata to FileAttr.
    fn metadata_to_attr(meta: &std::fs::Metadata) -> FileAttr {
        let kind = if meta.is_dir() {
            FileType::Directory
        } else {
            FileType::File
        };

        FileAttr {
            size: if meta.is_dir() { 0 } else { meta.len() },
            kind,
        }
    }
}

#[async_trait]
impl VfsOps for LocalBackend {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path).await?;
        let meta = fs::metadata(&full_path).await.map_err(VfsError::from)?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let full_path = self.resolve(path).await?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full_path).await.map_err(VfsError::from)?;

        while let Some(entry) = dir.next_entry().await.map_err(VfsError::from)? {
            // Follow symlinks so a linked directory lists as a directory.
            let kind = match fs::metadata(entry.path()).await {
                Ok(meta) if meta.is_dir() => FileType::Directory,
                _ => FileType::File,
            };

            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &Path, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        let full_path = self.resolve(path).await?;
        let mut file = fs::File::open(&full_path).await.map_err(VfsError::from)?;

        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(VfsError::from)?;

        let mut buffer = Vec::new();
        file.take(size)
            .read_to_end(&mut buffer)
            .await
            .map_err(VfsError::from)?;

        Ok(buffer)
    }

    async fn write_all(&self, path: &Path, data: &[u8]) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path).await?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(VfsError::from)?;
        }

        fs::write(&full_path, data).await.map_err(VfsError::from)
    }

    async fn mkdir(&self, path: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path).await?;
        fs::create_dir_all(&full_path).await.map_err(VfsError::from)
    }

    async fn unlink(&self, path: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path).await?;
        fs::remove_file(&full_path).await.map_err(VfsError::from)
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
