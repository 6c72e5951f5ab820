//! The reference filesystem.
//!
//! A read-mostly filesystem whose files are synthesized from a mapping of
//! logical path to [`ReferenceEntry`]. Reads go through the
//! [`BackendRouter`]; the directory tree is derived from the key set.
//!
//! ```text
//! ┌───────────────────────┐     ┌──────────────┐
//! │ ReferenceFileSystem   │────►│ DirIndex     │  ls / find / info
//! │  refs: eager | lazy   │     └──────────────┘
//! │                       │     ┌──────────────┐     ┌─────────┐
//! │  cat / open / put ... │────►│ BackendRouter│────►│ VfsOps  │
//! └───────────────────────┘     └──────────────┘     └─────────┘
//! ```

mod config;
mod mapper;

pub use config::{ReferenceFsBuilder, ReferenceFsConfig, ReferenceSource};
pub use mapper::FsMapper;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::batch::{self, BatchResult, OnError};
use crate::dirindex::{DirIndex, FileInfo};
use crate::entry::ReferenceEntry;
use crate::error::{RefError, RefResult};
use crate::lazy::{FlushStats, LazyReferenceMapper, ROOT_METADATA};
use crate::mapping::{ReferenceMapping, normalize_key};
use crate::reader::{self, ReferenceFile};
use crate::router::BackendRouter;
use crate::vfs::{FileType, VfsError, VfsOps};

/// Where the references live.
pub(crate) enum References {
    Eager(RwLock<ReferenceMapping>),
    Lazy(LazyReferenceMapper),
}

impl References {
    pub(crate) fn eager(mapping: ReferenceMapping) -> Self {
        Self::Eager(RwLock::new(mapping))
    }
}

/// Virtual filesystem over a reference mapping.
pub struct ReferenceFileSystem {
    refs: References,
    router: BackendRouter,
    /// Rebuilt lazily after any mutation.
    index: Mutex<Option<Arc<DirIndex>>>,
    asynchronous: bool,
}

impl std::fmt::Debug for ReferenceFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceFileSystem")
            .field("lazy", &self.is_lazy())
            .field("router", &self.router)
            .field("asynchronous", &self.asynchronous)
            .finish_non_exhaustive()
    }
}

fn join(parent: &str, name: &str) -> String {
    let parent = normalize_key(parent);
    let name = normalize_key(name);
    match (parent.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => parent.to_string(),
        (false, false) => format!("{parent}/{name}"),
    }
}

/// `path` relative to the directory `base`, or `None` when outside it.
fn relative_to<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    let base = normalize_key(base);
    if base.is_empty() {
        return Some(path);
    }
    match path.strip_prefix(base) {
        Some("") => Some(""),
        Some(rest) => rest.strip_prefix('/'),
        None => None,
    }
}

fn is_metadata_key(key: &str) -> bool {
    key.rsplit('/').next().is_some_and(|name| name.starts_with('.'))
}

impl ReferenceFileSystem {
    pub fn builder() -> ReferenceFsBuilder {
        ReferenceFsBuilder::new()
    }

    /// Build from serializable options alone.
    pub async fn from_config(config: ReferenceFsConfig) -> RefResult<Self> {
        ReferenceFsBuilder::from_config(config).build().await
    }

    pub(crate) fn assemble(refs: References, router: BackendRouter, asynchronous: bool) -> Self {
        Self {
            refs,
            router,
            index: Mutex::new(None),
            asynchronous,
        }
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.refs, References::Lazy(_))
    }

    pub fn router(&self) -> &BackendRouter {
        &self.router
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// The entry stored at `path`.
    ///
    /// Fails with `UnresolvedTemplate` when the entry's locator kept a
    /// placeholder through expansion.
    pub async fn entry(&self, path: &str) -> RefResult<ReferenceEntry> {
        let key = normalize_key(path);
        match &self.refs {
            References::Eager(mapping) => {
                let mapping = mapping.read();
                let entry = mapping.get(key).ok_or_else(|| RefError::not_found(key))?;
                reader::check_resolved(key, mapping.unresolved(key))?;
                Ok(entry.clone())
            }
            References::Lazy(mapper) => mapper.get(key).await,
        }
    }

    fn index(&self) -> Arc<DirIndex> {
        let mut slot = self.index.lock();
        if let Some(index) = slot.as_ref() {
            return index.clone();
        }
        let index = Arc::new(match &self.refs {
            References::Eager(mapping) => DirIndex::build(mapping.read().keys()),
            References::Lazy(mapper) => {
                let keys = mapper.keys();
                DirIndex::build(keys.iter().map(String::as_str))
            }
        });
        *slot = Some(index.clone());
        index
    }

    fn invalidate_index(&self) {
        *self.index.lock() = None;
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Full contents of one file.
    #[tracing::instrument(skip(self), name = "refs.cat")]
    pub async fn cat(&self, path: &str) -> RefResult<Vec<u8>> {
        let entry = self.entry(path).await?;
        reader::materialize(&self.router, normalize_key(path), &entry).await
    }

    /// Bytes `[start, end)` of one file. Negative bounds count from the end.
    pub async fn cat_file(
        &self,
        path: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> RefResult<Vec<u8>> {
        let entry = self.entry(path).await?;
        reader::materialize_span(&self.router, normalize_key(path), &entry, start, end).await
    }

    /// Many files at once, concurrently. Results follow input order.
    ///
    /// A failing key never affects the others; `on_error` decides whether
    /// it fails the call, appears as an error value, or is dropped.
    pub async fn cat_many<I, S>(&self, keys: I, on_error: OnError) -> RefResult<BatchResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        tracing::debug!(keys = keys.len(), %on_error, "batch cat");
        let this = self;
        let outcomes = batch::fan_out(&keys, move |key| async move { this.cat(&key).await }).await;
        batch::apply_policy(outcomes, on_error)
    }

    /// Random-access handle.
    #[tracing::instrument(skip(self), name = "refs.open")]
    pub async fn open(&self, path: &str) -> RefResult<ReferenceFile> {
        let entry = self.entry(path).await?;
        ReferenceFile::open(&self.router, normalize_key(path), &entry).await
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// `None` for a lazy row that holds no reference: paged listings
    /// name every row of a known page.
    async fn describe(
        &self,
        name: String,
        kind: FileType,
        detail: bool,
    ) -> RefResult<Option<FileInfo>> {
        match kind {
            FileType::Directory => Ok(Some(FileInfo::directory(name))),
            FileType::File if detail => match self.size(&name).await {
                Ok(size) => Ok(Some(FileInfo::file(name, Some(size)))),
                Err(e) if e.is_not_found() && self.is_lazy() => Ok(None),
                Err(e) => Err(e),
            },
            FileType::File => Ok(Some(FileInfo::file(name, None))),
        }
    }

    /// Immediate children of a directory, sorted. A file lists as itself.
    ///
    /// With `detail`, file sizes are filled in; whole-target references
    /// need one backend stat each.
    pub async fn ls(&self, path: &str, detail: bool) -> RefResult<Vec<FileInfo>> {
        let listing = self.index().ls(path)?;
        let mut out = Vec::with_capacity(listing.len());
        for (name, kind) in listing {
            out.extend(self.describe(name, kind, detail).await?);
        }
        Ok(out)
    }

    /// Every file below `path`, sorted; with `withdirs`, directories too.
    pub async fn find(&self, path: &str, withdirs: bool, detail: bool) -> RefResult<Vec<FileInfo>> {
        let listing = self.index().find(path, withdirs)?;
        let mut out = Vec::with_capacity(listing.len());
        for (name, kind) in listing {
            out.extend(self.describe(name, kind, detail).await?);
        }
        Ok(out)
    }

    pub async fn info(&self, path: &str) -> RefResult<FileInfo> {
        let key = normalize_key(path);
        let index = self.index();
        if index.is_file(key) {
            return self
                .describe(key.to_string(), FileType::File, true)
                .await?
                .ok_or_else(|| RefError::not_found(key));
        }
        if index.is_dir(key) {
            return Ok(FileInfo::directory(key));
        }
        Err(RefError::not_found(key))
    }

    /// Logical size of a file.
    pub async fn size(&self, path: &str) -> RefResult<u64> {
        let entry = self.entry(path).await?;
        reader::entry_size(&self.router, normalize_key(path), &entry).await
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.isdir(path) || self.isfile(path).await
    }

    pub fn isdir(&self, path: &str) -> bool {
        self.index().is_dir(path)
    }

    pub async fn isfile(&self, path: &str) -> bool {
        match &self.refs {
            References::Eager(mapping) => mapping.read().contains(path),
            References::Lazy(mapper) => mapper.contains(path).await,
        }
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Insert or replace one reference.
    pub fn set(&self, path: &str, entry: ReferenceEntry) -> RefResult<()> {
        match &self.refs {
            References::Eager(mapping) => mapping.write().insert(path, entry),
            References::Lazy(mapper) => mapper.set(path, entry)?,
        }
        self.invalidate_index();
        Ok(())
    }

    /// Store `data` as a literal reference.
    pub fn pipe(&self, path: &str, data: impl Into<Vec<u8>>) -> RefResult<()> {
        self.set(path, ReferenceEntry::literal(data))
    }

    /// Remove a reference; with `recursive`, everything below a directory.
    ///
    /// Metadata keys (last segment starting with `.`) go after the data
    /// keys beside them, so chunk keys are removed while their array
    /// metadata still routes them.
    pub async fn rm(&self, path: &str, recursive: bool) -> RefResult<()> {
        let key = normalize_key(path);
        let expand = recursive && self.isdir(key);
        let mut targets: Vec<String> = if expand {
            self.index()
                .find(key, false)?
                .into_iter()
                .map(|(name, _)| name)
                .collect()
        } else {
            vec![key.to_string()]
        };
        targets.sort_by_key(|name| is_metadata_key(name));

        let mut removed = 0;
        for target in &targets {
            match &self.refs {
                References::Eager(mapping) => {
                    mapping
                        .write()
                        .remove(target)
                        .ok_or_else(|| RefError::not_found(target.as_str()))?;
                }
                References::Lazy(mapper) => {
                    if target == ROOT_METADATA {
                        continue;
                    }
                    match mapper.delete(target).await {
                        Ok(()) => {}
                        // Listed rows of a known page may be empty.
                        Err(e) if expand && e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            removed += 1;
        }
        self.invalidate_index();
        tracing::debug!(path = key, removed, "removed references");
        Ok(())
    }

    /// Copy a real file (or, with `recursive`, a tree) into the mapping
    /// as literal references under `dest`.
    pub async fn put(&self, source: &str, dest: &str, recursive: bool) -> RefResult<usize> {
        let (backend, rel) = self.router.resolve(source, source)?;
        let attr = backend.getattr(Path::new(&rel)).await?;

        let files = if attr.is_dir() {
            if !recursive {
                return Err(VfsError::is_a_directory(source).into());
            }
            walk_files(backend.as_ref(), &rel).await?
        } else {
            vec![(String::new(), rel)]
        };

        for (suffix, file) in &files {
            let data = backend.read_all(Path::new(file)).await?;
            self.pipe(&join(dest, suffix), data)?;
        }
        tracing::debug!(source, dest, files = files.len(), "put");
        Ok(files.len())
    }

    /// Materialize a reference (or, with `recursive`, a directory of them)
    /// into real files at `dest`.
    pub async fn get(&self, path: &str, dest: &str, recursive: bool) -> RefResult<usize> {
        let key = normalize_key(path);
        let expand = self.isdir(key);
        let listing: Vec<(String, FileType, String)> = if expand {
            if !recursive {
                return Err(VfsError::is_a_directory(key).into());
            }
            self.index()
                .find(key, true)?
                .into_iter()
                .filter_map(|(name, kind)| {
                    let suffix = relative_to(&name, key)?.to_string();
                    Some((suffix, kind, name))
                })
                .collect()
        } else {
            vec![(String::new(), FileType::File, key.to_string())]
        };

        let (backend, rel) = self.router.resolve(dest, dest)?;
        if expand {
            backend.mkdir(Path::new(&rel)).await?;
        }
        let mut copied = 0;
        for (suffix, kind, name) in &listing {
            let target = if suffix.is_empty() {
                rel.clone()
            } else {
                format!("{}/{suffix}", rel.trim_end_matches('/'))
            };
            if kind.is_dir() {
                backend.mkdir(Path::new(&target)).await?;
                continue;
            }
            let data = match self.cat(name).await {
                Ok(data) => data,
                Err(e) if expand && e.is_not_found() && self.is_lazy() => continue,
                Err(e) => return Err(e),
            };
            backend.write_all(Path::new(&target), &data).await?;
            copied += 1;
        }
        tracing::debug!(path = key, dest, files = copied, "get");
        Ok(copied)
    }

    /// Persist buffered lazy-store edits. No-op for in-memory mappings.
    pub async fn flush(&self) -> RefResult<FlushStats> {
        match &self.refs {
            References::Eager(_) => Ok(FlushStats::default()),
            References::Lazy(mapper) => mapper.flush().await,
        }
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Snapshot of every reference.
    ///
    /// For a lazy store this loads every page.
    pub async fn references(&self) -> RefResult<ReferenceMapping> {
        match &self.refs {
            References::Eager(mapping) => Ok(mapping.read().clone()),
            References::Lazy(mapper) => {
                let mut out = ReferenceMapping::new();
                for key in mapper.keys() {
                    if key == ROOT_METADATA {
                        continue;
                    }
                    match mapper.get(&key).await {
                        Ok(entry) => out.insert(key, entry),
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(out)
            }
        }
    }

    /// Versioned document equivalent to the current mapping.
    pub async fn to_document(&self) -> RefResult<Value> {
        Ok(self.references().await?.to_document())
    }

    /// Write [`to_document`](Self::to_document) to `locator`.
    pub async fn save_json(&self, locator: &str) -> RefResult<()> {
        let doc = self.to_document().await?;
        let bytes = serde_json::to_vec(&doc)?;
        let (backend, rel) = self.router.resolve(locator, locator)?;
        backend
            .write_all(Path::new(&rel), &bytes)
            .await
            .map_err(|e| RefError::storage(locator, e))?;
        tracing::info!(locator, bytes = bytes.len(), "saved reference document");
        Ok(())
    }

    /// Key/value view rooted at `root`.
    pub fn get_mapper(&self, root: &str) -> FsMapper<'_> {
        FsMapper::new(self, root)
    }
}

/// Every file under `dir`, as (path relative to `dir`, backend path).
async fn walk_files(backend: &dyn VfsOps, dir: &str) -> RefResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut stack = vec![(String::new(), dir.trim_end_matches('/').to_string())];
    while let Some((prefix, current)) = stack.pop() {
        for entry in backend.readdir(Path::new(&current)).await? {
            let suffix = join(&prefix, &entry.name);
            let full = if current.is_empty() {
                entry.name.clone()
            } else {
                format!("{current}/{}", entry.name)
            };
            if entry.kind.is_dir() {
                stack.push((suffix, full));
            } else {
                out.push((suffix, full));
            }
        }
    }
    out.sort();
    Ok(out)
}
