//! Lazy, paginated reference store.
//!
//! For reference sets too large to hold as one document. Chunk keys are
//! grouped into fixed-size pages that load on demand and sit in an LRU
//! cache; everything else is a loose reference kept in root metadata.
//!
//! Writes are buffered per page and become durable only on
//! [`LazyReferenceMapper::flush`]. Another instance opened on the same
//! root sees nothing until then.
//!
//! ```text
//! create ──► (fresh, empty root metadata written)
//! open   ──► (root metadata loaded, no pages)
//! get    ──► dirty buffer → cached page → load page
//! set/delete ──► dirty buffer
//! flush  ──► merge + write each dirty page, then root metadata
//! ```

mod cache;
mod layout;
mod page;

pub use cache::DEFAULT_MAX_PAGES;
pub use layout::{ArrayMeta, DEFAULT_RECORD_SIZE, ROOT_METADATA, RootMetadata};
pub use page::PageRow;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use self::cache::{PageCache, PageKey};
use self::layout::{Route, array_metadata_key, page_of, page_path, root_metadata_path};
use self::page::PageSlots;
use crate::entry::ReferenceEntry;
use crate::error::{RefError, RefResult};
use crate::mapping::normalize_key;
use crate::vfs::VfsOps;

/// Pending edits for one page: row → new entry, or `None` for a delete.
type PageBuffer = BTreeMap<usize, Option<ReferenceEntry>>;

#[derive(Debug)]
struct State {
    loose: IndexMap<String, ReferenceEntry>,
    loose_dirty: bool,
    catalog: Option<BTreeMap<String, BTreeSet<u64>>>,
    dirty: HashMap<PageKey, PageBuffer>,
    cache: PageCache,
    arrays: HashMap<String, Option<ArrayMeta>>,
}

impl State {
    fn array_meta(&mut self, array: &str) -> Option<ArrayMeta> {
        if let Some(found) = self.arrays.get(array) {
            return found.clone();
        }
        let meta = self
            .loose
            .get(&array_metadata_key(array))
            .and_then(ArrayMeta::from_entry);
        self.arrays.insert(array.to_string(), meta.clone());
        meta
    }

    fn route(&mut self, key: &str, record_size: usize) -> Route {
        let Some((array, name)) = layout::split_chunk_key(key) else {
            return Route::Loose;
        };
        let Some(index) = self.array_meta(array).and_then(|m| m.ravel(name)) else {
            return Route::Loose;
        };
        let (page, row) = page_of(index, record_size);
        Route::Paged {
            array: array.to_string(),
            page,
            row,
        }
    }

    /// Move loose keys of `array` that now route to a page into page
    /// buffers. Called when the array's metadata changes.
    fn adopt_loose_chunks(&mut self, array: &str, record_size: usize) -> usize {
        let prefix = format!("{array}/");
        let candidates: Vec<String> = self
            .loose
            .keys()
            .filter(|k| k.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/')))
            .cloned()
            .collect();
        let mut adopted = 0;
        for key in candidates {
            let Route::Paged { array, page, row } = self.route(&key, record_size) else {
                continue;
            };
            if let Some(entry) = self.loose.shift_remove(&key) {
                self.dirty.entry((array, page)).or_default().insert(row, Some(entry));
                self.loose_dirty = true;
                adopted += 1;
            }
        }
        adopted
    }

    fn loose_json(&self) -> Map<String, Value> {
        self.loose
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }

    fn page_known(&self, array: &str, page: u64) -> bool {
        match &self.catalog {
            Some(catalog) => catalog.get(array).is_some_and(|pages| pages.contains(&page)),
            None => true,
        }
    }
}

/// Drop a page from the catalog; true if it was listed.
fn uncatalog(catalog: &mut BTreeMap<String, BTreeSet<u64>>, array: &str, page: u64) -> bool {
    let Some(pages) = catalog.get_mut(array) else {
        return false;
    };
    let removed = pages.remove(&page);
    if pages.is_empty() {
        catalog.remove(array);
    }
    removed
}

/// Paginated reference store over one backend directory.
pub struct LazyReferenceMapper {
    backend: Arc<dyn VfsOps>,
    root: String,
    record_size: usize,
    state: Mutex<State>,
}

impl std::fmt::Debug for LazyReferenceMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyReferenceMapper")
            .field("root", &self.root)
            .field("record_size", &self.record_size)
            .field("cached_pages", &self.state.try_lock().map(|s| s.cache.len()))
            .finish_non_exhaustive()
    }
}

/// What a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub pages_written: usize,
    /// Pages whose rows were all deleted; their files are removed.
    pub pages_removed: usize,
    pub metadata_written: bool,
}

/// Outcome of flushing one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageWrite {
    Written,
    Removed,
}

impl LazyReferenceMapper {
    fn from_metadata(backend: Arc<dyn VfsOps>, root: &str, meta: RootMetadata) -> RefResult<Self> {
        let mut loose = IndexMap::with_capacity(meta.metadata.len());
        for (key, value) in meta.metadata {
            let entry = ReferenceEntry::from_json(&key, &value, None)?;
            loose.insert(key, entry);
        }
        Ok(Self {
            backend,
            root: normalize_key(root).to_string(),
            record_size: meta.record_size.max(1),
            state: Mutex::new(State {
                loose,
                loose_dirty: false,
                catalog: meta.pages,
                dirty: HashMap::new(),
                cache: PageCache::new(DEFAULT_MAX_PAGES),
                arrays: HashMap::new(),
            }),
        })
    }

    /// Initialize an empty store at `root`, replacing any root metadata there.
    #[tracing::instrument(skip(backend), name = "lazy.create")]
    pub async fn create(
        backend: Arc<dyn VfsOps>,
        root: &str,
        record_size: usize,
    ) -> RefResult<Self> {
        let meta = RootMetadata::empty(record_size.max(1));
        let path = root_metadata_path(normalize_key(root));
        let bytes = serde_json::to_vec(&meta)?;
        backend
            .write_all(Path::new(&path), &bytes)
            .await
            .map_err(|e| RefError::storage(&path, e))?;
        tracing::info!(root, record_size, "created lazy reference store");
        Self::from_metadata(backend, root, meta)
    }

    /// Load root metadata only; pages load on first use.
    #[tracing::instrument(skip(backend), name = "lazy.open")]
    pub async fn open(backend: Arc<dyn VfsOps>, root: &str) -> RefResult<Self> {
        let path = root_metadata_path(normalize_key(root));
        let bytes = backend
            .read_all(Path::new(&path))
            .await
            .map_err(|e| RefError::storage(&path, e))?;
        let meta: RootMetadata =
            serde_json::from_slice(&bytes).map_err(|e| RefError::decode(&path, e))?;
        if meta.record_size == 0 {
            return Err(RefError::spec(format!("{path}: record_size must be positive")));
        }
        tracing::debug!(root, loose = meta.metadata.len(), "opened lazy reference store");
        Self::from_metadata(backend, root, meta)
    }

    /// True if `root` holds lazy-store root metadata.
    pub async fn is_store(backend: &dyn VfsOps, root: &str) -> bool {
        let path = root_metadata_path(normalize_key(root));
        backend.exists(Path::new(&path)).await
    }

    /// Bound the clean-page cache.
    pub fn with_cache_size(self, max_pages: usize) -> Self {
        self.state.lock().cache = PageCache::new(max_pages);
        self
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// True when there are unflushed edits.
    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        state.loose_dirty || !state.dirty.is_empty()
    }

    fn consolidated(&self) -> ReferenceEntry {
        let state = self.state.lock();
        let mut doc = Map::new();
        doc.insert("metadata".into(), Value::Object(state.loose_json()));
        doc.insert("zarr_consolidated_format".into(), Value::from(1));
        ReferenceEntry::Structured(Value::Object(doc))
    }

    async fn load_page(&self, array: &str, page: u64) -> RefResult<Arc<PageSlots>> {
        let key: PageKey = (array.to_string(), page);
        {
            let mut state = self.state.lock();
            if let Some(slots) = state.cache.get(&key) {
                return Ok(slots);
            }
            if !state.page_known(array, page) {
                return Ok(Arc::new(Vec::new()));
            }
        }

        let path = page_path(&self.root, array, page);
        let slots = match self.backend.read_all(Path::new(&path)).await {
            Ok(bytes) => page::decode(&path, &bytes)?,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(RefError::storage(&path, e)),
        };
        tracing::debug!(array, page, rows = slots.len(), "loaded page");

        let slots = Arc::new(slots);
        self.state.lock().cache.insert(key, slots.clone());
        Ok(slots)
    }

    /// Look up one key.
    pub async fn get(&self, key: &str) -> RefResult<ReferenceEntry> {
        let key = normalize_key(key);
        if key == ROOT_METADATA {
            return Ok(self.consolidated());
        }

        let (array, page, row) = {
            let mut state = self.state.lock();
            match state.route(key, self.record_size) {
                Route::Loose => {
                    return state
                        .loose
                        .get(key)
                        .cloned()
                        .ok_or_else(|| RefError::not_found(key));
                }
                Route::Paged { array, page, row } => {
                    let pending = state
                        .dirty
                        .get(&(array.clone(), page))
                        .and_then(|buffer| buffer.get(&row).cloned());
                    match pending {
                        Some(Some(entry)) => return Ok(entry),
                        Some(None) => return Err(RefError::not_found(key)),
                        None => {}
                    }
                    // Root metadata written by another layout may hold chunk keys.
                    if let Some(entry) = state.loose.get(key) {
                        return Ok(entry.clone());
                    }
                    (array, page, row)
                }
            }
        };

        let slots = self.load_page(&array, page).await?;
        slots
            .get(row)
            .cloned()
            .flatten()
            .ok_or_else(|| RefError::not_found(key))
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.get(key).await.is_ok()
    }

    /// Buffer a write. Invisible to other instances until [`flush`](Self::flush).
    pub fn set(&self, key: &str, entry: ReferenceEntry) -> RefResult<()> {
        let key = normalize_key(key);
        if key == ROOT_METADATA {
            return Err(RefError::spec(format!("{ROOT_METADATA} is synthesized and read-only")));
        }
        let mut state = self.state.lock();
        match state.route(key, self.record_size) {
            Route::Loose => {
                state.loose.insert(key.to_string(), entry);
                state.loose_dirty = true;
                if let Some(array) = key.strip_suffix(&format!("/{}", layout::ARRAY_METADATA)) {
                    state.arrays.remove(array);
                    let adopted = state.adopt_loose_chunks(array, self.record_size);
                    if adopted > 0 {
                        tracing::debug!(array, adopted, "moved loose chunk keys into pages");
                    }
                }
            }
            Route::Paged { array, page, row } => {
                if state.loose.shift_remove(key).is_some() {
                    state.loose_dirty = true;
                }
                state
                    .dirty
                    .entry((array, page))
                    .or_default()
                    .insert(row, Some(entry));
            }
        }
        Ok(())
    }

    /// Buffer a delete. `KeyNotFound` if the key does not exist.
    pub async fn delete(&self, key: &str) -> RefResult<()> {
        let key = normalize_key(key);
        if key == ROOT_METADATA {
            return Err(RefError::spec(format!("{ROOT_METADATA} is synthesized and read-only")));
        }
        // Existence check may load the page.
        self.get(key).await?;

        let mut state = self.state.lock();
        match state.route(key, self.record_size) {
            Route::Loose => {
                if let Some(array) = key.strip_suffix(&format!("/{}", layout::ARRAY_METADATA)) {
                    state.arrays.remove(array);
                }
                state.loose.shift_remove(key);
                state.loose_dirty = true;
            }
            Route::Paged { array, page, row } => {
                if state.loose.shift_remove(key).is_some() {
                    state.loose_dirty = true;
                }
                state
                    .dirty
                    .entry((array, page))
                    .or_default()
                    .insert(row, None);
            }
        }
        Ok(())
    }

    /// Write every dirty page, then root metadata.
    ///
    /// Each page write is independent: a failed page stays dirty and the
    /// first error is returned after the rest have been attempted. With
    /// nothing dirty this performs no I/O.
    #[tracing::instrument(skip(self), name = "lazy.flush", fields(root = %self.root))]
    pub async fn flush(&self) -> RefResult<FlushStats> {
        let (pending, loose_dirty): (Vec<(PageKey, PageBuffer)>, bool) = {
            let state = self.state.lock();
            let pending = state
                .dirty
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (pending, state.loose_dirty)
        };

        if pending.is_empty() && !loose_dirty {
            return Ok(FlushStats::default());
        }

        let mut stats = FlushStats::default();
        let mut first_error = None;
        let mut catalog_changed = false;

        for ((array, page), buffer) in pending {
            match self.write_page(&array, page, &buffer).await {
                Ok(outcome) => {
                    match outcome {
                        PageWrite::Written => stats.pages_written += 1,
                        PageWrite::Removed => stats.pages_removed += 1,
                    }
                    let mut state = self.state.lock();
                    // Drop only the rows we wrote; later edits stay pending.
                    let key = (array.clone(), page);
                    if let Some(current) = state.dirty.get_mut(&key) {
                        current.retain(|row, value| buffer.get(row) != Some(&*value));
                        if current.is_empty() {
                            state.dirty.remove(&key);
                        }
                    }
                    if let Some(catalog) = state.catalog.as_mut() {
                        catalog_changed |= match outcome {
                            PageWrite::Written => catalog.entry(array).or_default().insert(page),
                            PageWrite::Removed => uncatalog(catalog, &array, page),
                        };
                    }
                }
                Err(e) => {
                    tracing::warn!(%array, page, error = %e, "page flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if loose_dirty || catalog_changed {
            match self.write_root_metadata().await {
                Ok(()) => stats.metadata_written = true,
                Err(e) => {
                    tracing::warn!(error = %e, "root metadata flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(
            pages = stats.pages_written,
            removed = stats.pages_removed,
            metadata = stats.metadata_written,
            "flushed lazy reference store"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    async fn write_page(
        &self,
        array: &str,
        page: u64,
        buffer: &PageBuffer,
    ) -> RefResult<PageWrite> {
        let persisted = self.load_page(array, page).await?;
        let mut slots: PageSlots = persisted.as_ref().clone();
        for (&row, value) in buffer {
            if slots.len() <= row {
                slots.resize(row + 1, None);
            }
            slots[row] = value.clone();
        }
        // Trailing empty rows carry no information.
        while slots.last().is_some_and(Option::is_none) {
            slots.pop();
        }

        let path = page_path(&self.root, array, page);
        let outcome = if slots.is_empty() {
            match self.backend.unlink(Path::new(&path)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(RefError::storage(&path, e)),
            }
            tracing::debug!(array, page, "removed empty page");
            PageWrite::Removed
        } else {
            let bytes = page::encode(&path, &slots)?;
            self.backend
                .write_all(Path::new(&path), &bytes)
                .await
                .map_err(|e| RefError::storage(&path, e))?;
            PageWrite::Written
        };

        self.state
            .lock()
            .cache
            .insert((array.to_string(), page), Arc::new(slots));
        Ok(outcome)
    }

    async fn write_root_metadata(&self) -> RefResult<()> {
        let (bytes, loose_snapshot) = {
            let state = self.state.lock();
            let meta = RootMetadata {
                metadata: state.loose_json().into_iter().collect(),
                zarr_consolidated_format: 1,
                record_size: self.record_size,
                pages: state.catalog.clone(),
            };
            (serde_json::to_vec(&meta)?, state.loose.clone())
        };
        let path = root_metadata_path(&self.root);
        self.backend
            .write_all(Path::new(&path), &bytes)
            .await
            .map_err(|e| RefError::storage(&path, e))?;

        let mut state = self.state.lock();
        if state.loose == loose_snapshot {
            state.loose_dirty = false;
        }
        Ok(())
    }

    /// Every key, derived from metadata and pending edits without loading
    /// page contents. Sorted.
    ///
    /// Rows of a known page are listed whether or not they hold a
    /// reference; `get` is the authority on presence.
    pub fn keys(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let mut out: BTreeSet<String> = state.loose.keys().cloned().collect();
        out.insert(ROOT_METADATA.to_string());

        let mut pages: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
        for (array, page) in state.dirty.keys() {
            pages.entry(array.clone()).or_default().insert(*page);
        }
        let arrays: Vec<String> = match &state.catalog {
            Some(catalog) => {
                for (array, known) in catalog {
                    pages.entry(array.clone()).or_default().extend(known);
                }
                pages.keys().cloned().collect()
            }
            None => state
                .loose
                .keys()
                .filter_map(|k| k.strip_suffix(&format!("/{}", layout::ARRAY_METADATA)))
                .map(str::to_string)
                .chain(pages.keys().cloned())
                .collect(),
        };

        let rs = self.record_size as u64;
        for array in arrays {
            let Some(meta) = state.array_meta(&array) else {
                continue;
            };
            let total = meta.chunk_count();
            let page_numbers: Vec<u64> = match (&state.catalog, pages.get(&array)) {
                (None, listed) => {
                    let all = total.div_ceil(rs);
                    (0..all).chain(listed.into_iter().flatten().copied()).collect()
                }
                (Some(_), Some(listed)) => listed.iter().copied().collect(),
                (Some(_), None) => Vec::new(),
            };
            for page in page_numbers {
                let buffer = state.dirty.get(&(array.clone(), page));
                let start = page * rs;
                let end = ((page + 1) * rs).min(total);
                for index in start..end {
                    let row = (index - start) as usize;
                    if buffer.is_some_and(|b| matches!(b.get(&row), Some(None))) {
                        continue;
                    }
                    out.insert(format!("{array}/{}", meta.unravel(index)));
                }
            }
        }
        out.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryBackend;
    use serde_json::json;

    async fn fresh(record_size: usize) -> (Arc<dyn VfsOps>, LazyReferenceMapper) {
        let backend: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
        let mapper = LazyReferenceMapper::create(backend.clone(), "out", record_size)
            .await
            .unwrap();
        mapper
            .set(
                "data/.zarray",
                ReferenceEntry::Structured(json!({"shape": [10], "chunks": [1]})),
            )
            .unwrap();
        (backend, mapper)
    }

    #[tokio::test]
    async fn test_create_writes_empty_metadata() {
        let backend: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
        LazyReferenceMapper::create(backend.clone(), "out", 4).await.unwrap();
        assert!(LazyReferenceMapper::is_store(backend.as_ref(), "out").await);

        let reopened = LazyReferenceMapper::open(backend, "out").await.unwrap();
        assert_eq!(reopened.record_size(), 4);
        assert_eq!(reopened.keys(), vec![ROOT_METADATA.to_string()]);
    }

    #[tokio::test]
    async fn test_set_visible_locally_then_durable_after_flush() {
        let (backend, mapper) = fresh(4).await;
        mapper.set("data/5", ReferenceEntry::literal("five")).unwrap();
        assert_eq!(mapper.get("data/5").await.unwrap(), ReferenceEntry::literal("five"));

        let other = LazyReferenceMapper::open(backend.clone(), "out").await.unwrap();
        assert!(other.get("data/5").await.unwrap_err().is_not_found());

        mapper.flush().await.unwrap();
        let other = LazyReferenceMapper::open(backend.clone(), "out").await.unwrap();
        assert_eq!(other.get("data/5").await.unwrap(), ReferenceEntry::literal("five"));
        assert!(backend.exists(Path::new("out/data/refs.1.page")).await);
    }

    #[tokio::test]
    async fn test_delete_then_flush() {
        let (backend, mapper) = fresh(4).await;
        mapper.set("data/0", ReferenceEntry::range("s3://b/k", 0, 10)).unwrap();
        mapper.flush().await.unwrap();

        mapper.delete("data/0").await.unwrap();
        assert!(mapper.get("data/0").await.unwrap_err().is_not_found());
        mapper.flush().await.unwrap();

        let other = LazyReferenceMapper::open(backend, "out").await.unwrap();
        assert!(other.get("data/0").await.unwrap_err().is_not_found());
        assert!(other.delete("data/0").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_flush_idempotent() {
        let (_backend, mapper) = fresh(4).await;
        mapper.set("data/1", ReferenceEntry::literal("x")).unwrap();
        let first = mapper.flush().await.unwrap();
        assert_eq!(first.pages_written, 1);
        assert!(first.metadata_written);
        assert!(!mapper.is_dirty());

        let second = mapper.flush().await.unwrap();
        assert_eq!(second, FlushStats::default());
    }

    #[tokio::test]
    async fn test_merge_preserves_persisted_rows() {
        let (backend, mapper) = fresh(4).await;
        mapper.set("data/0", ReferenceEntry::literal("a")).unwrap();
        mapper.flush().await.unwrap();

        let other = LazyReferenceMapper::open(backend.clone(), "out").await.unwrap();
        other.set("data/2", ReferenceEntry::literal("c")).unwrap();
        other.flush().await.unwrap();

        let third = LazyReferenceMapper::open(backend, "out").await.unwrap();
        assert_eq!(third.get("data/0").await.unwrap(), ReferenceEntry::literal("a"));
        assert_eq!(third.get("data/2").await.unwrap(), ReferenceEntry::literal("c"));
    }

    #[tokio::test]
    async fn test_loose_keys_and_consolidated() {
        let (backend, mapper) = fresh(4).await;
        mapper
            .set(".zgroup", ReferenceEntry::Structured(json!({"zarr_format": 2})))
            .unwrap();
        mapper.flush().await.unwrap();

        let other = LazyReferenceMapper::open(backend, "out").await.unwrap();
        let ReferenceEntry::Structured(doc) = other.get(ROOT_METADATA).await.unwrap() else {
            panic!("consolidated metadata should be structured");
        };
        assert_eq!(doc["zarr_consolidated_format"], json!(1));
        assert_eq!(doc["metadata"][".zgroup"], json!({"zarr_format": 2}));
        assert!(other.set(ROOT_METADATA, ReferenceEntry::literal("x")).is_err());
    }

    #[tokio::test]
    async fn test_keys_from_catalog_without_loading() {
        let (backend, mapper) = fresh(4).await;
        mapper.set("data/0", ReferenceEntry::literal("a")).unwrap();
        mapper.set("data/9", ReferenceEntry::literal("z")).unwrap();
        mapper.flush().await.unwrap();

        let other = LazyReferenceMapper::open(backend, "out").await.unwrap();
        let keys = other.keys();
        // Pages 0 and 2 are catalogued: rows 0..4 and 8..10.
        let expected: Vec<String> = [
            ".zmetadata",
            "data/.zarray",
            "data/0",
            "data/1",
            "data/2",
            "data/3",
            "data/8",
            "data/9",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(keys, expected);
        assert_eq!(other.state.lock().cache.len(), 0);
    }

    #[tokio::test]
    async fn test_non_chunk_numeric_key_is_loose() {
        let backend: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
        let mapper = LazyReferenceMapper::create(backend.clone(), "", 4).await.unwrap();
        mapper.set("other/0", ReferenceEntry::literal("l")).unwrap();
        mapper.flush().await.unwrap();

        assert!(!backend.exists(Path::new("other/refs.0.page")).await);
        let reopened = LazyReferenceMapper::open(backend, "").await.unwrap();
        assert_eq!(reopened.get("other/0").await.unwrap(), ReferenceEntry::literal("l"));
    }

    #[tokio::test]
    async fn test_chunk_key_set_before_array_metadata() {
        let backend: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
        let mapper = LazyReferenceMapper::create(backend.clone(), "out", 4).await.unwrap();
        mapper.set("data/0", ReferenceEntry::literal("zero")).unwrap();
        assert_eq!(mapper.get("data/0").await.unwrap(), ReferenceEntry::literal("zero"));

        mapper
            .set(
                "data/.zarray",
                ReferenceEntry::Structured(json!({"shape": [100], "chunks": [10]})),
            )
            .unwrap();
        assert_eq!(mapper.get("data/0").await.unwrap(), ReferenceEntry::literal("zero"));
        mapper.flush().await.unwrap();
        assert!(backend.exists(Path::new("out/data/refs.0.page")).await);

        let other = LazyReferenceMapper::open(backend, "out").await.unwrap();
        assert_eq!(other.get("data/0").await.unwrap(), ReferenceEntry::literal("zero"));
        let ReferenceEntry::Structured(doc) = other.get(ROOT_METADATA).await.unwrap() else {
            panic!("consolidated metadata should be structured");
        };
        assert!(doc["metadata"].get("data/0").is_none());
        assert!(other.keys().contains(&"data/0".to_string()));
    }

    #[tokio::test]
    async fn test_out_of_grid_key_is_loose() {
        let (backend, mapper) = fresh(4).await;
        mapper.set("data/42", ReferenceEntry::literal("far")).unwrap();
        let stats = mapper.flush().await.unwrap();
        assert_eq!(stats.pages_written, 0);
        assert!(stats.metadata_written);
        assert!(!backend.exists(Path::new("out/data/refs.10.page")).await);

        let other = LazyReferenceMapper::open(backend, "out").await.unwrap();
        assert_eq!(other.get("data/42").await.unwrap(), ReferenceEntry::literal("far"));
        let ReferenceEntry::Structured(doc) = other.get(ROOT_METADATA).await.unwrap() else {
            panic!("consolidated metadata should be structured");
        };
        assert_eq!(doc["metadata"]["data/42"], json!("far"));
    }

    #[tokio::test]
    async fn test_emptied_page_is_removed() {
        let (backend, mapper) = fresh(4).await;
        mapper.set("data/1", ReferenceEntry::literal("x")).unwrap();
        mapper.flush().await.unwrap();
        assert!(backend.exists(Path::new("out/data/refs.0.page")).await);

        mapper.delete("data/1").await.unwrap();
        let stats = mapper.flush().await.unwrap();
        assert_eq!(stats.pages_written, 0);
        assert_eq!(stats.pages_removed, 1);
        assert!(stats.metadata_written);
        assert!(!backend.exists(Path::new("out/data/refs.0.page")).await);

        let other = LazyReferenceMapper::open(backend, "out").await.unwrap();
        assert_eq!(
            other.keys(),
            vec![ROOT_METADATA.to_string(), "data/.zarray".to_string()]
        );
    }
}
