//! On-storage layout and key routing for the lazy mapper.
//!
//! ```text
//! <root>/.zmetadata               root metadata (JSON)
//! <root>/<array>/refs.<n>.page    page n of <array> (postcard rows)
//! ```
//!
//! A key `<array>/<i>.<j>...` whose array has `<array>/.zarray` metadata
//! (with `shape` and `chunks`) is a chunk key: its C-order index over the
//! chunk grid picks page `index / record_size`, row `index % record_size`.
//! Everything else is a loose key stored inline in root metadata.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::entry::ReferenceEntry;

/// Name of the root metadata object, also exposed as a key.
pub const ROOT_METADATA: &str = ".zmetadata";

/// Per-array metadata key.
pub const ARRAY_METADATA: &str = ".zarray";

/// Default rows per page.
pub const DEFAULT_RECORD_SIZE: usize = 10_000;

/// Persisted root metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootMetadata {
    /// Loose references in legacy entry form.
    #[serde(default)]
    pub metadata: IndexMap<String, Value>,
    #[serde(default = "consolidated_format")]
    pub zarr_consolidated_format: u32,
    pub record_size: usize,
    /// Pages known to exist, per array. `None` in layouts written without
    /// a catalog; every page of the grid is then assumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<BTreeMap<String, BTreeSet<u64>>>,
}

fn consolidated_format() -> u32 {
    1
}

impl RootMetadata {
    pub fn empty(record_size: usize) -> Self {
        Self {
            metadata: IndexMap::new(),
            zarr_consolidated_format: 1,
            record_size,
            pages: Some(BTreeMap::new()),
        }
    }
}

/// Shape and chunking of one array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayMeta {
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
}

impl ArrayMeta {
    /// Read `shape`/`chunks` from a `.zarray` entry. Only inline entries
    /// can be inspected without I/O.
    pub fn from_entry(entry: &ReferenceEntry) -> Option<Self> {
        let value: Value = match entry {
            ReferenceEntry::Structured(v) => v.clone(),
            other => serde_json::from_slice(&other.inline_bytes("").ok()??).ok()?,
        };
        let dims = |field: &str| -> Option<Vec<u64>> {
            value
                .get(field)?
                .as_array()?
                .iter()
                .map(Value::as_u64)
                .collect()
        };
        let shape = dims("shape")?;
        let chunks = dims("chunks")?;
        (shape.len() == chunks.len()).then_some(Self { shape, chunks })
    }

    /// Number of chunks along each axis.
    pub fn grid(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(&s, &c)| if c == 0 { 0 } else { s.div_ceil(c) })
            .collect()
    }

    /// Total chunk count (1 for a scalar array).
    pub fn chunk_count(&self) -> u64 {
        self.grid().iter().product()
    }

    /// C-order index of a chunk name such as `1.0.3`.
    pub fn ravel(&self, name: &str) -> Option<u64> {
        let grid = self.grid();
        if grid.is_empty() {
            return (name == "0").then_some(0);
        }
        let parts: Vec<u64> = name
            .split('.')
            .map(|p| {
                (!p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
                    .then(|| p.parse::<u64>().ok())
                    .flatten()
            })
            .collect::<Option<_>>()?;
        if parts.len() != grid.len() {
            return None;
        }
        let mut index = 0u64;
        for (&i, &n) in parts.iter().zip(&grid) {
            if i >= n {
                return None;
            }
            index = index.checked_mul(n)?.checked_add(i)?;
        }
        Some(index)
    }

    /// Inverse of [`ArrayMeta::ravel`].
    pub fn unravel(&self, mut index: u64) -> String {
        let grid = self.grid();
        if grid.is_empty() {
            return "0".to_string();
        }
        let mut parts = vec![0u64; grid.len()];
        for (slot, &n) in parts.iter_mut().zip(&grid).rev() {
            *slot = index % n;
            index /= n;
        }
        parts
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Where a key lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Loose,
    Paged { array: String, page: u64, row: usize },
}

/// `(array, chunk name)` for keys shaped like chunk keys.
pub fn split_chunk_key(key: &str) -> Option<(&str, &str)> {
    let (array, name) = key.rsplit_once('/')?;
    let looks_numeric = name
        .bytes()
        .next()
        .is_some_and(|b| b.is_ascii_digit());
    (looks_numeric && !array.is_empty()).then_some((array, name))
}

/// Route a chunk index to its page and row.
pub fn page_of(index: u64, record_size: usize) -> (u64, usize) {
    let rs = record_size.max(1) as u64;
    (index / rs, (index % rs) as usize)
}

pub fn join(root: &str, rest: &str) -> String {
    if root.is_empty() {
        rest.to_string()
    } else {
        format!("{root}/{rest}")
    }
}

pub fn root_metadata_path(root: &str) -> String {
    join(root, ROOT_METADATA)
}

pub fn page_path(root: &str, array: &str, page: u64) -> String {
    join(root, &format!("{array}/refs.{page}.page"))
}

pub fn array_metadata_key(array: &str) -> String {
    format!("{array}/{ARRAY_METADATA}")
}
