//! Turning a resolved entry into bytes.
//!
//! In-memory kinds never touch a backend. Remote ranged entries cost one
//! bounded read; whole-target entries read the full resource.
//! [`ReferenceFile`] gives random access in the reference's own
//! coordinates: position 0 is the target's `offset`, and the declared
//! `length` is end-of-file even when the resource is longer.

use futures::stream::{self, Stream};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use crate::entry::ReferenceEntry;
use crate::error::{RefError, RefResult};
use crate::router::BackendRouter;
use crate::vfs::{VfsError, VfsOps};

/// Fail entries whose locator kept a placeholder through expansion.
pub fn check_resolved(path: &str, unresolved: Option<&str>) -> RefResult<()> {
    match unresolved {
        Some(placeholder) => Err(RefError::UnresolvedTemplate {
            path: path.to_string(),
            placeholder: placeholder.to_string(),
        }),
        None => Ok(()),
    }
}

fn unreachable(path: &str, locator: &str, source: VfsError) -> RefError {
    RefError::TargetUnreachable {
        path: path.to_string(),
        locator: locator.to_string(),
        source,
    }
}

/// Map `start`/`end` (negative counts from the end) onto `0..=size`.
pub fn clamp_bounds(start: Option<i64>, end: Option<i64>, size: u64) -> (u64, u64) {
    let size_i = i64::try_from(size).unwrap_or(i64::MAX);
    let fix = |v: i64| -> u64 {
        let v = if v < 0 { size_i.saturating_add(v) } else { v };
        v.clamp(0, size_i) as u64
    };
    let start = start.map(fix).unwrap_or(0);
    let end = end.map(fix).unwrap_or(size);
    (start, end.max(start))
}

/// Full bytes of an entry.
pub async fn materialize(
    router: &BackendRouter,
    path: &str,
    entry: &ReferenceEntry,
) -> RefResult<Vec<u8>> {
    if let Some(bytes) = entry.inline_bytes(path)? {
        return Ok(bytes);
    }
    let ReferenceEntry::Remote { locator, range } = entry else {
        return Err(RefError::decode(path, "entry has no bytes"));
    };
    let (backend, rel) = router.resolve(path, locator)?;
    let rel = Path::new(&rel);
    let result = match range {
        Some(r) => {
            tracing::trace!(path, locator, offset = r.offset, length = r.length, "range read");
            backend.read(rel, r.offset, r.length).await
        }
        None => {
            tracing::trace!(path, locator, "whole-target read");
            backend.read_all(rel).await
        }
    };
    result.map_err(|e| unreachable(path, locator, e))
}

/// Size of an entry; whole-target remotes need a backend stat.
pub async fn entry_size(
    router: &BackendRouter,
    path: &str,
    entry: &ReferenceEntry,
) -> RefResult<u64> {
    if let Some(size) = entry.known_size() {
        return Ok(size);
    }
    match entry {
        ReferenceEntry::Remote { locator, .. } => {
            let (backend, rel) = router.resolve(path, locator)?;
            let attr = backend
                .getattr(Path::new(&rel))
                .await
                .map_err(|e| unreachable(path, locator, e))?;
            Ok(attr.size)
        }
        // Inline kinds only lack a size when their bytes are undecodable.
        other => other.inline_bytes(path)?.map(|b| b.len() as u64).ok_or_else(|| {
            RefError::decode(path, "entry has no size")
        }),
    }
}

/// Bytes `[start, end)` of an entry, in the entry's own coordinates.
///
/// Ranged remotes issue a single read narrowed to the requested span.
pub async fn materialize_span(
    router: &BackendRouter,
    path: &str,
    entry: &ReferenceEntry,
    start: Option<i64>,
    end: Option<i64>,
) -> RefResult<Vec<u8>> {
    if start.is_none() && end.is_none() {
        return materialize(router, path, entry).await;
    }
    if let Some(bytes) = entry.inline_bytes(path)? {
        let (s, e) = clamp_bounds(start, end, bytes.len() as u64);
        return Ok(bytes[s as usize..e as usize].to_vec());
    }
    let ReferenceEntry::Remote { locator, range } = entry else {
        return Err(RefError::decode(path, "entry has no bytes"));
    };

    let size = entry_size(router, path, entry).await?;
    let (s, e) = clamp_bounds(start, end, size);
    let base = range.map(|r| r.offset).unwrap_or(0);
    let (backend, rel) = router.resolve(path, locator)?;
    backend
        .read(Path::new(&rel), base + s, e - s)
        .await
        .map_err(|err| unreachable(path, locator, err))
}

enum Source {
    Inline(Vec<u8>),
    Remote {
        backend: Arc<dyn VfsOps>,
        rel: String,
        locator: String,
        base: u64,
    },
}

/// Random-access handle over one reference.
pub struct ReferenceFile {
    path: String,
    source: Source,
    size: u64,
    pos: u64,
}

impl std::fmt::Debug for ReferenceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceFile")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl ReferenceFile {
    /// Open `entry`. Whole-target remotes stat the target once here.
    pub async fn open(
        router: &BackendRouter,
        path: &str,
        entry: &ReferenceEntry,
    ) -> RefResult<Self> {
        let (source, size) = match entry {
            ReferenceEntry::Remote { locator, range } => {
                let (backend, rel) = router.resolve(path, locator)?;
                let (base, size) = match range {
                    Some(r) => (r.offset, r.length),
                    None => {
                        let attr = backend
                            .getattr(Path::new(&rel))
                            .await
                            .map_err(|e| unreachable(path, locator, e))?;
                        (0, attr.size)
                    }
                };
                let source = Source::Remote {
                    backend,
                    rel,
                    locator: locator.clone(),
                    base,
                };
                (source, size)
            }
            inline => {
                let bytes = inline.inline_bytes(path)?.unwrap_or_default();
                let size = bytes.len() as u64;
                (Source::Inline(bytes), size)
            }
        };
        Ok(Self {
            path: path.to_string(),
            source,
            size,
            pos: 0,
        })
    }

    /// Logical path this handle reads.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Logical size (the declared length for ranged references).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current position in local coordinates.
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Read up to `n` bytes; empty at end-of-file.
    pub async fn read(&mut self, n: u64) -> RefResult<Vec<u8>> {
        let remaining = self.size.saturating_sub(self.pos);
        let n = n.min(remaining);
        if n == 0 {
            return Ok(Vec::new());
        }
        let data = match &self.source {
            Source::Inline(bytes) => {
                bytes[self.pos as usize..(self.pos + n) as usize].to_vec()
            }
            Source::Remote {
                backend,
                rel,
                locator,
                base,
            } => backend
                .read(Path::new(rel), base + self.pos, n)
                .await
                .map_err(|e| unreachable(&self.path, locator, e))?,
        };
        self.pos += data.len() as u64;
        Ok(data)
    }

    /// Everything from the current position to end-of-file.
    pub async fn read_to_end(&mut self) -> RefResult<Vec<u8>> {
        let remaining = self.size.saturating_sub(self.pos);
        self.read(remaining).await
    }

    /// Move the position. Seeking past the end is allowed; reads there
    /// return nothing.
    pub fn seek(&mut self, pos: SeekFrom) -> RefResult<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            RefError::Vfs(VfsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("seek before start of {}", self.path),
            )))
        })?;
        self.pos = target;
        Ok(target)
    }

    /// Consume the handle as a stream of chunks of at most `chunk_size` bytes.
    pub fn into_stream(self, chunk_size: u64) -> impl Stream<Item = RefResult<Vec<u8>>> {
        let chunk_size = chunk_size.max(1);
        stream::unfold(Some(self), move |state| async move {
            let mut file = state?;
            match file.read(chunk_size).await {
                Ok(chunk) if chunk.is_empty() => None,
                Ok(chunk) => Some((Ok(chunk), Some(file))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
