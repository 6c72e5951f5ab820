//! Blocking facade.
//!
//! Wraps a [`ReferenceFileSystem`] and a private multi-threaded runtime so
//! callers without an executor can use it directly. Batch reads spawn one
//! task per key onto the runtime's workers.
//!
//! Calling any method from inside an async context panics (tokio refuses
//! nested `block_on`); use the async API there.

use indexmap::IndexMap;
use serde_json::Value;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinSet;

use crate::batch::{self, BatchResult, OnError};
use crate::dirindex::FileInfo;
use crate::entry::ReferenceEntry;
use crate::error::{RefError, RefResult};
use crate::fs::{ReferenceFileSystem, ReferenceFsBuilder, ReferenceFsConfig};
use crate::lazy::FlushStats;
use crate::mapping::ReferenceMapping;
use crate::reader::ReferenceFile;
use crate::vfs::VfsError;

fn runtime() -> RefResult<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("refvfs-io")
        .enable_all()
        .build()
        .map_err(|e| RefError::Vfs(VfsError::Io(e)))
}

/// Synchronous API over a [`ReferenceFileSystem`].
pub struct BlockingReferenceFileSystem {
    runtime: Runtime,
    fs: Arc<ReferenceFileSystem>,
}

impl std::fmt::Debug for BlockingReferenceFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingReferenceFileSystem")
            .field("fs", &self.fs)
            .finish_non_exhaustive()
    }
}

impl BlockingReferenceFileSystem {
    /// Build from options. Asynchronous configurations are rejected.
    pub fn new(config: ReferenceFsConfig) -> RefResult<Self> {
        Self::from_builder(ReferenceFsBuilder::from_config(config))
    }

    pub fn from_builder(builder: ReferenceFsBuilder) -> RefResult<Self> {
        let runtime = runtime()?;
        let fs = runtime.block_on(builder.build())?;
        Self::assemble(runtime, fs)
    }

    /// Wrap an already-built filesystem.
    pub fn from_fs(fs: ReferenceFileSystem) -> RefResult<Self> {
        Self::assemble(runtime()?, fs)
    }

    fn assemble(runtime: Runtime, fs: ReferenceFileSystem) -> RefResult<Self> {
        if fs.is_asynchronous() {
            return Err(RefError::AsynchronousMode);
        }
        Ok(Self {
            runtime,
            fs: Arc::new(fs),
        })
    }

    /// The wrapped async filesystem.
    pub fn inner(&self) -> &Arc<ReferenceFileSystem> {
        &self.fs
    }

    pub fn cat(&self, path: &str) -> RefResult<Vec<u8>> {
        self.runtime.block_on(self.fs.cat(path))
    }

    pub fn cat_file(&self, path: &str, start: Option<i64>, end: Option<i64>) -> RefResult<Vec<u8>> {
        self.runtime.block_on(self.fs.cat_file(path, start, end))
    }

    /// Read many keys in parallel on the runtime's worker threads.
    pub fn cat_many<I, S>(&self, keys: I, on_error: OnError) -> RefResult<BatchResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let fs = self.fs.clone();
        let outcomes = self.runtime.block_on(async move {
            let mut tasks = JoinSet::new();
            for (i, key) in keys.iter().enumerate() {
                let fs = fs.clone();
                let key = key.clone();
                tasks.spawn(async move { (i, fs.cat(&key).await) });
            }

            let mut slots: Vec<Option<RefResult<Vec<u8>>>> = keys.iter().map(|_| None).collect();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((i, outcome)) => slots[i] = Some(outcome),
                    Err(e) => tracing::warn!(error = %e, "batch task failed to join"),
                }
            }
            keys.into_iter()
                .zip(slots)
                .map(|(key, slot)| {
                    let outcome = slot.unwrap_or_else(|| {
                        Err(RefError::Vfs(VfsError::other(format!("read of {key} was aborted"))))
                    });
                    (key, outcome)
                })
                .collect::<Vec<_>>()
        });
        batch::apply_policy(outcomes, on_error)
    }

    /// [`cat_many`](Self::cat_many) under `raise`, unwrapped.
    pub fn cat_all<I, S>(&self, keys: I) -> RefResult<IndexMap<String, Vec<u8>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        batch::into_bytes(self.cat_many(keys, OnError::Raise)?)
    }

    pub fn open(&self, path: &str) -> RefResult<BlockingFile> {
        let file = self.runtime.block_on(self.fs.open(path))?;
        Ok(BlockingFile {
            handle: self.runtime.handle().clone(),
            file,
        })
    }

    pub fn ls(&self, path: &str, detail: bool) -> RefResult<Vec<FileInfo>> {
        self.runtime.block_on(self.fs.ls(path, detail))
    }

    pub fn find(&self, path: &str, withdirs: bool, detail: bool) -> RefResult<Vec<FileInfo>> {
        self.runtime.block_on(self.fs.find(path, withdirs, detail))
    }

    pub fn info(&self, path: &str) -> RefResult<FileInfo> {
        self.runtime.block_on(self.fs.info(path))
    }

    pub fn size(&self, path: &str) -> RefResult<u64> {
        self.runtime.block_on(self.fs.size(path))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.runtime.block_on(self.fs.exists(path))
    }

    pub fn isdir(&self, path: &str) -> bool {
        self.fs.isdir(path)
    }

    pub fn isfile(&self, path: &str) -> bool {
        self.runtime.block_on(self.fs.isfile(path))
    }

    pub fn set(&self, path: &str, entry: ReferenceEntry) -> RefResult<()> {
        self.fs.set(path, entry)
    }

    pub fn pipe(&self, path: &str, data: impl Into<Vec<u8>>) -> RefResult<()> {
        self.fs.pipe(path, data)
    }

    pub fn rm(&self, path: &str, recursive: bool) -> RefResult<()> {
        self.runtime.block_on(self.fs.rm(path, recursive))
    }

    pub fn put(&self, source: &str, dest: &str, recursive: bool) -> RefResult<usize> {
        self.runtime.block_on(self.fs.put(source, dest, recursive))
    }

    pub fn get(&self, path: &str, dest: &str, recursive: bool) -> RefResult<usize> {
        self.runtime.block_on(self.fs.get(path, dest, recursive))
    }

    pub fn flush(&self) -> RefResult<FlushStats> {
        self.runtime.block_on(self.fs.flush())
    }

    pub fn references(&self) -> RefResult<ReferenceMapping> {
        self.runtime.block_on(self.fs.references())
    }

    pub fn to_document(&self) -> RefResult<Value> {
        self.runtime.block_on(self.fs.to_document())
    }

    pub fn save_json(&self, locator: &str) -> RefResult<()> {
        self.runtime.block_on(self.fs.save_json(locator))
    }
}

/// A [`ReferenceFile`] driven synchronously; implements [`Read`] and [`Seek`].
pub struct BlockingFile {
    handle: Handle,
    file: ReferenceFile,
}

impl std::fmt::Debug for BlockingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingFile").field("file", &self.file).finish()
    }
}

impl BlockingFile {
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn tell(&self) -> u64 {
        self.file.tell()
    }

    /// Everything from the current position to end-of-file.
    pub fn read_rest(&mut self) -> RefResult<Vec<u8>> {
        self.handle.block_on(self.file.read_to_end())
    }
}

impl Read for BlockingFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self
            .handle
            .block_on(self.file.read(buf.len() as u64))
            .map_err(io::Error::other)?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

impl Seek for BlockingFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file
            .seek(pos)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}
