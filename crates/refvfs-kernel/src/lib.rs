//! # refvfs-kernel
//!
//! A virtual filesystem whose files are references into other storage.
//!
//! A reference document maps logical paths to entries: inline bytes,
//! base64, JSON values, or `[locator, offset, length]` byte ranges of some
//! other resource. The filesystem:
//! - Expands templates and generation rules into a flat mapping at load
//! - Routes each locator's protocol to a [`VfsOps`] backend, built on first use
//! - Reads exactly the referenced range (one backend call per file)
//! - Synthesizes directories from path prefixes
//! - Batches reads concurrently with per-key error isolation
//! - Scales past memory with a paginated, lazily loaded store
//!
//! ```no_run
//! use refvfs_kernel::ReferenceFileSystem;
//! use serde_json::json;
//!
//! # async fn demo() -> refvfs_kernel::RefResult<()> {
//! let fs = ReferenceFileSystem::builder()
//!     .document(json!({"a": "data", "b": ["file:///tmp/blob", 0, 5]}))
//!     .build()
//!     .await?;
//! assert_eq!(fs.cat("a").await?, b"data");
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod blocking;
pub mod dirindex;
pub mod document;
pub mod entry;
pub mod error;
pub mod fs;
pub mod lazy;
pub mod mapping;
pub mod reader;
pub mod router;
pub mod template;
pub mod vfs;

pub use batch::{BatchResult, OnError};
pub use blocking::{BlockingFile, BlockingReferenceFileSystem};
pub use dirindex::{DirIndex, FileInfo};
pub use document::{Dimension, GenerationRule, LoadOptions, ReferenceDocument};
pub use entry::{ByteRange, Locator, ReferenceEntry};
pub use error::{RefError, RefResult};
pub use fs::{FsMapper, ReferenceFileSystem, ReferenceFsBuilder, ReferenceFsConfig, ReferenceSource};
pub use lazy::{FlushStats, LazyReferenceMapper};
pub use mapping::ReferenceMapping;
pub use reader::ReferenceFile;
pub use router::{BackendFactory, BackendRouter, BackendSpec, BuiltinFactory, InstanceCache};
pub use template::{TemplateRenderer, TemplateTable};
pub use vfs::{
    backends::{LocalBackend, MemoryBackend},
    DirEntry, FileAttr, FileType, VfsError, VfsOps, VfsResult,
};
