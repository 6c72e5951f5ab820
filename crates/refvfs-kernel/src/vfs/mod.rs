//! Backend capability layer.
//!
//! Every physical byte a reference points at is fetched through a
//! [`VfsOps`] implementation. The reference machinery never touches disk
//! or the network directly; it asks the router for a backend and calls
//! `read`, `getattr` or `read_all` on it.
//!
//! - [`VfsOps`] - Capability trait (stat, list, range read, whole read, write)
//! - [`MemoryBackend`] - In-memory store (`memory://` locators, testing)
//! - [`LocalBackend`] - Local filesystem access (with path security)
//!
//! ## Design Decisions
//!
//! - **Path-based**: backends see paths relative to their own root, with
//!   the protocol prefix already stripped by the router.
//! - **Explicit offset/size**: a range read is one call, no handle state.

pub mod backends;
mod error;
mod ops;
mod types;

pub use backends::{LocalBackend, MemoryBackend};
pub use error::{VfsError, VfsResult};
pub use ops::VfsOps;
pub use types::{DirEntry, FileAttr, FileType};
