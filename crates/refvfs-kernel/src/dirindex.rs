//! Directory tree synthesized from flat reference paths.
//!
//! A prefix is a directory iff some reference path extends it. Directories
//! have no backing entry and report size 0. Children are kept in a
//! `BTreeMap`, so every listing comes out sorted.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{RefError, RefResult};
use crate::mapping::normalize_key;
use crate::vfs::FileType;

/// One listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Full logical path.
    pub name: String,
    pub kind: FileType,
    /// `None` when the size needs backend I/O that was not performed.
    pub size: Option<u64>,
}

impl FileInfo {
    pub fn file(name: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            name: name.into(),
            kind: FileType::File,
            size,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FileType::Directory,
            size: Some(0),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    is_file: bool,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn kind(&self) -> FileType {
        if self.children.is_empty() {
            FileType::File
        } else {
            FileType::Directory
        }
    }
}

/// Prefix trie over reference paths.
#[derive(Debug, Clone, Default)]
pub struct DirIndex {
    root: Node,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    normalize_key(path).split('/').filter(|s| !s.is_empty())
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

impl DirIndex {
    /// Build from every reference path.
    pub fn build<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut root = Node::default();
        for path in paths {
            let mut current = &mut root;
            for segment in segments(path) {
                current = current.children.entry(segment.to_string()).or_default();
            }
            current.is_file = true;
        }
        Self { root }
    }

    fn node(&self, path: &str) -> Option<&Node> {
        let mut current = &self.root;
        for segment in segments(path) {
            current = current.children.get(segment)?;
        }
        Some(current)
    }

    /// True for the root and every proper prefix of a reference path.
    pub fn is_dir(&self, path: &str) -> bool {
        self.node(path)
            .is_some_and(|n| !n.children.is_empty() || normalize_key(path).is_empty())
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.node(path).is_some_and(|n| n.is_file)
    }

    /// Immediate children of a directory; a file lists as itself.
    pub fn ls(&self, path: &str) -> RefResult<Vec<(String, FileType)>> {
        let key = normalize_key(path);
        let node = self.node(key).ok_or_else(|| RefError::not_found(key))?;

        if node.children.is_empty() && !key.is_empty() {
            return Ok(vec![(key.to_string(), FileType::File)]);
        }
        Ok(node
            .children
            .iter()
            .map(|(name, child)| (join(key, name), child.kind()))
            .collect())
    }

    /// Every file below `path`, sorted. With `withdirs`, directories too
    /// (including `path` itself when it is a non-root directory).
    pub fn find(&self, path: &str, withdirs: bool) -> RefResult<Vec<(String, FileType)>> {
        let key = normalize_key(path);
        let node = self.node(key).ok_or_else(|| RefError::not_found(key))?;

        let mut out = Vec::new();
        if node.children.is_empty() {
            if node.is_file {
                out.push((key.to_string(), FileType::File));
            }
            return Ok(out);
        }
        if withdirs && !key.is_empty() {
            out.push((key.to_string(), FileType::Directory));
        }
        Self::walk(node, key, withdirs, &mut out);
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn walk(node: &Node, prefix: &str, withdirs: bool, out: &mut Vec<(String, FileType)>) {
        for (name, child) in &node.children {
            let path = join(prefix, name);
            if child.is_file {
                out.push((path.clone(), FileType::File));
            }
            if !child.children.is_empty() {
                if withdirs {
                    out.push((path.clone(), FileType::Directory));
                }
                Self::walk(child, &path, withdirs, out);
            }
        }
    }
}
