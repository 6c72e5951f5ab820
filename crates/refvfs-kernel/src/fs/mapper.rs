//! Key/value view of a filesystem subtree.

use indexmap::IndexMap;

use super::{ReferenceFileSystem, join, relative_to};
use crate::batch::{BatchResult, OnError};
use crate::error::RefResult;
use crate::mapping::normalize_key;

/// Keys are paths relative to `root`.
#[derive(Debug)]
pub struct FsMapper<'a> {
    fs: &'a ReferenceFileSystem,
    root: String,
}

impl<'a> FsMapper<'a> {
    pub(crate) fn new(fs: &'a ReferenceFileSystem, root: &str) -> Self {
        Self {
            fs,
            root: normalize_key(root).to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn full(&self, key: &str) -> String {
        join(&self.root, key)
    }

    pub async fn get(&self, key: &str) -> RefResult<Vec<u8>> {
        self.fs.cat(&self.full(key)).await
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.fs.isfile(&self.full(key)).await
    }

    pub fn set(&self, key: &str, data: impl Into<Vec<u8>>) -> RefResult<()> {
        self.fs.pipe(&self.full(key), data)
    }

    pub async fn delete(&self, key: &str) -> RefResult<()> {
        self.fs.rm(&self.full(key), false).await
    }

    /// Batch fetch; the result is keyed by the relative keys given.
    pub async fn getitems(&self, keys: &[&str], on_error: OnError) -> RefResult<BatchResult> {
        let full: Vec<String> = keys.iter().map(|k| self.full(k)).collect();
        let fetched = self.fs.cat_many(full.clone(), on_error).await?;
        let back: IndexMap<&str, &str> = full
            .iter()
            .map(String::as_str)
            .zip(keys.iter().copied())
            .collect();
        Ok(fetched
            .into_iter()
            .map(|(path, outcome)| {
                let key = back.get(path.as_str()).map_or(path.clone(), |k| k.to_string());
                (key, outcome)
            })
            .collect())
    }

    /// Every file below the root, relative to it. Sorted.
    pub async fn keys(&self) -> RefResult<Vec<String>> {
        if !self.root.is_empty() && !self.fs.isdir(&self.root) {
            return Ok(Vec::new());
        }
        let found = self.fs.find(&self.root, false, false).await?;
        Ok(found
            .into_iter()
            .filter_map(|info| relative_to(&info.name, &self.root).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mapper_view() {
        let fs = ReferenceFileSystem::builder()
            .document(json!({
                "group/.zattrs": {"title": "x"},
                "group/data/0": "zero",
                "other": "o",
            }))
            .build()
            .await
            .unwrap();

        let m = fs.get_mapper("/group/");
        assert_eq!(m.root(), "group");
        assert_eq!(m.get("data/0").await.unwrap(), b"zero");
        assert!(m.contains(".zattrs").await);
        assert!(!m.contains("other").await);
        assert_eq!(m.keys().await.unwrap(), vec![".zattrs", "data/0"]);

        let got = m
            .getitems(&["data/0", "data/1"], OnError::Omit)
            .await
            .unwrap();
        assert_eq!(got.keys().collect::<Vec<_>>(), vec!["data/0"]);

        m.set("data/1", "one").unwrap();
        assert_eq!(fs.cat("group/data/1").await.unwrap(), b"one");
        m.delete("data/1").await.unwrap();
        assert!(!m.contains("data/1").await);
    }
}
