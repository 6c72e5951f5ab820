//! Lazy, paginated reference stores driven through the filesystem.

use std::path::Path;
use std::sync::Arc;

use refvfs_kernel::lazy::ROOT_METADATA;
use refvfs_kernel::{
    FlushStats, LazyReferenceMapper, MemoryBackend, ReferenceEntry, ReferenceFileSystem, VfsOps,
};
use serde_json::{Value, json};

/// Empty store at `refs` with one 100-element array in 10-element chunks.
async fn store() -> Arc<dyn VfsOps> {
    let mem: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
    let mapper = LazyReferenceMapper::create(mem.clone(), "refs", 10)
        .await
        .unwrap();
    mapper
        .set(
            "data/.zarray",
            ReferenceEntry::Structured(json!({"shape": [100], "chunks": [10], "dtype": "<i8"})),
        )
        .unwrap();
    mapper.flush().await.unwrap();
    mem
}

async fn open(mem: &Arc<dyn VfsOps>) -> ReferenceFileSystem {
    ReferenceFileSystem::builder()
        .locator("memory://refs")
        .protocol_backend("memory", mem.clone())
        .cache_size(2)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_locator_opens_lazy_store() {
    let mem = store().await;
    let fs = open(&mem).await;
    assert!(fs.is_lazy());
    assert!(fs.cat("data/0").await.unwrap_err().is_not_found());

    let consolidated: Value = serde_json::from_slice(&fs.cat(ROOT_METADATA).await.unwrap()).unwrap();
    assert_eq!(consolidated["zarr_consolidated_format"], 1);
    assert_eq!(consolidated["metadata"]["data/.zarray"]["shape"], json!([100]));
}

#[tokio::test]
async fn test_writes_durable_only_after_flush() {
    let mem = store().await;

    let fs = open(&mem).await;
    fs.pipe("data/0", "data").unwrap();
    assert_eq!(fs.cat("data/0").await.unwrap(), b"data");
    assert!(open(&mem).await.cat("data/0").await.unwrap_err().is_not_found());
    let stats = fs.flush().await.unwrap();
    assert_eq!(stats.pages_written, 1);

    let fs = open(&mem).await;
    assert_eq!(fs.cat("data/0").await.unwrap(), b"data");
    assert!(fs.cat("data/1").await.unwrap_err().is_not_found());
    fs.pipe("data/1", "Bdata").unwrap();
    fs.flush().await.unwrap();

    let fs = open(&mem).await;
    assert_eq!(fs.cat("data/1").await.unwrap(), b"Bdata");
    fs.pipe("data/1", "Adata").unwrap();
    fs.rm("data/0", false).await.unwrap();
    assert_eq!(fs.cat("data/1").await.unwrap(), b"Adata");
    assert!(!fs.exists("data/0").await);
    fs.flush().await.unwrap();

    let fs = open(&mem).await;
    assert!(fs.cat("data/0").await.unwrap_err().is_not_found());
    assert_eq!(fs.cat("data/1").await.unwrap(), b"Adata");
}

#[tokio::test]
async fn test_repeated_flush_is_a_no_op() {
    let mem = store().await;
    let fs = open(&mem).await;
    fs.pipe("data/4", "x").unwrap();
    fs.flush().await.unwrap();

    let page = mem.read_all(Path::new("refs/data/refs.0.page")).await.unwrap();
    assert_eq!(fs.flush().await.unwrap(), FlushStats::default());
    assert_eq!(fs.flush().await.unwrap(), FlushStats::default());
    assert_eq!(mem.read_all(Path::new("refs/data/refs.0.page")).await.unwrap(), page);
}

#[tokio::test]
async fn test_listing_and_document_from_lazy_store() {
    let mem = store().await;
    let fs = open(&mem).await;
    fs.pipe("data/3", "three").unwrap();
    fs.pipe("attrs/.zattrs", r#"{"title":"t"}"#).unwrap();
    fs.flush().await.unwrap();

    let fs = open(&mem).await;
    let root: Vec<String> = fs.ls("", false).await.unwrap().into_iter().map(|i| i.name).collect();
    assert!(root.contains(&ROOT_METADATA.to_string()));
    assert!(root.contains(&"data".to_string()));
    assert!(root.contains(&"attrs".to_string()));
    assert!(fs.isdir("data"));

    let doc = fs.to_document().await.unwrap();
    assert_eq!(doc["refs"]["data/3"], "three");
    assert_eq!(doc["refs"]["attrs/.zattrs"], r#"{"title":"t"}"#);
    assert!(doc["refs"].get("data/4").is_none());
    assert!(doc["refs"].get(ROOT_METADATA).is_none());
}

/// Store whose only chunk is `data/0`; the rest of page 0 is empty rows.
async fn partly_filled() -> Arc<dyn VfsOps> {
    let mem = store().await;
    let fs = open(&mem).await;
    fs.pipe("data/0", "zero").unwrap();
    fs.flush().await.unwrap();
    mem
}

#[tokio::test]
async fn test_detailed_listing_skips_empty_rows() {
    let mem = partly_filled().await;
    let fs = open(&mem).await;
    assert_eq!(fs.ls("data", false).await.unwrap().len(), 11);

    let detailed = fs.ls("data", true).await.unwrap();
    let names: Vec<&str> = detailed.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["data/.zarray", "data/0"]);
    assert_eq!(detailed[1].size, Some(4));

    let found = fs.find("data", false, true).await.unwrap();
    assert_eq!(found.len(), 2);
    assert!(fs.info("data/1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_get_copies_only_present_rows() {
    let mem = partly_filled().await;
    let fs = open(&mem).await;
    assert_eq!(fs.get("data", "memory://copy", true).await.unwrap(), 2);
    assert_eq!(mem.read_all(Path::new("copy/0")).await.unwrap(), b"zero");
    assert!(!mem.exists(Path::new("copy/1")).await);
}

#[tokio::test]
async fn test_recursive_rm_over_partly_filled_page() {
    let mem = partly_filled().await;
    let fs = open(&mem).await;
    fs.rm("data", true).await.unwrap();
    assert!(fs.cat("data/0").await.unwrap_err().is_not_found());
    assert!(fs.cat("data/.zarray").await.unwrap_err().is_not_found());
    let stats = fs.flush().await.unwrap();
    assert_eq!(stats.pages_removed, 1);

    let fs = open(&mem).await;
    assert!(!fs.isdir("data"));
    assert!(fs.cat("data/0").await.unwrap_err().is_not_found());
    assert!(!mem.exists(Path::new("refs/data/refs.0.page")).await);
}
