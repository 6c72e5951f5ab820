//! End-to-end tests for the reference filesystem.
//!
//! # Tiers
//!
//! - **Tier 1:** reading: literal, base64, JSON and range references, handles
//! - **Tier 2:** directory synthesis: ls / find / info over flat paths
//! - **Tier 3:** batches and failures: `on_error` policies, unreachable targets
//! - **Tier 4:** construction: templates, default targets, protocol routing
//! - **Tier 5:** mutation and persistence: pipe / rm / save_json, put / get

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use refvfs_kernel::{
    FileType, InstanceCache, MemoryBackend, OnError, RefError, ReferenceEntry,
    ReferenceFileSystem, ReferenceFsConfig, VfsOps,
};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

const DATA: &[u8] = b"0123456789abcdefghij";
const OTHER: &[u8] = b"other test data";

// ============================================================================
// Shared test setup
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A memory backend holding `data/0` = DATA and `b` = OTHER.
async fn memory() -> Arc<dyn VfsOps> {
    let mem: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
    mem.write_all(Path::new("data/0"), DATA).await.unwrap();
    mem.write_all(Path::new("b"), OTHER).await.unwrap();
    mem
}

async fn build(doc: Value, mem: &Arc<dyn VfsOps>) -> ReferenceFileSystem {
    init_tracing();
    ReferenceFileSystem::builder()
        .document(doc)
        .protocol_backend("memory", mem.clone())
        .build()
        .await
        .expect("build failed")
}

fn names(infos: &[refvfs_kernel::FileInfo]) -> Vec<&str> {
    infos.iter().map(|i| i.name.as_str()).collect()
}

// ============================================================================
// Tier 1: reading
// ============================================================================

#[tokio::test]
async fn test_cat_every_kind() {
    let mem = memory().await;
    let fs = build(
        json!({
            "a": "data",
            "b": ["memory://data/0", 0, 5],
            "c": ["memory://data/0", 1, 5],
            "d": "base64:aGVsbG8=",
            "e": {"key": "value"},
        }),
        &mem,
    )
    .await;

    assert_eq!(fs.cat("a").await.unwrap(), b"data");
    assert_eq!(fs.cat("b").await.unwrap(), &DATA[..5]);
    assert_eq!(fs.cat("c").await.unwrap(), &DATA[1..6]);
    assert_eq!(fs.cat("d").await.unwrap(), b"hello");
    assert_eq!(fs.cat("e").await.unwrap(), br#"{"key":"value"}"#);
}

#[tokio::test]
async fn test_versioned_document_reads_the_same() {
    let mem = memory().await;
    let fs = build(
        json!({
            "version": 1,
            "refs": {
                "a": "data",
                "b": ["memory://data/0", 0, 5],
                "d": "base64:aGVsbG8=",
            }
        }),
        &mem,
    )
    .await;
    assert_eq!(fs.cat("a").await.unwrap(), b"data");
    assert_eq!(fs.cat("b").await.unwrap(), &DATA[..5]);
    assert_eq!(fs.cat("d").await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_open_partial_reads() {
    let mem = memory().await;
    let fs = build(
        json!({
            "b": ["memory://data/0"],
            "c": ["memory://data/0", 0, 5],
            "d": ["memory://data/0", 1, 5],
        }),
        &mem,
    )
    .await;

    let mut f = fs.open("b").await.unwrap();
    assert_eq!(f.read_to_end().await.unwrap(), DATA);

    let mut f = fs.open("c").await.unwrap();
    assert_eq!(f.read_to_end().await.unwrap(), &DATA[..5]);
    assert!(f.read(1).await.unwrap().is_empty());

    let mut f = fs.open("c").await.unwrap();
    assert_eq!(f.read(2).await.unwrap(), &DATA[..2]);
    f.seek(SeekFrom::Current(2)).unwrap();
    assert_eq!(f.read_to_end().await.unwrap(), &DATA[4..5]);

    let mut f = fs.open("d").await.unwrap();
    assert_eq!(f.read(2).await.unwrap(), &DATA[1..3]);
    f.seek(SeekFrom::Current(1)).unwrap();
    assert_eq!(f.read_to_end().await.unwrap(), &DATA[4..6]);
}

#[tokio::test]
async fn test_cat_file_ranges() {
    let mem = memory().await;
    let fs = build(json!({"c": ["memory://b"], "d": ["memory://b", 4, 6]}), &mem).await;

    let n = OTHER.len();
    assert_eq!(fs.cat_file("c", None, None).await.unwrap(), OTHER);
    assert_eq!(fs.cat_file("c", Some(1), None).await.unwrap(), &OTHER[1..]);
    assert_eq!(fs.cat_file("c", Some(-5), None).await.unwrap(), &OTHER[n - 5..]);
    assert_eq!(fs.cat_file("c", Some(1), Some(-5)).await.unwrap(), &OTHER[1..n - 5]);

    let d = &OTHER[4..10];
    assert_eq!(fs.cat_file("d", None, None).await.unwrap(), d);
    assert_eq!(fs.cat_file("d", Some(1), None).await.unwrap(), &d[1..]);
    assert_eq!(fs.cat_file("d", Some(-5), None).await.unwrap(), &d[1..]);
    assert_eq!(fs.cat_file("d", Some(1), Some(-3)).await.unwrap(), &d[1..3]);
}

// ============================================================================
// Tier 2: directory synthesis
// ============================================================================

#[tokio::test]
async fn test_ls_and_find() {
    let mem = memory().await;
    let fs = build(
        json!({
            "a": "data",
            "b": ["memory://data/0", 0, 5],
            "c/d": ["memory://data/0", 1, 6],
        }),
        &mem,
    )
    .await;

    let listing = fs.ls("", false).await.unwrap();
    assert_eq!(names(&listing), vec!["a", "b", "c"]);
    let detailed = fs.ls("", true).await.unwrap();
    let c = detailed.iter().find(|i| i.name == "c").unwrap();
    assert_eq!(c.kind, FileType::Directory);
    assert_eq!(c.size, Some(0));

    assert_eq!(names(&fs.find("", false, false).await.unwrap()), vec!["a", "b", "c/d"]);
    assert_eq!(
        names(&fs.find("", true, false).await.unwrap()),
        vec!["a", "b", "c", "c/d"]
    );
    let found = fs.find("c", false, true).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "c/d");
    assert_eq!(found[0].size, Some(6));
}

#[tokio::test]
async fn test_nested_dirs_ls() {
    let mem = memory().await;
    let fs = build(json!({"a": "A", "B/C/b": "B", "B/C/d": "d", "B/_": "_"}), &mem).await;

    let root = fs.ls("", false).await.unwrap();
    assert_eq!(names(&root), vec!["B", "a"]);
    assert_eq!(root[0].kind, FileType::Directory);
    assert_eq!(root[1].kind, FileType::File);

    let b = fs.ls("B", false).await.unwrap();
    assert_eq!(names(&b), vec!["B/C", "B/_"]);
    assert!(fs.ls("nope", false).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_info_and_size() {
    let mem = memory().await;
    let fs = build(
        json!({
            "a": "data",
            "b": ["memory://data/0", 0, 5],
            "c/d": ["memory://data/0", 1, 6],
            "e": ["memory://data/0"],
        }),
        &mem,
    )
    .await;

    assert_eq!(fs.size("a").await.unwrap(), 4);
    assert_eq!(fs.size("b").await.unwrap(), 5);
    assert_eq!(fs.size("c/d").await.unwrap(), 6);
    assert_eq!(fs.info("e").await.unwrap().size, Some(DATA.len() as u64));

    let c = fs.info("c").await.unwrap();
    assert_eq!(c.kind, FileType::Directory);
    assert!(fs.exists("c").await);
    assert!(!fs.exists("zz").await);
    assert!(fs.info("zz").await.unwrap_err().is_not_found());
}

// ============================================================================
// Tier 3: batches and failures
// ============================================================================

#[tokio::test]
async fn test_merged_batch_reads() {
    let mem = memory().await;
    let fs = build(
        json!({
            "a": ["memory://b", 1, 1],
            "b": ["memory://b", 2, 1],
            "c": ["memory://b"],
            "d": ["memory://b", 4, 6],
        }),
        &mem,
    )
    .await;

    let out = fs.cat_many(["a", "b", "c", "d"], OnError::Raise).await.unwrap();
    let out = refvfs_kernel::batch::into_bytes(out).unwrap();
    assert_eq!(out["a"], b"t");
    assert_eq!(out["b"], b"h");
    assert_eq!(out["c"], OTHER);
    assert_eq!(out["d"], &OTHER[4..10]);
}

#[tokio::test]
async fn test_missing_and_unreachable() {
    for unknown in ["memory://unknown", "//unknown"] {
        let mem = memory().await;
        let fs = build(json!({"c": ["memory://b"], "d": [unknown, 4, 6]}), &mem).await;

        assert!(fs.cat("notafile").await.unwrap_err().is_not_found());
        let err = fs.cat_many(["notone", "nottwo"], OnError::Raise).await.unwrap_err();
        assert!(err.is_not_found());

        let mapper = fs.get_mapper("");
        assert!(mapper.get("notakey").await.unwrap_err().is_not_found());

        let err = fs.cat("d").await.unwrap_err();
        assert!(matches!(err, RefError::TargetUnreachable { .. }));
        assert!(std::error::Error::source(&err).is_some());

        let message = mapper.get("d").await.unwrap_err().to_string();
        assert!(message.contains("\"d\""), "{message}");
        assert!(message.contains("//unknown"), "{message}");

        assert!(mapper.getitems(&["c", "d"], OnError::Raise).await.is_err());
        let out = mapper.getitems(&["c", "d"], OnError::Return).await.unwrap();
        assert!(matches!(out["d"], Err(RefError::TargetUnreachable { .. })));

        let out = fs.cat_many(["notone", "c", "d"], OnError::Return).await.unwrap();
        assert!(out["notone"].as_ref().unwrap_err().is_not_found());
        assert_eq!(out["c"].as_ref().unwrap(), OTHER);
        assert!(matches!(out["d"], Err(RefError::TargetUnreachable { .. })));

        let out = mapper.getitems(&["c", "d"], OnError::Omit).await.unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["c"]);
    }
}

#[tokio::test]
async fn test_mapper_getitems_keeps_input_order() {
    let mem: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
    mem.write_all(Path::new("a"), b"A").await.unwrap();
    mem.write_all(Path::new("b"), b"B").await.unwrap();
    init_tracing();
    let fs = ReferenceFileSystem::builder()
        .document(json!({"a": ["a"], "b": ["b"]}))
        .fs(mem)
        .build()
        .await
        .unwrap();

    let out = fs.get_mapper("").getitems(&["b", "a"], OnError::Raise).await.unwrap();
    assert_eq!(out.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    assert_eq!(out["a"].as_ref().unwrap(), b"A");
}

// ============================================================================
// Tier 4: construction
// ============================================================================

#[tokio::test]
async fn test_templates_and_overrides() {
    init_tracing();
    let doc = json!({
        "version": 1,
        "templates": {"u": "server.domain/path"},
        "refs": {"k": ["http://{{u}}", 10000, 100]},
    });

    let fs = ReferenceFileSystem::builder()
        .document(doc.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(
        fs.entry("k").await.unwrap(),
        ReferenceEntry::range("http://server.domain/path", 10000, 100)
    );

    let fs = ReferenceFileSystem::builder()
        .document(doc)
        .template_override("u", "mirror.org")
        .build()
        .await
        .unwrap();
    assert_eq!(
        fs.entry("k").await.unwrap(),
        ReferenceEntry::range("http://mirror.org", 10000, 100)
    );
}

#[tokio::test]
async fn test_generation_rule_validation_fails_at_build() {
    init_tracing();
    let err = ReferenceFileSystem::builder()
        .document(json!({
            "version": 1,
            "gen": [{
                "key": "k{{i}}",
                "url": "memory://x",
                "offset": "0",
                "dimensions": {"i": {"stop": 2}},
            }],
        }))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, RefError::Specification(_)));
}

#[tokio::test]
async fn test_null_locator_uses_default_target() {
    let mem = memory().await;
    let fs = ReferenceFileSystem::builder()
        .document(json!({"a": "data", "b": [null, 0, 5]}))
        .target("memory://data/0")
        .protocol_backend("memory", mem)
        .build()
        .await
        .unwrap();
    assert_eq!(fs.cat("a").await.unwrap(), b"data");
    assert_eq!(fs.cat("b").await.unwrap(), &DATA[..5]);
}

#[tokio::test]
async fn test_default_protocol_inference() {
    let fs = ReferenceFileSystem::builder()
        .document(json!({}))
        .build()
        .await
        .unwrap();
    assert_eq!(fs.router().default_protocol(), None);

    let fs = ReferenceFileSystem::builder()
        .document(json!({}))
        .remote_protocol("memory")
        .build()
        .await
        .unwrap();
    assert_eq!(fs.router().default_protocol(), Some("memory"));

    let fs = ReferenceFileSystem::builder()
        .document(json!({"key": ["memory://a"], "blah": ["path"]}))
        .build()
        .await
        .unwrap();
    assert_eq!(fs.router().default_protocol(), Some("memory"));
}

#[tokio::test]
async fn test_empty_versioned_document() {
    let config: ReferenceFsConfig = serde_json::from_value(json!({
        "fo": {"version": 1},
        "target_protocol": "memory",
    }))
    .unwrap();
    let fs = ReferenceFileSystem::from_config(config).await.unwrap();
    assert!(fs.references().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_per_protocol_configs_built_on_use() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let real = dir.path().join("file");
    std::fs::write(&real, b"0123456789")?;
    let url = format!("file://{}", real.display());

    let mem = memory().await;
    mem.write_all(Path::new("afile"), b"hello").await?;

    let fs = ReferenceFileSystem::builder()
        .document(json!({
            "a": "data",
            "b": [url.clone(), 0, 5],
            "c/d": [url, 1, 6],
            "c/e": ["memory://afile"],
        }))
        .protocol_config("file", json!({}))
        .protocol_backend("memory", mem)
        .build()
        .await?;

    assert_eq!(fs.cat("c/e").await?, b"hello");
    let out = refvfs_kernel::batch::into_bytes(
        fs.cat_many(["c/e", "a", "b"], OnError::Raise).await?,
    )?;
    assert_eq!(out["a"], b"data");
    assert_eq!(out["b"], b"01234");
    assert_eq!(out["c/e"], b"hello");
    Ok(())
}

#[tokio::test]
async fn test_unconfigured_protocol_fails_only_its_reference() {
    let mem = memory().await;
    let fs = build(json!({"a": "data", "z": ["gopher://host/x", 0, 1]}), &mem).await;
    assert_eq!(fs.cat("a").await.unwrap(), b"data");
    match fs.cat("z").await.unwrap_err() {
        RefError::BackendNotConfigured { path, protocol } => {
            assert_eq!(path, "z");
            assert_eq!(protocol, "gopher");
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Tier 5: mutation and persistence
// ============================================================================

#[tokio::test]
async fn test_mutate_save_and_reload() {
    let mem = memory().await;
    let fs = build(
        json!({
            "a": "data",
            "b": ["memory://data/0", 0, 5],
            "c/d": ["memory://data/0", 1, 6],
        }),
        &mem,
    )
    .await;

    fs.rm("a", false).await.unwrap();
    assert!(!fs.exists("a").await);
    fs.pipe("aa", b"bin data".to_vec()).unwrap();
    assert_eq!(fs.cat("aa").await.unwrap(), b"bin data");

    fs.save_json("memory://refs.json").await.unwrap();
    assert!(mem.exists(Path::new("refs.json")).await);

    let reloaded = ReferenceFileSystem::builder()
        .locator("memory://refs.json")
        .protocol_backend("memory", mem.clone())
        .build()
        .await
        .unwrap();
    assert!(!reloaded.exists("a").await);
    assert_eq!(reloaded.cat("aa").await.unwrap(), b"bin data");
    assert_eq!(reloaded.cat("c/d").await.unwrap(), &DATA[1..7]);
    assert_eq!(
        reloaded.references().await.unwrap().to_document(),
        fs.to_document().await.unwrap()
    );
}

#[tokio::test]
async fn test_shared_instance_cache() {
    init_tracing();
    let cache = Arc::new(InstanceCache::new());
    let writer = ReferenceFileSystem::builder()
        .document(json!({"k": "v"}))
        .instance_cache(cache.clone())
        .build()
        .await
        .unwrap();
    writer.save_json("memory://shared.json").await.unwrap();

    let reader = ReferenceFileSystem::builder()
        .locator("memory://shared.json")
        .instance_cache(cache.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(reader.cat("k").await.unwrap(), b"v");

    let isolated = ReferenceFileSystem::builder()
        .locator("memory://shared.json")
        .instance_cache(cache)
        .skip_instance_cache(true)
        .build()
        .await
        .unwrap_err();
    assert!(matches!(isolated, RefError::TargetUnreachable { .. }));
}

#[tokio::test]
async fn test_put_get_tree() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let d1 = dir.path().join("d1");
    std::fs::create_dir(&d1)?;
    std::fs::write(d1.join("a"), b"1")?;
    std::fs::write(d1.join("b"), b"2")?;
    let d2 = dir.path().join("d2");

    let fs = ReferenceFileSystem::builder()
        .document(json!({}))
        .remote_protocol("file")
        .build()
        .await?;
    assert_eq!(fs.put(&d1.display().to_string(), "out", true).await?, 2);
    assert_eq!(fs.get("out", &d2.display().to_string(), true).await?, 2);

    assert_eq!(std::fs::read(d2.join("a"))?, b"1");
    assert_eq!(std::fs::read(d2.join("b"))?, b"2");
    Ok(())
}

#[tokio::test]
async fn test_put_get_single() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let f1 = dir.path().join("f1");
    let f2 = dir.path().join("f2");
    std::fs::write(&f1, b"1")?;

    let fs = ReferenceFileSystem::builder()
        .document(json!({}))
        .remote_protocol("file")
        .skip_instance_cache(true)
        .build()
        .await?;
    fs.put(&f1.display().to_string(), "out", false).await?;
    fs.get("out", &f2.display().to_string(), false).await?;
    assert_eq!(std::fs::read(&f2)?, b"1");

    fs.pipe("hi", "data")?;
    assert_eq!(fs.cat("hi").await?, b"data");
    Ok(())
}

#[tokio::test]
async fn test_get_ranged_into_local_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let real = dir.path().join("file");
    std::fs::write(&real, b"0123456789")?;
    let real = real.display().to_string();

    let fs = ReferenceFileSystem::builder()
        .document(json!({"a": "data", "b": [real.clone(), 0, 5], "c/d": [real, 1, 6]}))
        .build()
        .await?;

    let out = |name: &str| dir.path().join(name).display().to_string();
    fs.get("a", &out("a"), false).await?;
    fs.get("b", &out("b"), false).await?;
    fs.get("c", &out("c"), true).await?;

    assert_eq!(std::fs::read(dir.path().join("a"))?, b"data");
    assert_eq!(std::fs::read(dir.path().join("b"))?, b"01234");
    assert!(dir.path().join("c").is_dir());
    assert_eq!(std::fs::read(dir.path().join("c/d"))?, b"123456");
    Ok(())
}
