//! Protocol → backend routing.
//!
//! A locator's protocol picks the backend. Backends come from, in order:
//!
//! 1. a single explicit backend that serves every protocol;
//! 2. a per-protocol [`BackendSpec`] (ready object or config to build from);
//! 3. the [`BackendFactory`], fed the default options when the protocol is
//!    the default one and empty options otherwise.
//!
//! Bare paths use the default protocol, then a local backend rooted at `/`.
//! Nothing is constructed until a locator actually needs it, so a bad
//! configuration only fails the references that use it.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::entry::{Locator, canonical_json};
use crate::error::{RefError, RefResult};
use crate::vfs::{LocalBackend, MemoryBackend, VfsError, VfsOps, VfsResult};

/// Protocol used when nothing else applies.
pub const LOCAL_PROTOCOL: &str = "file";

/// How to obtain the backend for one protocol.
#[derive(Clone)]
pub enum BackendSpec {
    /// Already constructed.
    Ready(Arc<dyn VfsOps>),
    /// Options handed to the factory on first use.
    Config(Value),
}

impl std::fmt::Debug for BackendSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendSpec::Ready(_) => f.write_str("Ready(..)"),
            BackendSpec::Config(options) => f.debug_tuple("Config").field(options).finish(),
        }
    }
}

/// Builds backends from a protocol name and options.
pub trait BackendFactory: Send + Sync {
    /// `Ok(None)` means the protocol is unknown to this factory.
    fn create(&self, protocol: &str, options: &Value) -> VfsResult<Option<Arc<dyn VfsOps>>>;
}

/// Knows `memory` and `file`/`local`.
///
/// `file` accepts `{"root": "/some/dir", "read_only": bool}`; the root
/// defaults to `/`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinFactory;

impl BackendFactory for BuiltinFactory {
    fn create(&self, protocol: &str, options: &Value) -> VfsResult<Option<Arc<dyn VfsOps>>> {
        match protocol {
            "memory" => Ok(Some(Arc::new(MemoryBackend::new()))),
            "file" | "local" => {
                let root = match options.get("root") {
                    None | Some(Value::Null) => PathBuf::from("/"),
                    Some(Value::String(root)) => PathBuf::from(root),
                    Some(other) => {
                        return Err(VfsError::other(format!("file root must be a string, got {other}")));
                    }
                };
                let read_only = options
                    .get("read_only")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let backend = if read_only {
                    LocalBackend::read_only(root)
                } else {
                    LocalBackend::new(root)
                };
                Ok(Some(Arc::new(backend)))
            }
            _ => Ok(None),
        }
    }
}

/// Shared backend instances keyed by protocol and options.
///
/// Two routers handed the same cache reuse one backend per distinct
/// configuration (two filesystems over `memory://` see the same store).
#[derive(Default)]
pub struct InstanceCache {
    instances: DashMap<String, Arc<dyn VfsOps>>,
}

impl std::fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCache")
            .field("len", &self.instances.len())
            .finish()
    }
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn clear(&self) {
        self.instances.clear();
    }

    /// Cache key: protocol plus options serialized with sorted keys.
    pub fn fingerprint(protocol: &str, options: &Value) -> String {
        let options = canonical_json(options)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        format!("{protocol}:{options}")
    }

    fn get_or_create(
        &self,
        protocol: &str,
        options: &Value,
        factory: &dyn BackendFactory,
    ) -> VfsResult<Option<Arc<dyn VfsOps>>> {
        let key = Self::fingerprint(protocol, options);
        if let Some(found) = self.instances.get(&key) {
            return Ok(Some(found.clone()));
        }
        let Some(created) = factory.create(protocol, options)? else {
            return Ok(None);
        };
        // A concurrent creator may have won; keep whichever landed first.
        let entry = self.instances.entry(key).or_insert(created);
        Ok(Some(entry.clone()))
    }
}

/// Routes locators to backends.
pub struct BackendRouter {
    single: Option<Arc<dyn VfsOps>>,
    specs: HashMap<String, BackendSpec>,
    resolved: DashMap<String, Arc<dyn VfsOps>>,
    default_protocol: Option<String>,
    default_options: Value,
    factory: Arc<dyn BackendFactory>,
    cache: Option<Arc<InstanceCache>>,
}

impl std::fmt::Debug for BackendRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRouter")
            .field("single", &self.single.is_some())
            .field("specs", &self.specs)
            .field("default_protocol", &self.default_protocol)
            .finish_non_exhaustive()
    }
}

impl Default for BackendRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRouter {
    /// Router with the built-in factory and no shared cache.
    pub fn new() -> Self {
        Self {
            single: None,
            specs: HashMap::new(),
            resolved: DashMap::new(),
            default_protocol: None,
            default_options: Value::Object(Default::default()),
            factory: Arc::new(BuiltinFactory),
            cache: None,
        }
    }

    /// Serve every protocol from one backend.
    pub fn with_single(mut self, backend: Arc<dyn VfsOps>) -> Self {
        self.single = Some(backend);
        self
    }

    /// Configure one protocol.
    pub fn with_protocol(mut self, protocol: impl Into<String>, spec: BackendSpec) -> Self {
        self.specs.insert(protocol.into(), spec);
        self
    }

    /// Protocol (and options) for bare paths and for factory fallbacks.
    pub fn with_default(mut self, protocol: Option<String>, options: Value) -> Self {
        self.default_protocol = protocol;
        self.default_options = options;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<InstanceCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn default_protocol(&self) -> Option<&str> {
        self.default_protocol.as_deref()
    }

    /// Adopt `protocol` as the default unless one was set explicitly.
    pub fn infer_default_protocol(&mut self, protocol: &str) {
        if self.default_protocol.is_none() && self.single.is_none() {
            tracing::debug!(protocol, "inferred default protocol from first reference");
            self.default_protocol = Some(protocol.to_string());
        }
    }

    /// Backend and backend-relative path for `locator`.
    ///
    /// `path` is the logical reference path, used only for error context.
    pub fn resolve(&self, path: &str, locator: &str) -> RefResult<(Arc<dyn VfsOps>, String)> {
        let parsed = Locator::parse(locator);
        if let Some(single) = &self.single {
            return Ok((single.clone(), parsed.path.to_string()));
        }
        let protocol = parsed
            .protocol
            .or(self.default_protocol.as_deref())
            .unwrap_or(LOCAL_PROTOCOL);
        let backend = self.backend(path, protocol)?;
        Ok((backend, parsed.path.to_string()))
    }

    /// Backend for `protocol`, constructing it on first use.
    pub fn backend(&self, path: &str, protocol: &str) -> RefResult<Arc<dyn VfsOps>> {
        if let Some(single) = &self.single {
            return Ok(single.clone());
        }
        if let Some(found) = self.resolved.get(protocol) {
            return Ok(found.clone());
        }

        let options = match self.specs.get(protocol) {
            Some(BackendSpec::Ready(backend)) => {
                self.resolved.insert(protocol.to_string(), backend.clone());
                return Ok(backend.clone());
            }
            Some(BackendSpec::Config(options)) => options.clone(),
            None if self.default_protocol.as_deref() == Some(protocol) => {
                self.default_options.clone()
            }
            None => Value::Object(Default::default()),
        };

        let built = self.instance(protocol, &options).map_err(|e| match e {
            RefError::BackendNotConfigured { protocol, .. } => RefError::BackendNotConfigured {
                path: path.to_string(),
                protocol,
            },
            other => other,
        })?;
        let entry = self.resolved.entry(protocol.to_string()).or_insert(built);
        Ok(entry.clone())
    }

    /// Backend for fetching a reference document itself: the configured
    /// backend when the protocol has one, else an instance built with
    /// `options`.
    pub fn target(&self, protocol: &str, options: &Value) -> RefResult<Arc<dyn VfsOps>> {
        if self.single.is_some() || self.specs.contains_key(protocol) {
            return self.backend("", protocol);
        }
        self.instance(protocol, options)
    }

    /// Build (or fetch from the shared cache) a backend for `protocol`
    /// with explicit options, outside the per-protocol configuration.
    pub fn instance(&self, protocol: &str, options: &Value) -> RefResult<Arc<dyn VfsOps>> {
        let created = match &self.cache {
            Some(cache) => cache.get_or_create(protocol, options, self.factory.as_ref()),
            None => self.factory.create(protocol, options),
        };
        match created {
            Ok(Some(backend)) => {
                tracing::debug!(protocol, "constructed backend");
                Ok(backend)
            }
            Ok(None) => Err(RefError::BackendNotConfigured {
                path: String::new(),
                protocol: protocol.to_string(),
            }),
            Err(source) => Err(RefError::storage(format!("{protocol}://"), source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    #[tokio::test]
    async fn test_ready_backend_per_protocol() {
        let mem: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
        mem.write_all(Path::new("t"), b"bytes").await.unwrap();

        let router = BackendRouter::new().with_protocol("memory", BackendSpec::Ready(mem));
        let (backend, rel) = router.resolve("k", "memory://t").unwrap();
        assert_eq!(rel, "t");
        assert_eq!(backend.read_all(Path::new(&rel)).await.unwrap(), b"bytes");
    }

    #[test]
    fn test_unknown_protocol_fails_at_use() {
        let router = BackendRouter::new();
        let Err(err) = router.resolve("d", "gopher://host/x") else {
            panic!("gopher should not resolve");
        };
        match err {
            RefError::BackendNotConfigured { path, protocol } => {
                assert_eq!(path, "d");
                assert_eq!(protocol, "gopher");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bare_path_falls_back_to_local() {
        let router = BackendRouter::new();
        let (backend, rel) = router.resolve("k", "/tmp/whatever").unwrap();
        assert_eq!(rel, "/tmp/whatever");
        assert!(!backend.read_only());
    }

    #[tokio::test]
    async fn test_bare_path_uses_inferred_default() {
        let mem: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
        mem.write_all(Path::new("x"), b"mem").await.unwrap();

        let mut router = BackendRouter::new().with_protocol("memory", BackendSpec::Ready(mem));
        router.infer_default_protocol("memory");
        router.infer_default_protocol("s3");
        assert_eq!(router.default_protocol(), Some("memory"));

        let (backend, rel) = router.resolve("k", "x").unwrap();
        assert_eq!(backend.read_all(Path::new(&rel)).await.unwrap(), b"mem");
    }

    #[test]
    fn test_constructed_once_per_protocol() {
        let router = BackendRouter::new().with_protocol("memory", BackendSpec::Config(json!({})));
        let (a, _) = router.resolve("a", "memory://a").unwrap();
        let (b, _) = router.resolve("b", "memory://b").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_shared_cache_across_routers() {
        let cache = Arc::new(InstanceCache::new());
        let one = BackendRouter::new().with_cache(Some(cache.clone()));
        let two = BackendRouter::new().with_cache(Some(cache.clone()));

        let (a, _) = one.resolve("a", "memory://a").unwrap();
        let (b, _) = two.resolve("b", "memory://b").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let three = BackendRouter::new();
        let (c, _) = three.resolve("c", "memory://c").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = InstanceCache::fingerprint("s3", &json!({"a": 1, "b": 2}));
        let b = InstanceCache::fingerprint("s3", &json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
    }
}
