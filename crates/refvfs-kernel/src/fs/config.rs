//! Construction options and the builder.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use super::{ReferenceFileSystem, References};
use crate::document::{LoadOptions, ReferenceDocument};
use crate::entry::Locator;
use crate::error::{RefError, RefResult};
use crate::lazy::LazyReferenceMapper;
use crate::mapping::ReferenceMapping;
use crate::router::{BackendFactory, BackendRouter, BackendSpec, InstanceCache, LOCAL_PROTOCOL};
use crate::vfs::VfsOps;

fn empty_options() -> Value {
    Value::Object(Default::default())
}

/// Serializable construction options.
///
/// ```json
/// {
///   "fo": "memory://refs.json",
///   "target_protocol": "memory",
///   "remote_protocol": "s3",
///   "remote_options": {"anon": true},
///   "fs": {"memory": {}},
///   "template_overrides": {"u": "mirror.org"},
///   "simple_templates": true
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReferenceFsConfig {
    /// Reference document (object) or a locator to fetch it from (string).
    pub fo: Option<Value>,
    /// Protocol for fetching `fo` when it is a locator without one.
    pub target_protocol: Option<String>,
    /// Options for the backend that fetches `fo`.
    pub target_options: Value,
    /// Stand-in locator for `[null, offset, length]` references.
    pub target: Option<String>,
    /// Protocol for bare reference locators; inferred from the first
    /// reference when unset.
    pub remote_protocol: Option<String>,
    /// Options for the default protocol's backend.
    pub remote_options: Value,
    /// Per-protocol backend options, built on first use.
    pub fs: IndexMap<String, Value>,
    pub template_overrides: IndexMap<String, String>,
    pub simple_templates: bool,
    /// Marks the filesystem for the async API only.
    pub asynchronous: bool,
    /// Do not share backend instances through the instance cache.
    pub skip_instance_cache: bool,
    /// Page cache bound for lazy stores.
    pub cache_size: Option<usize>,
}

impl Default for ReferenceFsConfig {
    fn default() -> Self {
        Self {
            fo: None,
            target_protocol: None,
            target_options: empty_options(),
            target: None,
            remote_protocol: None,
            remote_options: empty_options(),
            fs: IndexMap::new(),
            template_overrides: IndexMap::new(),
            simple_templates: true,
            asynchronous: false,
            skip_instance_cache: false,
            cache_size: None,
        }
    }
}

impl ReferenceFsConfig {
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            template_overrides: self.template_overrides.clone(),
            simple_templates: self.simple_templates,
            default_target: self.target.clone(),
        }
    }
}

/// Where references come from.
pub enum ReferenceSource {
    /// Unexpanded document JSON.
    Document(Value),
    /// Already expanded.
    Mapping(ReferenceMapping),
    /// Document or lazy store to fetch.
    Locator(String),
    /// An open lazy store.
    Lazy(LazyReferenceMapper),
}

impl std::fmt::Debug for ReferenceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Document(_) => f.write_str("Document(..)"),
            Self::Mapping(m) => f.debug_tuple("Mapping").field(&m.len()).finish(),
            Self::Locator(l) => f.debug_tuple("Locator").field(l).finish(),
            Self::Lazy(m) => f.debug_tuple("Lazy").field(m).finish(),
        }
    }
}

/// Builds a [`ReferenceFileSystem`].
///
/// Serializable settings live in [`ReferenceFsConfig`]; live objects
/// (backends, factories, the shared instance cache) are added here.
#[derive(Default)]
pub struct ReferenceFsBuilder {
    config: ReferenceFsConfig,
    source: Option<ReferenceSource>,
    single: Option<Arc<dyn VfsOps>>,
    ready: Vec<(String, Arc<dyn VfsOps>)>,
    factory: Option<Arc<dyn BackendFactory>>,
    cache: Option<Arc<InstanceCache>>,
}

impl ReferenceFsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: ReferenceFsConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn document(mut self, doc: Value) -> Self {
        self.source = Some(ReferenceSource::Document(doc));
        self
    }

    pub fn mapping(mut self, mapping: ReferenceMapping) -> Self {
        self.source = Some(ReferenceSource::Mapping(mapping));
        self
    }

    pub fn locator(mut self, locator: impl Into<String>) -> Self {
        self.source = Some(ReferenceSource::Locator(locator.into()));
        self
    }

    pub fn lazy(mut self, mapper: LazyReferenceMapper) -> Self {
        self.source = Some(ReferenceSource::Lazy(mapper));
        self
    }

    /// One backend for every protocol.
    pub fn fs(mut self, backend: Arc<dyn VfsOps>) -> Self {
        self.single = Some(backend);
        self
    }

    /// A ready backend for one protocol.
    pub fn protocol_backend(mut self, protocol: impl Into<String>, backend: Arc<dyn VfsOps>) -> Self {
        self.ready.push((protocol.into(), backend));
        self
    }

    /// Options for one protocol, built on first use.
    pub fn protocol_config(mut self, protocol: impl Into<String>, options: Value) -> Self {
        self.config.fs.insert(protocol.into(), options);
        self
    }

    pub fn factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn instance_cache(mut self, cache: Arc<InstanceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn target_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.target_protocol = Some(protocol.into());
        self
    }

    pub fn target_options(mut self, options: Value) -> Self {
        self.config.target_options = options;
        self
    }

    pub fn target(mut self, locator: impl Into<String>) -> Self {
        self.config.target = Some(locator.into());
        self
    }

    pub fn remote_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.remote_protocol = Some(protocol.into());
        self
    }

    pub fn remote_options(mut self, options: Value) -> Self {
        self.config.remote_options = options;
        self
    }

    pub fn template_override(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.template_overrides.insert(name.into(), value.into());
        self
    }

    pub fn simple_templates(mut self, simple: bool) -> Self {
        self.config.simple_templates = simple;
        self
    }

    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.config.asynchronous = asynchronous;
        self
    }

    pub fn skip_instance_cache(mut self, skip: bool) -> Self {
        self.config.skip_instance_cache = skip;
        self
    }

    pub fn cache_size(mut self, pages: usize) -> Self {
        self.config.cache_size = Some(pages);
        self
    }

    fn router(&mut self) -> BackendRouter {
        let mut router = BackendRouter::new()
            .with_default(
                self.config.remote_protocol.clone(),
                self.config.remote_options.clone(),
            )
            .with_cache(if self.config.skip_instance_cache {
                None
            } else {
                self.cache.clone()
            });
        if let Some(factory) = self.factory.take() {
            router = router.with_factory(factory);
        }
        if let Some(single) = self.single.take() {
            router = router.with_single(single);
        }
        for (protocol, options) in &self.config.fs {
            router = router.with_protocol(protocol.clone(), BackendSpec::Config(options.clone()));
        }
        for (protocol, backend) in self.ready.drain(..) {
            router = router.with_protocol(protocol, BackendSpec::Ready(backend));
        }
        router
    }

    /// Load and expand references, then assemble the filesystem.
    ///
    /// Every document error surfaces here; backends are not contacted
    /// except to fetch a document given by locator.
    pub async fn build(mut self) -> RefResult<ReferenceFileSystem> {
        let mut router = self.router();
        let options = self.config.load_options();

        let source = match self.source.take() {
            Some(source) => source,
            None => match self.config.fo.take() {
                Some(Value::String(locator)) => ReferenceSource::Locator(locator),
                Some(doc @ Value::Object(_)) => ReferenceSource::Document(doc),
                Some(other) => {
                    return Err(RefError::spec(format!(
                        "fo must be a document or a locator, got {other}"
                    )));
                }
                None => return Err(RefError::spec("no references given (fo)")),
            },
        };

        let refs = match source {
            ReferenceSource::Document(doc) => {
                References::eager(ReferenceDocument::load(doc, &options)?)
            }
            ReferenceSource::Mapping(mapping) => References::eager(mapping),
            ReferenceSource::Lazy(mapper) => References::Lazy(mapper),
            ReferenceSource::Locator(locator) => {
                self.fetch(&router, &locator, &options).await?
            }
        };

        if let References::Eager(mapping) = &refs {
            let first_protocol = mapping
                .read()
                .iter()
                .filter_map(|(_, entry)| entry.locator())
                .find_map(|locator| Locator::parse(locator).protocol.map(str::to_string));
            if let Some(protocol) = first_protocol {
                router.infer_default_protocol(&protocol);
            }
        }

        tracing::info!(
            lazy = matches!(refs, References::Lazy(_)),
            default_protocol = router.default_protocol().unwrap_or(LOCAL_PROTOCOL),
            asynchronous = self.config.asynchronous,
            "reference filesystem ready"
        );
        Ok(ReferenceFileSystem::assemble(
            refs,
            router,
            self.config.asynchronous,
        ))
    }

    async fn fetch(
        &self,
        router: &BackendRouter,
        locator: &str,
        options: &LoadOptions,
    ) -> RefResult<References> {
        let parsed = Locator::parse(locator);
        let protocol = parsed
            .protocol
            .or(self.config.target_protocol.as_deref())
            .unwrap_or(LOCAL_PROTOCOL);
        let backend = router.target(protocol, &self.config.target_options)?;

        if LazyReferenceMapper::is_store(backend.as_ref(), parsed.path).await {
            let mut mapper = LazyReferenceMapper::open(backend, parsed.path).await?;
            if let Some(pages) = self.config.cache_size {
                mapper = mapper.with_cache_size(pages);
            }
            return Ok(References::Lazy(mapper));
        }

        let bytes = backend
            .read_all(Path::new(parsed.path))
            .await
            .map_err(|source| RefError::TargetUnreachable {
                path: locator.to_string(),
                locator: locator.to_string(),
                source,
            })?;
        tracing::debug!(locator, bytes = bytes.len(), "fetched reference document");
        let mapping = ReferenceDocument::from_slice(&bytes)?.expand(options)?;
        Ok(References::eager(mapping))
    }
}
