//! Registry of namespaces and their live buckets.
//!
//! Lookups resolve a `(namespace, name)` pair to a [`Bucket`], falling back
//! to namespace and global defaults, and create dynamic buckets on first use.
//! Buckets with a max idle time are handed to the reaper.

pub mod bucket;
mod namespace;
pub mod reaper;

pub use bucket::{ActivityFlag, Bucket};

use crate::config::validator::{validate_bucket_config, validate_namespace_config};
use crate::config::{
    BucketConfig, NamespaceConfig, ReaperConfig, ServiceConfig, DEFAULT_BUCKET_NAME,
    DYNAMIC_BUCKET_TEMPLATE_NAME, GLOBAL_NAMESPACE,
};
use crate::errors::{QuotaError, Result};
use crate::events::{Event, EventSink};
use crate::limiter::LimiterFactory;
use namespace::{Namespace, NamespaceState};
use parking_lot::RwLock;
use reaper::{Reap, ReaperHandle, Watcher};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn is_reserved_bucket_name(name: &str) -> bool {
    name == DEFAULT_BUCKET_NAME || name == DYNAMIC_BUCKET_TEMPLATE_NAME
}

pub struct BucketContainer {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    factory: Arc<dyn LimiterFactory>,
    events: Arc<dyn EventSink>,
    /// Guards the namespace map and the global default bucket.
    state: RwLock<ContainerState>,
    reaper: ReaperHandle,
    stopped: AtomicBool,
}

#[derive(Default)]
struct ContainerState {
    version: i32,
    global_default: Option<Arc<Bucket>>,
    namespaces: HashMap<String, Arc<Namespace>>,
}

impl BucketContainer {
    /// Initialize the factory, start the reaper and create every configured bucket.
    pub async fn new(
        cfg: ServiceConfig,
        factory: Arc<dyn LimiterFactory>,
        events: Arc<dyn EventSink>,
        reaper_cfg: ReaperConfig,
    ) -> Result<Self> {
        factory.init(&cfg).await?;

        let (reaper, intake) = reaper::channel();
        let inner = Arc::new(ContainerInner {
            factory,
            events,
            state: RwLock::new(ContainerState::default()),
            reaper,
            stopped: AtomicBool::new(false),
        });
        reaper::start(reaper_cfg, Arc::downgrade(&inner), intake);

        let mut global_default = None;
        if let Some(bucket_cfg) = &cfg.global_default_bucket {
            global_default = Some(inner.create_bucket(
                GLOBAL_NAMESPACE,
                DEFAULT_BUCKET_NAME,
                bucket_cfg,
                false,
            )?);
        }

        let mut namespaces = HashMap::new();
        for name in cfg.namespace_names() {
            let ns_cfg = cfg.namespaces[&name].clone();
            let ns = inner.build_namespace(ns_cfg)?;
            namespaces.insert(name, Arc::new(ns));
        }

        {
            let mut state = inner.state.write();
            state.version = cfg.version;
            state.global_default = global_default;
            state.namespaces = namespaces;
        }

        info!(
            "Bucket container initialized with {} namespaces (config version {})",
            cfg.namespaces.len(),
            cfg.version
        );
        Ok(Self { inner })
    }

    /// Resolve a bucket, creating it when the namespace allows.
    pub fn find_bucket(&self, namespace: &str, name: &str) -> Result<Arc<Bucket>> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(QuotaError::Stopped);
        }

        let ns = {
            let state = self.inner.state.read();
            match state.namespaces.get(namespace) {
                Some(ns) => Arc::clone(ns),
                None => {
                    return match &state.global_default {
                        Some(global) => Ok(Arc::clone(global)),
                        None => Err(self.inner.miss(namespace, name)),
                    }
                }
            }
        };

        {
            let state = ns.read();
            if let Some(bucket) = state.get(name) {
                bucket.report_activity();
                return Ok(Arc::clone(bucket));
            }

            // Reserved names only ever resolve to the namespace default.
            let creatable = !is_reserved_bucket_name(name)
                && (state.cfg.buckets.contains_key(name)
                    || state.cfg.dynamic_bucket_template.is_some());
            if !creatable {
                return self.inner.namespace_default(&state, namespace, name);
            }
        }

        let mut state = ns.write();

        // Another caller may have created it while we waited for the lock.
        if let Some(bucket) = state.get(name) {
            bucket.report_activity();
            return Ok(Arc::clone(bucket));
        }

        if let Some(bucket_cfg) = state.cfg.buckets.get(name).cloned() {
            debug!("Recreating static bucket {}:{}", namespace, name);
            let bucket = self.inner.create_bucket(namespace, name, &bucket_cfg, false)?;
            state.insert(Arc::clone(&bucket));
            return Ok(bucket);
        }

        if let Some(template) = state.cfg.dynamic_bucket_template.clone() {
            if !state.has_dynamic_capacity() {
                warn!(
                    "Cannot create dynamic bucket {}:{}, {} dynamic buckets already live",
                    namespace,
                    name,
                    state.dynamic_bucket_count()
                );
                return Err(QuotaError::TooManyBuckets {
                    namespace: namespace.to_string(),
                    bucket: name.to_string(),
                    max: state.cfg.max_dynamic_buckets,
                });
            }

            let mut bucket_cfg = template;
            bucket_cfg.namespace = namespace.to_string();
            bucket_cfg.name = name.to_string();

            let bucket = self.inner.create_bucket(namespace, name, &bucket_cfg, true)?;
            state.insert(Arc::clone(&bucket));
            debug!(
                "Created dynamic bucket {}:{} ({} live)",
                namespace,
                name,
                state.dynamic_bucket_count()
            );
            return Ok(bucket);
        }

        self.inner.namespace_default(&state, namespace, name)
    }

    pub fn namespace_exists(&self, namespace: &str) -> bool {
        self.inner.state.read().namespaces.contains_key(namespace)
    }

    /// Whether a live bucket answers to exactly this name, defaults not considered.
    pub fn bucket_exists(&self, namespace: &str, name: &str) -> bool {
        let state = self.inner.state.read();
        if namespace == GLOBAL_NAMESPACE && name == DEFAULT_BUCKET_NAME {
            return state.global_default.is_some();
        }
        match state.namespaces.get(namespace) {
            Some(ns) => ns.read().get(name).is_some(),
            None => false,
        }
    }

    /// Remove and destroy a live bucket. Returns false if there was none.
    pub fn remove_bucket(&self, namespace: &str, name: &str) -> bool {
        self.inner.remove_where(namespace, name, |_| true)
    }

    /// Number of live dynamic buckets in a namespace.
    pub fn dynamic_bucket_count(&self, namespace: &str) -> Option<usize> {
        let state = self.inner.state.read();
        state
            .namespaces
            .get(namespace)
            .map(|ns| ns.read().dynamic_bucket_count())
    }

    pub fn create_namespace(&self, mut cfg: NamespaceConfig) -> Result<()> {
        cfg.apply_defaults();
        validate_namespace_config(&cfg)?;
        self.inner.check_running()?;

        let mut state = self.inner.state.write();
        if state.namespaces.contains_key(&cfg.name) {
            return Err(QuotaError::NamespaceExists(cfg.name));
        }

        let name = cfg.name.clone();
        let ns = self.inner.build_namespace(cfg)?;
        state.namespaces.insert(name.clone(), Arc::new(ns));
        info!("Created namespace {}", name);
        Ok(())
    }

    /// Replace a namespace; its live buckets, dynamic ones included, are destroyed.
    pub fn update_namespace(&self, mut cfg: NamespaceConfig) -> Result<()> {
        cfg.apply_defaults();
        validate_namespace_config(&cfg)?;
        self.inner.check_running()?;

        let old = {
            let mut state = self.inner.state.write();
            if !state.namespaces.contains_key(&cfg.name) {
                return Err(QuotaError::NoNamespace(cfg.name));
            }
            let name = cfg.name.clone();
            let ns = self.inner.build_namespace(cfg)?;
            state.namespaces.insert(name, Arc::new(ns))
        };

        if let Some(old) = old {
            self.inner.retire_namespace(&old);
            info!("Updated namespace {}", old.name());
        }
        Ok(())
    }

    pub fn remove_namespace(&self, namespace: &str) -> Result<()> {
        let removed = self.inner.state.write().namespaces.remove(namespace);
        match removed {
            Some(ns) => {
                self.inner.retire_namespace(&ns);
                info!("Removed namespace {}", namespace);
                Ok(())
            }
            None => Err(QuotaError::NoNamespace(namespace.to_string())),
        }
    }

    /// Add a static bucket, or the namespace default when named `___DEFAULT_BUCKET___`.
    pub fn add_bucket(&self, namespace: &str, cfg: BucketConfig) -> Result<()> {
        self.put_bucket(namespace, cfg, false)
    }

    /// Replace a static bucket's config and its live instance.
    pub fn update_bucket(&self, namespace: &str, cfg: BucketConfig) -> Result<()> {
        self.put_bucket(namespace, cfg, true)
    }

    /// Remove a static bucket from the config and destroy its live instance.
    pub fn delete_bucket(&self, namespace: &str, name: &str) -> Result<()> {
        let ns = self.inner.namespace(namespace)?;
        let removed = {
            let mut state = ns.write();
            let known = if name == DEFAULT_BUCKET_NAME {
                state.cfg.default_bucket.take().is_some()
            } else {
                state.cfg.buckets.remove(name).is_some()
            };
            if !known {
                return Err(QuotaError::no_bucket(namespace, name));
            }
            state.remove(name)
        };

        if let Some(bucket) = removed {
            self.inner.retire(&bucket);
        }
        Ok(())
    }

    /// Install, replace or clear the global default bucket.
    pub fn set_global_default(&self, cfg: Option<BucketConfig>) -> Result<()> {
        self.inner.check_running()?;

        let bucket = match cfg {
            Some(mut cfg) => {
                cfg.namespace = GLOBAL_NAMESPACE.to_string();
                cfg.name = DEFAULT_BUCKET_NAME.to_string();
                cfg.apply_defaults();
                validate_bucket_config(&cfg)?;
                Some(self.inner.create_bucket(GLOBAL_NAMESPACE, DEFAULT_BUCKET_NAME, &cfg, false)?)
            }
            None => None,
        };

        let old = std::mem::replace(&mut self.inner.state.write().global_default, bucket);
        if let Some(old) = old {
            self.inner.retire(&old);
        }
        Ok(())
    }

    /// Snapshot of the configuration the container currently serves.
    pub fn config(&self) -> ServiceConfig {
        let state = self.inner.state.read();
        ServiceConfig {
            version: state.version,
            global_default_bucket: state.global_default.as_ref().map(|b| b.config().clone()),
            namespaces: state
                .namespaces
                .iter()
                .map(|(name, ns)| (name.clone(), ns.read().cfg.clone()))
                .collect(),
        }
    }

    /// Stop the reaper and destroy every bucket.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.reaper.stop();

        let (global, namespaces) = {
            let mut state = self.inner.state.write();
            let namespaces: Vec<Arc<Namespace>> =
                state.namespaces.drain().map(|(_, ns)| ns).collect();
            (state.global_default.take(), namespaces)
        };

        let mut destroyed = 0;
        for ns in namespaces {
            for bucket in ns.write().drain() {
                bucket.destroy();
                destroyed += 1;
            }
        }
        if let Some(global) = global {
            global.destroy();
            destroyed += 1;
        }
        self.inner.factory.stop();

        info!("Bucket container stopped, {} buckets destroyed", destroyed);
    }

    fn put_bucket(&self, namespace: &str, mut cfg: BucketConfig, replace: bool) -> Result<()> {
        self.inner.check_running()?;
        if cfg.name.is_empty() {
            return Err(QuotaError::ConfigurationError(format!(
                "Bucket name cannot be empty in namespace '{}'",
                namespace
            )));
        }
        cfg.namespace = namespace.to_string();
        cfg.apply_defaults();
        validate_bucket_config(&cfg)?;

        let ns = self.inner.namespace(namespace)?;
        let old = {
            let mut state = ns.write();
            let is_default = cfg.name == DEFAULT_BUCKET_NAME;
            let known = if is_default {
                state.cfg.default_bucket.is_some()
            } else {
                state.cfg.buckets.contains_key(&cfg.name)
            };

            if known != replace {
                return Err(QuotaError::ConfigurationError(if replace {
                    format!("Bucket {} does not exist", cfg.fqn())
                } else {
                    format!("Bucket {} already exists", cfg.fqn())
                }));
            }
            if is_default && state.cfg.dynamic_bucket_template.is_some() {
                return Err(QuotaError::ConfigurationError(format!(
                    "Namespace '{}' allows dynamic buckets and cannot have a default bucket",
                    namespace
                )));
            }

            let bucket = self.inner.create_bucket(namespace, &cfg.name, &cfg, false)?;
            if is_default {
                state.cfg.default_bucket = Some(cfg);
            } else {
                state.cfg.buckets.insert(cfg.name.clone(), cfg);
            }
            state.insert(bucket)
        };

        if let Some(old) = old {
            self.inner.retire(&old);
        }
        Ok(())
    }
}

impl ContainerInner {
    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(QuotaError::Stopped);
        }
        Ok(())
    }

    fn namespace(&self, namespace: &str) -> Result<Arc<Namespace>> {
        self.state
            .read()
            .namespaces
            .get(namespace)
            .cloned()
            .ok_or_else(|| QuotaError::NoNamespace(namespace.to_string()))
    }

    fn miss(&self, namespace: &str, name: &str) -> QuotaError {
        self.events.emit(Event::bucket_miss(namespace, name));
        QuotaError::no_bucket(namespace, name)
    }

    fn namespace_default(
        &self,
        state: &NamespaceState,
        namespace: &str,
        name: &str,
    ) -> Result<Arc<Bucket>> {
        match state.default_bucket() {
            Some(bucket) => Ok(Arc::clone(bucket)),
            None => Err(self.miss(namespace, name)),
        }
    }

    /// Build a bucket and, when it has a max idle time, register its watcher.
    fn create_bucket(
        &self,
        namespace: &str,
        name: &str,
        cfg: &BucketConfig,
        dynamic: bool,
    ) -> Result<Arc<Bucket>> {
        let max_idle = if name == DEFAULT_BUCKET_NAME {
            None
        } else {
            cfg.max_idle()
        };

        let limiter = self.factory.new_limiter(namespace, name, cfg, dynamic)?;
        let bucket = Arc::new(Bucket::new(
            namespace,
            name,
            dynamic,
            limiter,
            max_idle.is_some(),
        ));

        if let (Some(flag), Some(max_idle)) = (bucket.activity(), max_idle) {
            let watcher = Watcher::new(namespace, name, Arc::clone(flag), max_idle);
            if !self.reaper.watch(watcher) {
                bucket.destroy();
                return Err(QuotaError::Stopped);
            }
        }

        self.events
            .emit(Event::bucket_created(namespace, name, dynamic));
        Ok(bucket)
    }

    fn build_namespace(&self, cfg: NamespaceConfig) -> Result<Namespace> {
        let mut created: Vec<Arc<Bucket>> = Vec::new();
        let result = self.create_namespace_buckets(&cfg, &mut created);
        if let Err(e) = result {
            for bucket in created {
                bucket.destroy();
            }
            return Err(e);
        }

        let mut default_bucket = None;
        let mut buckets = HashMap::new();
        for bucket in created {
            if bucket.name() == DEFAULT_BUCKET_NAME {
                default_bucket = Some(bucket);
            } else {
                buckets.insert(bucket.name().to_string(), bucket);
            }
        }

        Ok(Namespace::new(cfg, default_bucket, buckets))
    }

    fn create_namespace_buckets(
        &self,
        cfg: &NamespaceConfig,
        created: &mut Vec<Arc<Bucket>>,
    ) -> Result<()> {
        if let Some(bucket_cfg) = &cfg.default_bucket {
            created.push(self.create_bucket(&cfg.name, DEFAULT_BUCKET_NAME, bucket_cfg, false)?);
        }

        let mut names: Vec<&String> = cfg.buckets.keys().collect();
        names.sort();
        for name in names {
            created.push(self.create_bucket(&cfg.name, name, &cfg.buckets[name], false)?);
        }
        Ok(())
    }

    fn retire(&self, bucket: &Bucket) {
        bucket.destroy();
        self.events.emit(Event::bucket_removed(
            bucket.namespace(),
            bucket.name(),
            bucket.is_dynamic(),
        ));
    }

    fn retire_namespace(&self, ns: &Namespace) {
        let buckets = ns.write().drain();
        for bucket in &buckets {
            self.retire(bucket);
        }
    }

    /// Remove `namespace:name` when `pred` accepts the live instance.
    fn remove_where<F>(&self, namespace: &str, name: &str, pred: F) -> bool
    where
        F: Fn(&Bucket) -> bool,
    {
        let removed = if namespace == GLOBAL_NAMESPACE && name == DEFAULT_BUCKET_NAME {
            let mut state = self.state.write();
            let matches = state.global_default.as_deref().is_some_and(&pred);
            if matches {
                state.global_default.take()
            } else {
                None
            }
        } else {
            let ns = match self.state.read().namespaces.get(namespace) {
                Some(ns) => Arc::clone(ns),
                None => return false,
            };
            let mut state = ns.write();
            let matches = state.get(name).is_some_and(|bucket| pred(bucket));
            if matches {
                state.remove(name)
            } else {
                None
            }
        };

        match removed {
            Some(bucket) => {
                self.retire(&bucket);
                true
            }
            None => false,
        }
    }
}

impl Reap for ContainerInner {
    fn reap(&self, namespace: &str, name: &str, flag: &Arc<ActivityFlag>) -> bool {
        self.remove_where(namespace, name, |bucket| {
            bucket.activity().is_some_and(|live| Arc::ptr_eq(live, flag))
        })
    }
}

impl fmt::Display for BucketContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        writeln!(f, "Config version: {}", state.version)?;
        match &state.global_default {
            Some(bucket) => writeln!(f, "Global default: {}", bucket)?,
            None => writeln!(f, "Global default: none")?,
        }

        let mut names: Vec<&String> = state.namespaces.keys().collect();
        names.sort();
        for name in names {
            let ns = state.namespaces[name].read();
            writeln!(
                f,
                "Namespace {} (dynamic buckets: {}/{})",
                name,
                ns.dynamic_bucket_count(),
                ns.cfg.max_dynamic_buckets
            )?;
            if let Some(default) = ns.default_bucket() {
                writeln!(f, "  default: {}", default)?;
            }
            for bucket_name in ns.bucket_names() {
                if let Some(bucket) = ns.get(bucket_name) {
                    writeln!(f, "  {}", bucket)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::RecordingSink;
    use crate::events::EventType;
    use crate::limiter::{RateLimiter, TakeOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct NoopLimiter {
        cfg: BucketConfig,
        destroyed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RateLimiter for NoopLimiter {
        async fn take(&self, _requested: u64, _max_wait: Duration) -> TakeOutcome {
            TakeOutcome::granted(Duration::ZERO)
        }

        fn config(&self) -> &BucketConfig {
            &self.cfg
        }

        fn destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        destroyed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LimiterFactory for CountingFactory {
        async fn init(&self, _cfg: &ServiceConfig) -> Result<()> {
            Ok(())
        }

        fn new_limiter(
            &self,
            _namespace: &str,
            _name: &str,
            cfg: &BucketConfig,
            _dynamic: bool,
        ) -> Result<Box<dyn RateLimiter>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NoopLimiter {
                cfg: cfg.clone(),
                destroyed: Arc::clone(&self.destroyed),
            }))
        }
    }

    fn service_config() -> ServiceConfig {
        let mut cfg = ServiceConfig::default();
        cfg.global_default_bucket = Some(BucketConfig::default());

        let mut fixed = NamespaceConfig::default();
        fixed.default_bucket = Some(BucketConfig::default());
        fixed.buckets.insert("one".to_string(), BucketConfig::default());
        cfg.namespaces.insert("fixed".to_string(), fixed);

        let mut dynamic = NamespaceConfig::default();
        dynamic.dynamic_bucket_template = Some(BucketConfig::default());
        dynamic.max_dynamic_buckets = 5;
        cfg.namespaces.insert("dyn".to_string(), dynamic);

        cfg.apply_defaults();
        cfg
    }

    struct Fixture {
        container: BucketContainer,
        factory: Arc<CountingFactory>,
        events: Arc<RecordingSink>,
    }

    async fn fixture(cfg: ServiceConfig, reaper: ReaperConfig) -> Fixture {
        let factory = Arc::new(CountingFactory::default());
        let events = Arc::new(RecordingSink::default());
        let container = BucketContainer::new(
            cfg,
            Arc::clone(&factory) as Arc<dyn LimiterFactory>,
            Arc::clone(&events) as Arc<dyn EventSink>,
            reaper,
        )
        .await
        .unwrap();
        Fixture {
            container,
            factory,
            events,
        }
    }

    #[tokio::test]
    async fn test_fallbacks() {
        let f = fixture(service_config(), ReaperConfig::default()).await;
        let c = &f.container;

        let b = c.find_bucket("fixed", "one").unwrap();
        assert_eq!(b.fqn(), "fixed:one");

        let b = c.find_bucket("fixed", "unknown").unwrap();
        assert_eq!(b.name(), DEFAULT_BUCKET_NAME);

        let b = c.find_bucket("nowhere", "x").unwrap();
        assert_eq!(b.namespace(), GLOBAL_NAMESPACE);

        assert!(c.remove_bucket(GLOBAL_NAMESPACE, DEFAULT_BUCKET_NAME));
        let err = c.find_bucket("nowhere", "x").unwrap_err();
        assert!(matches!(err, QuotaError::NoBucket { .. }));
        assert_eq!(f.events.count(EventType::BucketMiss), 1);
    }

    #[tokio::test]
    async fn test_dynamic_cap() {
        let f = fixture(service_config(), ReaperConfig::default()).await;
        let c = &f.container;

        for i in 0..5 {
            c.find_bucket("dyn", &i.to_string()).unwrap();
        }
        assert_eq!(c.dynamic_bucket_count("dyn"), Some(5));

        let err = c.find_bucket("dyn", "5").unwrap_err();
        assert!(matches!(err, QuotaError::TooManyBuckets { max: 5, .. }));
        assert_eq!(c.dynamic_bucket_count("dyn"), Some(5));
        assert!(!c.bucket_exists("dyn", "5"));

        // Existing buckets stay usable.
        let b = c.find_bucket("dyn", "3").unwrap();
        assert!(b.take(1, Duration::ZERO).await.granted);

        assert!(c.remove_bucket("dyn", "0"));
        c.find_bucket("dyn", "5").unwrap();
        assert_eq!(c.dynamic_bucket_count("dyn"), Some(5));
    }

    #[tokio::test]
    async fn test_reserved_names_never_create_buckets() {
        let mut cfg = service_config();
        cfg.namespaces.get_mut("dyn").unwrap().max_dynamic_buckets = 2;
        let f = fixture(cfg, ReaperConfig::default()).await;
        let c = &f.container;

        c.find_bucket("dyn", "a").unwrap();
        for reserved in [DEFAULT_BUCKET_NAME, DYNAMIC_BUCKET_TEMPLATE_NAME] {
            let err = c.find_bucket("dyn", reserved).unwrap_err();
            assert!(matches!(err, QuotaError::NoBucket { .. }));
            assert!(!c.bucket_exists("dyn", reserved));
        }
        assert_eq!(c.dynamic_bucket_count("dyn"), Some(1));

        c.find_bucket("dyn", "b").unwrap();
        assert_eq!(c.dynamic_bucket_count("dyn"), Some(2));
        let err = c.find_bucket("dyn", "c").unwrap_err();
        assert!(matches!(err, QuotaError::TooManyBuckets { max: 2, .. }));

        // A static namespace answers reserved names with its default.
        let b = c.find_bucket("fixed", DYNAMIC_BUCKET_TEMPLATE_NAME).unwrap();
        assert_eq!(b.name(), DEFAULT_BUCKET_NAME);
        assert!(!b.is_dynamic());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookups_create_one_instance() {
        let f = fixture(service_config(), ReaperConfig::default()).await;
        let before = f.factory.created.load(Ordering::SeqCst);
        let container = Arc::new(f.container);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let container = Arc::clone(&container);
            handles.push(tokio::spawn(async move {
                container.find_bucket("dyn", "shared").unwrap()
            }));
        }

        let mut buckets = Vec::new();
        for handle in handles {
            buckets.push(handle.await.unwrap());
        }

        assert_eq!(f.factory.created.load(Ordering::SeqCst), before + 1);
        assert!(buckets.iter().all(|b| Arc::ptr_eq(b, &buckets[0])));
        assert_eq!(container.dynamic_bucket_count("dyn"), Some(1));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let f = fixture(service_config(), ReaperConfig::default()).await;
        let c = &f.container;

        assert!(c.remove_bucket(GLOBAL_NAMESPACE, DEFAULT_BUCKET_NAME));
        assert!(!c.remove_bucket(GLOBAL_NAMESPACE, DEFAULT_BUCKET_NAME));
        assert!(!c.remove_bucket("fixed", "never"));
        assert!(!c.remove_bucket("nowhere", "x"));

        c.find_bucket("dyn", "a").unwrap();
        assert!(c.remove_bucket("dyn", "a"));
        assert!(!c.remove_bucket("dyn", "a"));
        assert_eq!(c.dynamic_bucket_count("dyn"), Some(0));
        assert_eq!(f.events.count(EventType::BucketRemoved), 2);
    }

    #[tokio::test]
    async fn test_reaped_static_bucket_is_recreated() {
        let f = fixture(service_config(), ReaperConfig::default()).await;
        let c = &f.container;

        let first = c.find_bucket("fixed", "one").unwrap();
        assert!(c.remove_bucket("fixed", "one"));
        assert!(!c.bucket_exists("fixed", "one"));

        let second = c.find_bucket("fixed", "one").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_destroyed());
        assert_eq!(c.dynamic_bucket_count("fixed"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_dynamic_bucket_is_reaped() {
        let mut cfg = service_config();
        let ns = cfg.namespaces.get_mut("dyn").unwrap();
        ns.dynamic_bucket_template.as_mut().unwrap().max_idle_millis = 250;

        let reaper = ReaperConfig {
            init_sleep: Duration::from_millis(250),
            min_frequency: Duration::from_millis(250),
        };
        let f = fixture(cfg, reaper).await;
        let c = &f.container;

        let first = c.find_bucket("dyn", "idle").unwrap();
        assert!(c.bucket_exists("dyn", "idle"));

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!c.bucket_exists("dyn", "idle"));
        assert_eq!(c.dynamic_bucket_count("dyn"), Some(0));
        assert!(first.is_destroyed());

        let second = c.find_bucket("dyn", "idle").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_bucket_survives_sweeps() {
        let mut cfg = service_config();
        let ns = cfg.namespaces.get_mut("dyn").unwrap();
        ns.dynamic_bucket_template.as_mut().unwrap().max_idle_millis = 250;

        let reaper = ReaperConfig {
            init_sleep: Duration::from_millis(100),
            min_frequency: Duration::from_millis(100),
        };
        let f = fixture(cfg, reaper).await;
        let c = &f.container;

        let bucket = c.find_bucket("dyn", "busy").unwrap();
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(bucket.take(1, Duration::ZERO).await.granted);
        }
        assert!(c.bucket_exists("dyn", "busy"));
    }

    #[tokio::test]
    async fn test_admin_mutations() {
        let f = fixture(service_config(), ReaperConfig::default()).await;
        let c = &f.container;

        let mut ns = NamespaceConfig::new("fresh");
        ns.buckets.insert("a".to_string(), BucketConfig::default());
        c.create_namespace(ns.clone()).unwrap();
        assert!(matches!(
            c.create_namespace(ns).unwrap_err(),
            QuotaError::NamespaceExists(_)
        ));
        assert!(c.bucket_exists("fresh", "a"));

        c.add_bucket("fresh", BucketConfig::new("b")).unwrap();
        assert!(c.add_bucket("fresh", BucketConfig::new("b")).is_err());

        let mut bigger = BucketConfig::new("b");
        bigger.size = 500;
        c.update_bucket("fresh", bigger).unwrap();
        assert_eq!(c.find_bucket("fresh", "b").unwrap().config().size, 500);

        c.delete_bucket("fresh", "b").unwrap();
        assert!(!c.bucket_exists("fresh", "b"));
        assert!(c.delete_bucket("fresh", "b").is_err());

        let mut invalid = NamespaceConfig::new("bad");
        invalid.default_bucket = Some(BucketConfig::default());
        invalid.dynamic_bucket_template = Some(BucketConfig::default());
        assert!(c.create_namespace(invalid).is_err());
        assert!(!c.namespace_exists("bad"));

        c.remove_namespace("fresh").unwrap();
        assert!(!c.namespace_exists("fresh"));
        assert!(matches!(
            c.remove_namespace("fresh").unwrap_err(),
            QuotaError::NoNamespace(_)
        ));
    }

    #[tokio::test]
    async fn test_update_namespace_replaces_buckets() {
        let f = fixture(service_config(), ReaperConfig::default()).await;
        let c = &f.container;

        let old = c.find_bucket("dyn", "x").unwrap();
        let mut ns = NamespaceConfig::new("dyn");
        ns.dynamic_bucket_template = Some(BucketConfig::default());
        ns.max_dynamic_buckets = 1;
        c.update_namespace(ns).unwrap();

        assert!(old.is_destroyed());
        assert_eq!(c.dynamic_bucket_count("dyn"), Some(0));
        c.find_bucket("dyn", "y").unwrap();
        assert!(c.find_bucket("dyn", "z").is_err());
        assert_eq!(c.config().namespaces["dyn"].max_dynamic_buckets, 1);
    }

    #[tokio::test]
    async fn test_set_global_default() {
        let f = fixture(ServiceConfig::default(), ReaperConfig::default()).await;
        let c = &f.container;
        assert!(c.find_bucket("any", "b").is_err());

        c.set_global_default(Some(BucketConfig::default())).unwrap();
        assert!(c.find_bucket("any", "b").is_ok());
        assert!(c.bucket_exists(GLOBAL_NAMESPACE, DEFAULT_BUCKET_NAME));

        c.set_global_default(None).unwrap();
        assert!(c.find_bucket("any", "b").is_err());
    }

    #[tokio::test]
    async fn test_stop_destroys_everything() {
        let f = fixture(service_config(), ReaperConfig::default()).await;
        let c = &f.container;
        c.find_bucket("dyn", "a").unwrap();
        let created = f.factory.created.load(Ordering::SeqCst);

        c.stop();
        c.stop();
        assert_eq!(f.factory.destroyed.load(Ordering::SeqCst), created);
        assert!(matches!(
            c.find_bucket("dyn", "b").unwrap_err(),
            QuotaError::Stopped
        ));
        assert!(c.create_namespace(NamespaceConfig::new("late")).is_err());
    }

    #[tokio::test]
    async fn test_display_is_sorted() {
        let f = fixture(service_config(), ReaperConfig::default()).await;
        let text = f.container.to_string();
        let dyn_pos = text.find("Namespace dyn").unwrap();
        let fixed_pos = text.find("Namespace fixed").unwrap();
        assert!(dyn_pos < fixed_pos);
        assert!(text.contains("  one (size: 100"));
    }
}
