use crate::config::{NamespaceConfig, DEFAULT_BUCKET_NAME};
use crate::container::bucket::Bucket;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// A namespace and its live buckets.
///
/// `state` guards the bucket map, the default bucket, the dynamic bucket
/// count and the namespace config. Lookups in different namespaces never
/// contend.
pub(crate) struct Namespace {
    name: String,
    state: RwLock<NamespaceState>,
}

pub(crate) struct NamespaceState {
    pub(crate) cfg: NamespaceConfig,
    buckets: HashMap<String, Arc<Bucket>>,
    default_bucket: Option<Arc<Bucket>>,
    /// Live buckets created from the dynamic template.
    dynamic_bucket_count: usize,
}

impl Namespace {
    pub(crate) fn new(
        cfg: NamespaceConfig,
        default_bucket: Option<Arc<Bucket>>,
        buckets: HashMap<String, Arc<Bucket>>,
    ) -> Self {
        Self {
            name: cfg.name.clone(),
            state: RwLock::new(NamespaceState {
                cfg,
                buckets,
                default_bucket,
                dynamic_bucket_count: 0,
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, NamespaceState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, NamespaceState> {
        self.state.write()
    }
}

impl NamespaceState {
    pub(crate) fn get(&self, name: &str) -> Option<&Arc<Bucket>> {
        if name == DEFAULT_BUCKET_NAME {
            return self.default_bucket.as_ref();
        }
        self.buckets.get(name)
    }

    pub(crate) fn default_bucket(&self) -> Option<&Arc<Bucket>> {
        self.default_bucket.as_ref()
    }

    pub(crate) fn dynamic_bucket_count(&self) -> usize {
        self.dynamic_bucket_count
    }

    /// Whether the template may produce one more bucket.
    pub(crate) fn has_dynamic_capacity(&self) -> bool {
        let max = self.cfg.max_dynamic_buckets;
        max == 0 || self.dynamic_bucket_count < max
    }

    /// Insert a bucket, returning the instance it replaced.
    pub(crate) fn insert(&mut self, bucket: Arc<Bucket>) -> Option<Arc<Bucket>> {
        if bucket.name() == DEFAULT_BUCKET_NAME {
            return self.default_bucket.replace(bucket);
        }

        if bucket.is_dynamic() {
            self.dynamic_bucket_count += 1;
        }
        let old = self.buckets.insert(bucket.name().to_string(), bucket);
        if let Some(old) = &old {
            self.forget(old);
        }
        old
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Arc<Bucket>> {
        if name == DEFAULT_BUCKET_NAME {
            return self.default_bucket.take();
        }

        let removed = self.buckets.remove(name);
        if let Some(bucket) = &removed {
            self.forget(bucket);
        }
        removed
    }

    fn forget(&mut self, bucket: &Bucket) {
        if bucket.is_dynamic() {
            self.dynamic_bucket_count -= 1;
        }
    }

    /// Take every live bucket out of the namespace.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Bucket>> {
        self.dynamic_bucket_count = 0;
        let mut drained: Vec<Arc<Bucket>> = self.buckets.drain().map(|(_, b)| b).collect();
        drained.extend(self.default_bucket.take());
        drained
    }

    /// Live bucket names, sorted.
    pub(crate) fn bucket_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.buckets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
