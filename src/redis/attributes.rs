//! Script parameters derived from a bucket config.
//!
//! Dynamic buckets of one namespace are all built from the same template, so
//! they share a single reference-counted set of attributes.

use crate::config::BucketConfig;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigAttributes {
    pub nanos_between_tokens: i64,
    pub max_tokens: i64,
    pub max_debt_nanos: i64,
    /// TTL of the bucket keys in Redis
    pub idle_ttl_millis: i64,
}

impl ConfigAttributes {
    /// `key_max_idle` applies when the bucket itself never goes idle.
    pub fn new(cfg: &BucketConfig, key_max_idle: Duration) -> Self {
        let idle_ttl_millis = if cfg.max_idle_millis > 0 {
            cfg.max_idle_millis
        } else {
            i64::try_from(key_max_idle.as_millis()).unwrap_or(i64::MAX)
        };

        Self {
            nanos_between_tokens: cfg.nanos_between_tokens(),
            max_tokens: i64::try_from(cfg.size).unwrap_or(i64::MAX),
            max_debt_nanos: cfg.max_debt_nanos(),
            idle_ttl_millis,
        }
    }
}

struct SharedEntry {
    attributes: Arc<ConfigAttributes>,
    refcount: usize,
}

/// Per-namespace attributes shared by live dynamic buckets.
#[derive(Default)]
pub struct SharedAttributes {
    entries: DashMap<String, SharedEntry>,
}

impl SharedAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on the namespace's attributes, building them on first use.
    pub fn acquire<F>(&self, namespace: &str, build: F) -> Arc<ConfigAttributes>
    where
        F: FnOnce() -> ConfigAttributes,
    {
        let mut entry = self
            .entries
            .entry(namespace.to_string())
            .or_insert_with(|| SharedEntry {
                attributes: Arc::new(build()),
                refcount: 0,
            });
        entry.refcount += 1;
        Arc::clone(&entry.attributes)
    }

    /// Drop a reference; the entry goes away with the last one.
    ///
    /// # Panics
    ///
    /// Releasing more references than were acquired is a bookkeeping bug and panics.
    pub fn release(&self, namespace: &str) {
        let last = match self.entries.get_mut(namespace) {
            Some(mut entry) => {
                assert!(
                    entry.refcount > 0,
                    "attribute refcount for namespace {} dropped below zero",
                    namespace
                );
                entry.refcount -= 1;
                entry.refcount == 0
            }
            None => panic!(
                "released attributes of namespace {} which were never acquired",
                namespace
            ),
        };

        if last {
            self.entries.remove_if(namespace, |_, entry| entry.refcount == 0);
        }
    }

    pub fn refcount(&self, namespace: &str) -> usize {
        self.entries.get(namespace).map(|e| e.refcount).unwrap_or(0)
    }
}
