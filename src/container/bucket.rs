use crate::config::{fully_qualified_name, BucketConfig};
use crate::limiter::{RateLimiter, TakeOutcome};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Single-slot activity marker shared between a bucket and its watcher.
#[derive(Debug)]
pub struct ActivityFlag {
    active: AtomicBool,
    destroyed: AtomicBool,
}

impl ActivityFlag {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn touch(&self) {
        if !self.active.load(Ordering::Relaxed) {
            self.active.store(true, Ordering::Relaxed);
        }
    }

    /// Clear the flag, returning whether activity was seen since the last drain.
    pub fn drain(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}

impl Default for ActivityFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// A live bucket as handed out by the container.
pub struct Bucket {
    namespace: String,
    name: String,
    dynamic: bool,
    limiter: Box<dyn RateLimiter>,
    /// Present when the bucket is watched by the reaper.
    activity: Option<Arc<ActivityFlag>>,
    destroyed: AtomicBool,
}

impl Bucket {
    pub(crate) fn new(
        namespace: &str,
        name: &str,
        dynamic: bool,
        limiter: Box<dyn RateLimiter>,
        watched: bool,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            dynamic,
            limiter,
            activity: watched.then(|| Arc::new(ActivityFlag::new())),
            destroyed: AtomicBool::new(false),
        }
    }

    pub async fn take(&self, requested: u64, max_wait: Duration) -> TakeOutcome {
        self.report_activity();
        self.limiter.take(requested, max_wait).await
    }

    pub fn report_activity(&self) {
        if let Some(flag) = &self.activity {
            flag.touch();
        }
    }

    pub fn config(&self) -> &BucketConfig {
        self.limiter.config()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fqn(&self) -> String {
        fully_qualified_name(&self.namespace, &self.name)
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn activity(&self) -> Option<&Arc<ActivityFlag>> {
        self.activity.as_ref()
    }

    /// Release the limiter. Safe to call more than once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(flag) = &self.activity {
            flag.mark_destroyed();
        }
        self.limiter.destroy();
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("dynamic", &self.dynamic)
            .field("watched", &self.activity.is_some())
            .finish()
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.config();
        write!(
            f,
            "{} (size: {}, fill_rate: {}/s, max_debt: {}ms, max_idle: {}ms{})",
            self.name,
            cfg.size,
            cfg.fill_rate,
            cfg.max_debt_millis,
            cfg.max_idle_millis,
            if self.dynamic { ", dynamic" } else { "" }
        )
    }
}
