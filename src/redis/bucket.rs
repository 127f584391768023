use crate::config::BucketConfig;
use crate::limiter::{duration_nanos, RateLimiter, TakeOutcome};
use crate::redis::attributes::{ConfigAttributes, SharedAttributes};
use crate::redis::keys::BucketKeys;
use crate::redis::script::TakeArgs;
use crate::redis::RedisClient;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Bucket whose state lives in Redis, shared by every service instance.
pub struct RedisLimiter {
    cfg: BucketConfig,
    namespace: String,
    keys: BucketKeys,
    attributes: Arc<ConfigAttributes>,
    /// Set for dynamic buckets, which borrow their namespace's attributes.
    shared: Option<Arc<SharedAttributes>>,
    client: Arc<dyn RedisClient>,
    destroyed: AtomicBool,
}

impl RedisLimiter {
    pub(crate) fn new(
        cfg: BucketConfig,
        namespace: &str,
        keys: BucketKeys,
        attributes: Arc<ConfigAttributes>,
        shared: Option<Arc<SharedAttributes>>,
        client: Arc<dyn RedisClient>,
    ) -> Self {
        Self {
            cfg,
            namespace: namespace.to_string(),
            keys,
            attributes,
            shared,
            client,
            destroyed: AtomicBool::new(false),
        }
    }
}

fn unix_nanos() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration_nanos(since_epoch)
}

#[async_trait]
impl RateLimiter for RedisLimiter {
    async fn take(&self, requested: u64, max_wait: Duration) -> TakeOutcome {
        if !self.client.is_healthy() {
            debug!(
                "Redis unavailable, rejecting request on {}",
                self.keys.accumulated_tokens
            );
            return TakeOutcome::rejected();
        }

        let args = TakeArgs {
            now_nanos: unix_nanos(),
            nanos_between_tokens: self.attributes.nanos_between_tokens,
            max_tokens: self.attributes.max_tokens,
            requested: i64::try_from(requested).unwrap_or(i64::MAX),
            max_wait_nanos: duration_nanos(max_wait),
            idle_ttl_millis: self.attributes.idle_ttl_millis,
            max_debt_nanos: self.attributes.max_debt_nanos,
        };

        match self.client.execute_take_script(&self.keys, &args).await {
            Ok(wait_nanos) => TakeOutcome::from_wait_nanos(wait_nanos),
            Err(e) => {
                warn!("Take on {} failed: {}", self.keys.accumulated_tokens, e);
                TakeOutcome::rejected()
            }
        }
    }

    fn config(&self) -> &BucketConfig {
        &self.cfg
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = &self.shared {
            shared.release(&self.namespace);
        }
    }
}
