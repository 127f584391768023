use crate::config::{BucketConfig, RedisConfig, ServiceConfig};
use crate::errors::Result;
use crate::limiter::{LimiterFactory, RateLimiter};
use crate::redis::attributes::{ConfigAttributes, SharedAttributes};
use crate::redis::bucket::RedisLimiter;
use crate::redis::client::RedisClientImpl;
use crate::redis::keys::{bucket_scan_pattern, existing_buckets, find_keys_to_delete, BucketKeys};
use crate::redis::RedisClient;
use async_trait::async_trait;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds [`RedisLimiter`]s that all go through one Redis client.
pub struct RedisLimiterFactory {
    client: Arc<RedisClientImpl>,
    shared: Arc<SharedAttributes>,
    version: AtomicI32,
    key_max_idle: Duration,
    purge_unknown_keys: bool,
}

impl RedisLimiterFactory {
    pub fn new(cfg: RedisConfig) -> Result<Self> {
        let key_max_idle = cfg.key_max_idle();
        let purge_unknown_keys = cfg.purge_unknown_keys;
        Ok(Self {
            client: Arc::new(RedisClientImpl::new(cfg)?),
            shared: Arc::new(SharedAttributes::new()),
            version: AtomicI32::new(0),
            key_max_idle,
            purge_unknown_keys,
        })
    }

    pub fn client(&self) -> &Arc<RedisClientImpl> {
        &self.client
    }

    pub fn shared_attributes(&self) -> &Arc<SharedAttributes> {
        &self.shared
    }

    /// Delete keys of buckets the configuration no longer has
    pub async fn purge_unknown_keys(&self, cfg: &ServiceConfig) -> Result<u64> {
        let keys = self.client.scan_keys(&bucket_scan_pattern(cfg.version)).await?;
        let existing = existing_buckets(&keys);
        let to_delete = find_keys_to_delete(&existing, cfg, cfg.version);

        if to_delete.is_empty() {
            debug!("No stale bucket keys found");
            return Ok(0);
        }

        let deleted = self.client.delete_keys(&to_delete).await?;
        info!("Deleted {} stale bucket keys", deleted);
        Ok(deleted)
    }
}

#[async_trait]
impl LimiterFactory for RedisLimiterFactory {
    async fn init(&self, cfg: &ServiceConfig) -> Result<()> {
        self.version.store(cfg.version, Ordering::Release);

        // An unreachable Redis is not fatal: the client keeps reconnecting
        // and buckets reject requests meanwhile.
        if let Err(e) = self.client.health_check().await {
            warn!("Cannot connect to Redis, continuing in degraded mode: {}", e);
            return Ok(());
        }

        if let Err(e) = self.client.load_take_script().await {
            warn!("Failed to preload take script: {}", e);
        }

        if self.purge_unknown_keys {
            if let Err(e) = self.purge_unknown_keys(cfg).await {
                warn!("Failed to purge stale bucket keys: {}", e);
            }
        }

        info!(
            "Initialized Redis limiter factory for config version {}",
            cfg.version
        );
        Ok(())
    }

    fn new_limiter(
        &self,
        namespace: &str,
        name: &str,
        cfg: &BucketConfig,
        dynamic: bool,
    ) -> Result<Box<dyn RateLimiter>> {
        let version = self.version.load(Ordering::Acquire);
        let keys = BucketKeys::new(namespace, name, version);

        let (attributes, shared) = if dynamic {
            let attributes = self
                .shared
                .acquire(namespace, || ConfigAttributes::new(cfg, self.key_max_idle));
            (attributes, Some(Arc::clone(&self.shared)))
        } else {
            (Arc::new(ConfigAttributes::new(cfg, self.key_max_idle)), None)
        };

        debug!(
            "Creating Redis bucket {} (dynamic: {}, ttl: {}ms)",
            keys.accumulated_tokens, dynamic, attributes.idle_ttl_millis
        );

        let client: Arc<dyn RedisClient> = self.client.clone();
        Ok(Box::new(RedisLimiter::new(
            cfg.clone(),
            namespace,
            keys,
            attributes,
            shared,
            client,
        )))
    }

    fn stop(&self) {
        self.client.close();
        info!("Redis limiter factory stopped");
    }
}
