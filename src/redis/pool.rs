use crate::config::loader::mask_password;
use crate::config::RedisConfig;
use crate::errors::{QuotaError, Result};
use deadpool::managed::PoolConfig as DeadpoolPoolConfig;
use deadpool_redis::{Config as DeadpoolRedisConfig, Pool, PoolError, Runtime};
use redis::RedisError;
use tracing::{debug, info};

/// Build a Redis connection pool without touching the network
pub fn build_redis_pool(config: &RedisConfig) -> Result<Pool> {
    let mut cfg = DeadpoolRedisConfig::from_url(config.url.clone());

    let mut pool_cfg = DeadpoolPoolConfig::new(config.max_connections);
    pool_cfg.timeouts.wait = Some(config.connection_timeout());
    pool_cfg.timeouts.create = Some(config.connection_timeout());
    cfg.pool = Some(pool_cfg);

    cfg.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
        QuotaError::RedisConnectionError(RedisError::from((
            redis::ErrorKind::IoError,
            "Pool creation failed",
            e.to_string(),
        )))
    })
}

/// Create a Redis connection pool and check that Redis answers
pub async fn create_redis_pool(config: &RedisConfig) -> Result<Pool> {
    info!("Creating Redis connection pool for {}", mask_password(&config.url));

    let pool = build_redis_pool(config)?;

    debug!("Testing Redis connection...");
    ping(&pool).await?;

    info!(
        "Redis connection pool created (max_connections: {})",
        config.max_connections
    );
    Ok(pool)
}

/// PING through a pooled connection
pub async fn ping(pool: &Pool) -> Result<()> {
    let mut conn = pool.get().await.map_err(pool_error)?;

    let response: String = redis::cmd("PING").query_async(&mut *conn).await?;
    if response != "PONG" {
        return Err(QuotaError::InternalError(format!(
            "Unexpected PING response: {}",
            response
        )));
    }
    Ok(())
}

pub(crate) fn pool_error(e: PoolError) -> QuotaError {
    QuotaError::RedisConnectionError(RedisError::from((
        redis::ErrorKind::IoError,
        "Failed to get connection",
        e.to_string(),
    )))
}

/// Get pool statistics
pub fn get_pool_stats(pool: &Pool) -> PoolStats {
    let status = pool.status();
    PoolStats {
        size: status.size,
        available: status.available,
        max_size: status.max_size,
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub max_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_pool_is_lazy() {
        let mut cfg = RedisConfig::default();
        cfg.url = "redis://127.0.0.1:1".to_string();
        cfg.max_connections = 4;

        let pool = build_redis_pool(&cfg).unwrap();
        let stats = get_pool_stats(&pool);
        assert_eq!(stats.size, 0);
        assert_eq!(stats.max_size, 4);
    }
}
