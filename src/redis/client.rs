use crate::config::RedisConfig;
use crate::errors::{QuotaError, Result};
use crate::metrics;
use crate::redis::backoff::Backoff;
use crate::redis::keys::{BucketKeys, DEL_CHUNK_SIZE, SCAN_PAGE_SIZE};
use crate::redis::pool::{build_redis_pool, create_redis_pool, get_pool_stats, ping, pool_error};
use crate::redis::script::{load_script, take_script, TakeArgs};
use crate::redis::RedisClient as RedisClientTrait;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use deadpool_redis::Pool;
use parking_lot::Mutex;
use redis::RedisError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Redis client implementation
///
/// Operations run against the current pool. A connection-level failure
/// marks the client unhealthy and starts a single background reconnect
/// loop that swaps in a fresh pool once Redis answers again.
#[derive(Clone)]
pub struct RedisClientImpl {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    cfg: RedisConfig,
    pool: ArcSwap<Pool>,
    healthy: AtomicBool,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    times_reconnected: AtomicU64,
    /// Delay between reconnect rounds, reset after each recovery.
    backoff: Mutex<Backoff>,
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

impl RedisClientImpl {
    /// Create a client without contacting Redis
    pub fn new(cfg: RedisConfig) -> Result<Self> {
        let pool = build_redis_pool(&cfg)?;
        let backoff = Backoff::new(
            Duration::from_millis(cfg.backoff_initial_millis),
            Duration::from_millis(cfg.backoff_ceiling_millis),
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                cfg,
                pool: ArcSwap::from_pointee(pool),
                healthy: AtomicBool::new(true),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                times_reconnected: AtomicU64::new(0),
                backoff: Mutex::new(backoff),
            }),
        })
    }

    #[cfg(test)]
    fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    pub fn times_reconnected(&self) -> u64 {
        self.inner.times_reconnected.load(Ordering::Relaxed)
    }

    /// Load the take script through the current pool
    pub async fn load_take_script(&self) -> Result<String> {
        let pool = self.inner.pool.load_full();
        let mut conn = pool.get().await.map_err(|e| {
            self.handle_connection_failure(&pool);
            pool_error(e)
        })?;
        load_script(&mut *conn).await
    }

    /// All keys matching `pattern`, walked with SCAN
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pool = self.inner.pool.load_full();
        let mut conn = pool.get().await.map_err(pool_error)?;

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE_SIZE)
                .query_async(&mut *conn)
                .await?;

            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!("SCAN {} matched {} keys", pattern, keys.len());
        Ok(keys)
    }

    /// DEL in chunks, returning how many keys were removed
    pub async fn delete_keys(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let pool = self.inner.pool.load_full();
        let mut conn = pool.get().await.map_err(pool_error)?;

        let mut deleted = 0;
        for chunk in keys.chunks(DEL_CHUNK_SIZE) {
            let n: u64 = redis::cmd("DEL").arg(chunk).query_async(&mut *conn).await?;
            deleted += n;
        }
        Ok(deleted)
    }

    /// Mark the client unhealthy and start reconnecting, unless the failed
    /// pool was already replaced or a reconnect is in flight.
    pub fn handle_connection_failure(&self, failed: &Arc<Pool>) {
        if self.inner.is_closed() {
            return;
        }

        let current = self.inner.pool.load_full();
        if !Arc::ptr_eq(&current, failed) {
            debug!("Connection failure on a retired pool, ignoring");
            return;
        }

        self.inner.healthy.store(false, Ordering::Release);

        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let stats = get_pool_stats(failed);
        warn!(
            "Lost connection to Redis (pool size: {}, available: {}, max: {}); reconnecting",
            stats.size, stats.available, stats.max_size
        );

        let cfg = self.inner.cfg.clone();
        let connect = move || {
            let cfg = cfg.clone();
            async move { create_redis_pool(&cfg).await }
        };
        tokio::spawn(reconnect(Arc::downgrade(&self.inner), connect));
    }

    /// Stop any reconnect loop and close the current pool.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.healthy.store(false, Ordering::Release);
        self.inner.pool.load().close();
        debug!("Redis client closed");
    }
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Reconnect loop: `connection_retries` attempts `retry_delay_millis` apart,
/// then a backoff sleep, until `connect` yields a pool.
///
/// Gives up once the client is closed or dropped.
async fn reconnect<C, F>(client: Weak<ClientInner>, mut connect: C)
where
    C: FnMut() -> F,
    F: Future<Output = Result<Pool>>,
{
    let mut attempts: u64 = 0;

    let pool = 'outer: loop {
        let Some((retries, retry_delay)) = client
            .upgrade()
            .filter(|inner| !inner.is_closed())
            .map(|inner| {
                (
                    inner.cfg.connection_retries.max(1),
                    Duration::from_millis(inner.cfg.retry_delay_millis),
                )
            })
        else {
            debug!("Redis client gone, abandoning reconnect");
            return;
        };

        for _ in 0..retries {
            attempts += 1;
            match connect().await {
                Ok(pool) => break 'outer pool,
                Err(e) => {
                    debug!("Reconnect attempt {} failed: {}", attempts, e);
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }

        let Some(delay) = client.upgrade().map(|inner| inner.backoff.lock().next_delay()) else {
            debug!("Redis client gone, abandoning reconnect");
            return;
        };
        warn!(
            "Redis still unreachable after {} attempts, sleeping {:?}",
            attempts, delay
        );
        tokio::time::sleep(delay).await;
    };

    let Some(inner) = client.upgrade().filter(|inner| !inner.is_closed()) else {
        pool.close();
        return;
    };

    let old = inner.pool.swap(Arc::new(pool));
    old.close();
    inner.backoff.lock().reset();

    inner.healthy.store(true, Ordering::Release);
    inner.reconnecting.store(false, Ordering::Release);
    let outages = inner.times_reconnected.fetch_add(1, Ordering::Relaxed) + 1;
    metrics::record_redis_reconnect();

    info!(
        "Reconnected to Redis after {} attempts ({} outages resolved so far)",
        attempts, outages
    );
}

#[async_trait]
impl RedisClientTrait for RedisClientImpl {
    async fn execute_take_script(&self, keys: &BucketKeys, args: &TakeArgs) -> Result<i64> {
        let pool = self.inner.pool.load_full();
        let start = Instant::now();

        let mut conn = pool.get().await.map_err(|e| {
            error!("Failed to get Redis connection: {}", e);
            metrics::record_redis_error("pool");
            self.handle_connection_failure(&pool);
            pool_error(e)
        })?;

        let script = take_script();
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&keys.tokens_next_available)
            .key(&keys.accumulated_tokens);
        for arg in args.to_argv() {
            invocation.arg(arg);
        }

        let result: std::result::Result<redis::RedisResult<i64>, _> = tokio::time::timeout(
            self.inner.cfg.command_timeout(),
            invocation.invoke_async(&mut *conn),
        )
        .await;

        metrics::record_redis_duration("take", start.elapsed().as_secs_f64());

        match result {
            Ok(Ok(wait)) => Ok(wait),
            Ok(Err(e)) => {
                error!("Script execution failed: {}", e);
                if is_connection_error(&e) {
                    metrics::record_redis_error("connection");
                    self.handle_connection_failure(&pool);
                    Err(QuotaError::RedisConnectionError(e))
                } else {
                    metrics::record_redis_error("script");
                    Err(QuotaError::ScriptExecutionError(format!(
                        "Script execution failed: {}",
                        e
                    )))
                }
            }
            Err(_) => {
                error!(
                    "Script execution timed out after {:?}",
                    self.inner.cfg.command_timeout()
                );
                metrics::record_redis_error("timeout");
                self.handle_connection_failure(&pool);
                Err(QuotaError::RedisConnectionError(RedisError::from((
                    redis::ErrorKind::IoError,
                    "Command timed out",
                ))))
            }
        }
    }

    async fn health_check(&self) -> Result<()> {
        let pool = self.inner.pool.load_full();
        let result = ping(&pool).await;
        if result.is_err() {
            self.handle_connection_failure(&pool);
        }
        result
    }

    fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> RedisConfig {
        RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            max_connections: 2,
            connection_timeout_secs: 1,
            connection_retries: 1,
            retry_delay_millis: 10,
            backoff_initial_millis: 10,
            backoff_ceiling_millis: 20,
            ..RedisConfig::default()
        }
    }

    #[tokio::test]
    async fn test_failure_marks_unhealthy_and_reconnects_once() {
        let client = RedisClientImpl::new(unreachable_config()).unwrap();
        assert!(client.is_healthy());

        let pool = client.inner.pool.load_full();
        client.handle_connection_failure(&pool);
        assert!(!client.is_healthy());
        assert!(client.is_reconnecting());

        // A second failure while reconnecting starts nothing new.
        client.handle_connection_failure(&pool);
        assert!(client.is_reconnecting());
        assert_eq!(client.times_reconnected(), 0);
    }

    #[tokio::test]
    async fn test_failure_on_retired_pool_is_ignored() {
        let client = RedisClientImpl::new(unreachable_config()).unwrap();
        let retired = Arc::new(build_redis_pool(&unreachable_config()).unwrap());

        client.handle_connection_failure(&retired);
        assert!(client.is_healthy());
        assert!(!client.is_reconnecting());
    }

    fn refused() -> QuotaError {
        QuotaError::RedisConnectionError(RedisError::from((
            redis::ErrorKind::IoError,
            "Connection refused",
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_retries_then_backs_off() {
        let mut cfg = unreachable_config();
        cfg.connection_retries = 2;
        cfg.retry_delay_millis = 10;
        cfg.backoff_initial_millis = 100;
        cfg.backoff_ceiling_millis = 250;
        let client = RedisClientImpl::new(cfg.clone()).unwrap();
        let old_pool = client.inner.pool.load_full();
        client.inner.healthy.store(false, Ordering::Release);
        client.inner.reconnecting.store(true, Ordering::Release);

        let start = tokio::time::Instant::now();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let connect = {
            let attempts = Arc::clone(&attempts);
            move || {
                let mut attempts = attempts.lock();
                attempts.push(start.elapsed().as_millis() as u64);
                let outcome = if attempts.len() < 7 {
                    Err(refused())
                } else {
                    build_redis_pool(&cfg)
                };
                async move { outcome }
            }
        };

        reconnect(Arc::downgrade(&client.inner), connect).await;

        // Two attempts 10ms apart per round, then 100ms, 200ms, 250ms of backoff.
        assert_eq!(*attempts.lock(), vec![0, 10, 120, 130, 340, 350, 610]);
        assert!(client.is_healthy());
        assert!(!client.is_reconnecting());
        assert_eq!(client.times_reconnected(), 1);
        assert!(!Arc::ptr_eq(&old_pool, &client.inner.pool.load_full()));
        assert_eq!(
            client.inner.backoff.lock().next_delay(),
            Duration::from_millis(100)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_when_client_is_dropped() {
        let client = RedisClientImpl::new(unreachable_config()).unwrap();
        let attempts = Arc::new(AtomicU64::new(0));
        let connect = {
            let attempts = Arc::clone(&attempts);
            move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<Pool, _>(refused()) }
            }
        };

        let task = tokio::spawn(reconnect(Arc::downgrade(&client.inner), connect));
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("reconnect loop kept running")
            .unwrap();
        let seen = attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_when_client_is_closed() {
        let client = RedisClientImpl::new(unreachable_config()).unwrap();
        client.close();

        let connect = || async { Err::<Pool, _>(refused()) };
        tokio::time::timeout(
            Duration::from_secs(5),
            reconnect(Arc::downgrade(&client.inner), connect),
        )
        .await
        .unwrap();
        assert_eq!(client.times_reconnected(), 0);

        let pool = client.inner.pool.load_full();
        client.handle_connection_failure(&pool);
        assert!(!client.is_reconnecting());
    }

    #[tokio::test]
    async fn test_health_check_against_unreachable_redis() {
        let client = RedisClientImpl::new(unreachable_config()).unwrap();
        assert!(client.health_check().await.is_err());
        assert!(!client.is_healthy());
    }
}
