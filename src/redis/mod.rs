pub mod attributes;
pub mod backoff;
pub mod bucket;
pub mod client;
pub mod factory;
pub mod keys;
pub mod pool;
pub mod script;

pub use bucket::RedisLimiter;
pub use client::RedisClientImpl;
pub use factory::RedisLimiterFactory;

use crate::errors::Result;
use async_trait::async_trait;
use keys::BucketKeys;
use script::TakeArgs;

// Redis Client Trait async
#[async_trait]
pub trait RedisClient: Send + Sync {
    /// Run the token bucket script, returning the wait in nanos or -1
    async fn execute_take_script(&self, keys: &BucketKeys, args: &TakeArgs) -> Result<i64>;

    /// Check if Redis is healthy
    async fn health_check(&self) -> Result<()>;

    /// False while a reconnect is pending
    fn is_healthy(&self) -> bool;
}
