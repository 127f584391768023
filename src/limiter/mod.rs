pub mod memory;
pub mod token_bucket;

use crate::config::{BucketConfig, ServiceConfig};
use crate::errors::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of a [`RateLimiter::take`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeOutcome {
    /// How long the caller should wait before using the tokens
    pub wait_time: Duration,

    /// Whether the tokens were reserved
    pub granted: bool,
}

impl TakeOutcome {
    pub fn granted(wait_time: Duration) -> Self {
        Self {
            wait_time,
            granted: true,
        }
    }

    pub fn rejected() -> Self {
        Self {
            wait_time: Duration::ZERO,
            granted: false,
        }
    }

    /// Build an outcome from a signed nanosecond wait, negative meaning rejected.
    pub fn from_wait_nanos(wait_nanos: i64) -> Self {
        if wait_nanos < 0 {
            Self::rejected()
        } else {
            Self::granted(Duration::from_nanos(wait_nanos as u64))
        }
    }
}

/// Token bucket for one named resource
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Reserve `requested` tokens if they become available within `max_wait`.
    ///
    /// Never fails: backend trouble is reported as a rejected outcome. Once
    /// `granted` is returned the tokens stay reserved.
    async fn take(&self, requested: u64, max_wait: Duration) -> TakeOutcome;

    /// Configuration this limiter was built from
    fn config(&self) -> &BucketConfig;

    /// Release background resources. Called at most once, after the limiter
    /// became unreachable.
    fn destroy(&self) {}
}

/// Builds rate limiters for the bucket container
#[async_trait]
pub trait LimiterFactory: Send + Sync {
    /// Prepare the factory for a configuration snapshot.
    async fn init(&self, cfg: &ServiceConfig) -> Result<()>;

    /// Build a limiter for `namespace:name`.
    fn new_limiter(
        &self,
        namespace: &str,
        name: &str,
        cfg: &BucketConfig,
        dynamic: bool,
    ) -> Result<Box<dyn RateLimiter>>;

    /// Release shared resources once every limiter is destroyed.
    fn stop(&self) {}
}

pub(crate) fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}
