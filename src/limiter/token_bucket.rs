//! Token accounting shared by the limiter implementations.
//!
//! Time is a monotonic nanosecond counter supplied by the caller. The Redis
//! Lua script runs the same steps against keys in Redis.

use crate::config::BucketConfig;

/// Constants derived once from a [`BucketConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketParams {
    pub nanos_between_tokens: i64,
    pub max_tokens: i64,
    pub max_debt_nanos: i64,
}

impl TokenBucketParams {
    pub fn from_config(cfg: &BucketConfig) -> Self {
        Self {
            nanos_between_tokens: cfg.nanos_between_tokens(),
            max_tokens: i64::try_from(cfg.size).unwrap_or(i64::MAX),
            max_debt_nanos: cfg.max_debt_nanos(),
        }
    }
}

/// Mutable token state of one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucketState {
    tokens_next_available_nanos: i64,
    accumulated_tokens: i64,
}

impl TokenBucketState {
    /// A full bucket whose clock starts at `now`.
    pub fn new(params: &TokenBucketParams, now: i64) -> Self {
        Self {
            tokens_next_available_nanos: now,
            accumulated_tokens: params.max_tokens,
        }
    }

    pub fn tokens_next_available_nanos(&self) -> i64 {
        self.tokens_next_available_nanos
    }

    pub fn accumulated_tokens(&self) -> i64 {
        self.accumulated_tokens
    }

    /// Try to take `requested` tokens at time `now`.
    ///
    /// Returns the wait time in nanoseconds when granted, `None` when rejected.
    /// A rejected request leaves the state untouched apart from crediting
    /// tokens that accrued up to `now`.
    pub fn take(
        &mut self,
        params: &TokenBucketParams,
        now: i64,
        requested: i64,
        max_wait_nanos: i64,
    ) -> Option<i64> {
        if now > self.tokens_next_available_nanos {
            // Partial tokens are not credited.
            let fresh = (now - self.tokens_next_available_nanos) / params.nanos_between_tokens;
            self.accumulated_tokens = params
                .max_tokens
                .min(self.accumulated_tokens.saturating_add(fresh));
            self.tokens_next_available_nanos = now;
        }

        let wait_time = self.tokens_next_available_nanos - now;
        let used = self.accumulated_tokens.min(requested);
        let remaining = requested - used;
        let future_wait = remaining.saturating_mul(params.nanos_between_tokens);

        let next_available = self.tokens_next_available_nanos.saturating_add(future_wait);
        if next_available - now > params.max_debt_nanos
            || (wait_time > 0 && wait_time > max_wait_nanos)
        {
            return None;
        }

        self.tokens_next_available_nanos = next_available;
        self.accumulated_tokens -= used;
        Some(wait_time)
    }
}
