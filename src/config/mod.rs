pub mod loader;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::QuotaError;

/// Namespace used to identify the global default bucket.
pub const GLOBAL_NAMESPACE: &str = "___GLOBAL___";

/// Reserved bucket name for global and namespace default buckets.
pub const DEFAULT_BUCKET_NAME: &str = "___DEFAULT_BUCKET___";

/// Reserved bucket name given to dynamic bucket templates.
pub const DYNAMIC_BUCKET_TEMPLATE_NAME: &str = "___DYNAMIC_BUCKET_TPL___";

/// Complete application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Which limiter implementation backs the buckets
    pub backend: Backend,

    /// Redis configuration (loaded from environment variables only)
    pub redis: RedisConfig,

    /// Reaper tuning (loaded from environment variables only)
    pub reaper: ReaperConfig,

    /// Quota configuration snapshot (loaded from file)
    pub service: ServiceConfig,
}

/// Limiter backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Redis,
}

impl FromStr for Backend {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "redis" => Ok(Backend::Redis),
            other => Err(QuotaError::ConfigurationError(format!(
                "Unknown backend '{}'. Expected 'memory' or 'redis'",
                other
            ))),
        }
    }
}

/// Redis connection configuration (loaded from environment variables)
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Command timeout in seconds
    pub command_timeout_secs: u64,

    /// Reconnect attempts made before backing off
    pub connection_retries: u32,

    /// Pause between two reconnect attempts
    pub retry_delay_millis: u64,

    /// First backoff delay once all retries of a round failed
    pub backoff_initial_millis: u64,

    /// Upper bound for the backoff delay
    pub backoff_ceiling_millis: u64,

    /// TTL applied to bucket keys whose bucket has no max idle time
    pub key_max_idle_secs: u64,

    /// Delete keys of buckets that are no longer configured during init
    pub purge_unknown_keys: bool,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl RedisConfig {
    /// Load Redis configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("REDIS_URL").unwrap_or(defaults.url),
            max_connections: env_or("REDIS_MAX_CONN", defaults.max_connections),
            connection_timeout_secs: env_or(
                "REDIS_CONNECT_TIMEOUT_SECS",
                defaults.connection_timeout_secs,
            ),
            command_timeout_secs: env_or("REDIS_COMMAND_TIMEOUT_SECS", defaults.command_timeout_secs),
            connection_retries: env_or("REDIS_CONNECTION_RETRIES", defaults.connection_retries),
            retry_delay_millis: env_or("REDIS_RETRY_DELAY_MILLIS", defaults.retry_delay_millis),
            backoff_initial_millis: env_or(
                "REDIS_BACKOFF_INITIAL_MILLIS",
                defaults.backoff_initial_millis,
            ),
            backoff_ceiling_millis: env_or(
                "REDIS_BACKOFF_CEILING_MILLIS",
                defaults.backoff_ceiling_millis,
            ),
            key_max_idle_secs: env_or("REDIS_KEY_MAX_IDLE_SECS", defaults.key_max_idle_secs),
            purge_unknown_keys: std::env::var("REDIS_PURGE_UNKNOWN_KEYS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.purge_unknown_keys),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn key_max_idle(&self) -> Duration {
        Duration::from_secs(self.key_max_idle_secs)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_connections: 50,
            connection_timeout_secs: 5,
            command_timeout_secs: 2,
            connection_retries: 3,
            retry_delay_millis: 1_000,
            backoff_initial_millis: 1_000,
            backoff_ceiling_millis: 180_000,
            key_max_idle_secs: 24 * 60 * 60,
            purge_unknown_keys: false,
        }
    }
}

/// Reaper tuning
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Delay before the first sweep
    pub init_sleep: Duration,

    /// Longest time between two sweeps
    pub min_frequency: Duration,
}

impl ReaperConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            init_sleep: Duration::from_millis(env_or(
                "REAPER_INIT_SLEEP_MILLIS",
                defaults.init_sleep.as_millis() as u64,
            )),
            min_frequency: Duration::from_millis(env_or(
                "REAPER_MIN_FREQUENCY_MILLIS",
                defaults.min_frequency.as_millis() as u64,
            )),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            init_sleep: Duration::from_secs(10),
            min_frequency: Duration::from_secs(10 * 60),
        }
    }
}

/// Service-wide quota configuration snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Monotonic configuration version, also part of Redis keys
    pub version: i32,

    /// Bucket used when a namespace doesn't exist
    pub global_default_bucket: Option<BucketConfig>,

    /// Namespaces keyed by name
    pub namespaces: HashMap<String, NamespaceConfig>,
}

impl ServiceConfig {
    /// Fill in names, identities and bucket defaults.
    pub fn apply_defaults(&mut self) {
        if let Some(bucket) = self.global_default_bucket.as_mut() {
            bucket.apply_defaults();
            bucket.namespace = GLOBAL_NAMESPACE.to_string();
            bucket.name = DEFAULT_BUCKET_NAME.to_string();
        }

        for (name, ns) in self.namespaces.iter_mut() {
            ns.name = name.clone();
            ns.apply_defaults();
        }
    }

    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Configuration for one namespace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub name: String,

    /// Fallback for unknown bucket names; exclusive with the dynamic template
    pub default_bucket: Option<BucketConfig>,

    /// Template for buckets created on first use
    pub dynamic_bucket_template: Option<BucketConfig>,

    /// Cap on live dynamic buckets, 0 means unlimited
    pub max_dynamic_buckets: usize,

    /// Statically configured buckets keyed by name
    pub buckets: HashMap<String, BucketConfig>,
}

impl NamespaceConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Fill in bucket identities and defaults. `name` must already be set.
    pub fn apply_defaults(&mut self) {
        if let Some(bucket) = self.default_bucket.as_mut() {
            bucket.apply_defaults();
            bucket.namespace = self.name.clone();
            bucket.name = DEFAULT_BUCKET_NAME.to_string();
        }

        if let Some(tpl) = self.dynamic_bucket_template.as_mut() {
            tpl.apply_defaults();
            tpl.namespace = self.name.clone();
            tpl.name = DYNAMIC_BUCKET_TEMPLATE_NAME.to_string();
        }

        for (name, bucket) in self.buckets.iter_mut() {
            bucket.apply_defaults();
            bucket.namespace = self.name.clone();
            bucket.name = name.clone();
        }
    }
}

/// Token bucket configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub namespace: String,
    pub name: String,

    /// Burst capacity in tokens
    pub size: u64,

    /// Tokens added per second
    pub fill_rate: u64,

    /// Default max wait for a request
    pub wait_timeout_millis: u64,

    /// Idle time after which the bucket is reaped, <= 0 disables reaping
    pub max_idle_millis: i64,

    /// How far ahead of accrual the bucket may be mortgaged
    pub max_debt_millis: u64,

    /// Largest single request, 0 means "same as fill_rate"
    pub max_tokens_per_request: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            name: String::new(),
            size: 100,
            fill_rate: 50,
            wait_timeout_millis: 1_000,
            max_idle_millis: -1,
            max_debt_millis: 10_000,
            max_tokens_per_request: 0,
        }
    }
}

impl BucketConfig {
    pub fn new(name: &str) -> Self {
        let mut cfg = Self {
            name: name.to_string(),
            ..Self::default()
        };
        cfg.apply_defaults();
        cfg
    }

    pub fn apply_defaults(&mut self) {
        if self.fill_rate == 0 {
            self.fill_rate = 50;
        }

        if self.max_tokens_per_request == 0 {
            self.max_tokens_per_request = self.fill_rate;
        }
    }

    /// Nanoseconds between two tokens, never below 1.
    pub fn nanos_between_tokens(&self) -> i64 {
        (1_000_000_000 / self.fill_rate.max(1)).max(1) as i64
    }

    pub fn max_debt_nanos(&self) -> i64 {
        i64::try_from(self.max_debt_millis)
            .unwrap_or(i64::MAX)
            .saturating_mul(1_000_000)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_millis)
    }

    /// Idle time before reaping, `None` when reaping is disabled.
    pub fn max_idle(&self) -> Option<Duration> {
        if self.max_idle_millis > 0 {
            Some(Duration::from_millis(self.max_idle_millis as u64))
        } else {
            None
        }
    }

    pub fn fqn(&self) -> String {
        if self.namespace.is_empty() {
            return fully_qualified_name(GLOBAL_NAMESPACE, DEFAULT_BUCKET_NAME);
        }
        fully_qualified_name(&self.namespace, &self.name)
    }
}

pub fn fully_qualified_name(namespace: &str, bucket: &str) -> String {
    format!("{}:{}", namespace, bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_defaults_from_json() {
        let cfg: BucketConfig = serde_json::from_str(r#"{"size": 20}"#).unwrap();
        assert_eq!(cfg.size, 20);
        assert_eq!(cfg.fill_rate, 50);
        assert_eq!(cfg.max_idle_millis, -1);
        assert_eq!(cfg.max_idle(), None);

        let mut cfg = cfg;
        cfg.apply_defaults();
        assert_eq!(cfg.max_tokens_per_request, 50);
    }

    #[test]
    fn test_derived_constants() {
        let mut cfg = BucketConfig::new("b");
        cfg.fill_rate = 50;
        cfg.max_debt_millis = 250;
        assert_eq!(cfg.nanos_between_tokens(), 20_000_000);
        assert_eq!(cfg.max_debt_nanos(), 250_000_000);

        cfg.fill_rate = 3_000_000_000;
        assert_eq!(cfg.nanos_between_tokens(), 1);

        cfg.max_debt_millis = u64::MAX;
        assert_eq!(cfg.max_debt_nanos(), i64::MAX);
        cfg.max_debt_millis = i64::MAX as u64 / 1_000;
        assert_eq!(cfg.max_debt_nanos(), i64::MAX);
    }

    #[test]
    fn test_apply_defaults_sets_identity() {
        let mut svc = ServiceConfig::default();
        svc.global_default_bucket = Some(BucketConfig::default());
        let mut ns = NamespaceConfig::default();
        ns.buckets.insert("a".to_string(), BucketConfig::default());
        ns.dynamic_bucket_template = Some(BucketConfig::default());
        svc.namespaces.insert("x".to_string(), ns);

        svc.apply_defaults();

        let global = svc.global_default_bucket.as_ref().unwrap();
        assert_eq!(global.fqn(), "___GLOBAL___:___DEFAULT_BUCKET___");

        let ns = &svc.namespaces["x"];
        assert_eq!(ns.name, "x");
        assert_eq!(ns.buckets["a"].fqn(), "x:a");
        assert_eq!(
            ns.dynamic_bucket_template.as_ref().unwrap().name,
            DYNAMIC_BUCKET_TEMPLATE_NAME
        );
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("Redis".parse::<Backend>().unwrap(), Backend::Redis);
        assert_eq!("memory".parse::<Backend>().unwrap(), Backend::Memory);
        assert!("etcd".parse::<Backend>().is_err());
    }
}
