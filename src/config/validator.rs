use crate::config::{AppConfig, BucketConfig, NamespaceConfig, RedisConfig, ReaperConfig, ServiceConfig};
use crate::errors::{QuotaError, Result};
use tracing::{debug, warn};

const MAX_FILL_RATE: u64 = 1_000_000_000;

/// Validate the entire application configuration
pub fn validate_config(config: &AppConfig) -> Result<()> {
    debug!("Validating configuration...");

    validate_redis_config(&config.redis)?;
    validate_reaper_config(&config.reaper)?;
    validate_service_config(&config.service)?;

    debug!("Configuration validation successful");
    Ok(())
}

/// Validate a quota configuration snapshot
pub fn validate_service_config(config: &ServiceConfig) -> Result<()> {
    if let Some(bucket) = &config.global_default_bucket {
        validate_bucket_config(bucket)?;
    }

    for (name, ns) in &config.namespaces {
        if name.is_empty() {
            return Err(QuotaError::ConfigurationError(
                "Namespace name cannot be empty".to_string(),
            ));
        }
        validate_namespace_config(ns)?;
    }

    Ok(())
}

/// Validate Redis configuration
fn validate_redis_config(config: &RedisConfig) -> Result<()> {
    if config.url.is_empty() {
        return Err(QuotaError::ConfigurationError(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if !config.url.starts_with("redis://") && !config.url.starts_with("rediss://") {
        return Err(QuotaError::ConfigurationError(format!(
            "Invalid Redis URL format: {}. Must start with redis:// or rediss://",
            config.url
        )));
    }

    if config.max_connections == 0 {
        return Err(QuotaError::ConfigurationError(
            "max_connections must be greater than 0".to_string(),
        ));
    }

    if config.max_connections > 1000 {
        warn!(
            "max_connections is very high ({}). This may consume excessive resources.",
            config.max_connections
        );
    }

    if config.connection_timeout_secs == 0 || config.command_timeout_secs == 0 {
        return Err(QuotaError::ConfigurationError(
            "Redis timeouts must be greater than 0".to_string(),
        ));
    }

    if config.backoff_ceiling_millis < config.backoff_initial_millis {
        return Err(QuotaError::ConfigurationError(format!(
            "backoff_ceiling_millis ({}) must not be below backoff_initial_millis ({})",
            config.backoff_ceiling_millis, config.backoff_initial_millis
        )));
    }

    debug!("Redis configuration valid");
    Ok(())
}

fn validate_reaper_config(config: &ReaperConfig) -> Result<()> {
    if config.min_frequency.is_zero() || config.init_sleep.is_zero() {
        return Err(QuotaError::ConfigurationError(
            "Reaper intervals must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

/// Validate namespace configuration
pub fn validate_namespace_config(config: &NamespaceConfig) -> Result<()> {
    if config.default_bucket.is_some() && config.dynamic_bucket_template.is_some() {
        return Err(QuotaError::ConfigurationError(format!(
            "Namespace '{}' is not allowed to have a default bucket as well as allow dynamic buckets",
            config.name
        )));
    }

    if config.max_dynamic_buckets > 0 && config.dynamic_bucket_template.is_none() {
        warn!(
            "Namespace '{}' sets max_dynamic_buckets={} but has no dynamic bucket template",
            config.name, config.max_dynamic_buckets
        );
    }

    if let Some(bucket) = &config.default_bucket {
        validate_bucket_config(bucket)?;
    }

    if let Some(bucket) = &config.dynamic_bucket_template {
        validate_bucket_config(bucket)?;
    }

    for (name, bucket) in &config.buckets {
        if name.is_empty() {
            return Err(QuotaError::ConfigurationError(format!(
                "Bucket name cannot be empty in namespace '{}'",
                config.name
            )));
        }
        validate_bucket_config(bucket)?;
    }

    debug!("Namespace configuration valid for '{}'", config.name);
    Ok(())
}

/// Validate an individual bucket
pub fn validate_bucket_config(bucket: &BucketConfig) -> Result<()> {
    if bucket.fill_rate == 0 {
        return Err(QuotaError::InvalidRate(format!(
            "fill_rate must be positive for bucket '{}'",
            bucket.fqn()
        )));
    }

    if bucket.fill_rate > MAX_FILL_RATE {
        return Err(QuotaError::InvalidRate(format!(
            "fill_rate must not exceed {} for bucket '{}' (got {})",
            MAX_FILL_RATE,
            bucket.fqn(),
            bucket.fill_rate
        )));
    }

    if bucket.size > i64::MAX as u64 {
        return Err(QuotaError::InvalidRate(format!(
            "size is out of range for bucket '{}'",
            bucket.fqn()
        )));
    }

    if bucket.size == 0 {
        warn!(
            "Bucket '{}' has size 0; every request will go into debt",
            bucket.fqn()
        );
    }

    let seconds_to_fill = bucket.size as f64 / bucket.fill_rate as f64;
    if seconds_to_fill > 86400.0 {
        warn!(
            "Bucket '{}' is very large relative to its fill rate (takes {:.2} hours to fill)",
            bucket.fqn(),
            seconds_to_fill / 3600.0
        );
    }

    if bucket.max_tokens_per_request > bucket.size && bucket.max_debt_millis == 0 {
        warn!(
            "Bucket '{}' allows {} tokens per request but only holds {} with no debt",
            bucket.fqn(),
            bucket.max_tokens_per_request,
            bucket.size
        );
    }

    Ok(())
}
