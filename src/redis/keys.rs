//! Redis key layout and cleanup of keys left behind by removed buckets.

use crate::config::{ServiceConfig, DEFAULT_BUCKET_NAME, GLOBAL_NAMESPACE};
use std::collections::HashMap;

pub const TOKENS_NEXT_AVAILABLE_SUFFIX: &str = "TNA";
pub const ACCUMULATED_TOKENS_SUFFIX: &str = "AT";

pub const DEL_CHUNK_SIZE: usize = 10_000;
pub const SCAN_PAGE_SIZE: usize = 10_000;

/// Both keys of one bucket share a hash tag so they land on the same slot.
pub fn to_redis_key(namespace: &str, bucket: &str, suffix: &str, version: i32) -> String {
    format!("{{{}:{}}}:{}:{}", namespace, bucket, suffix, version)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub tokens_next_available: String,
    pub accumulated_tokens: String,
}

impl BucketKeys {
    pub fn new(namespace: &str, bucket: &str, version: i32) -> Self {
        Self {
            tokens_next_available: to_redis_key(
                namespace,
                bucket,
                TOKENS_NEXT_AVAILABLE_SUFFIX,
                version,
            ),
            accumulated_tokens: to_redis_key(namespace, bucket, ACCUMULATED_TOKENS_SUFFIX, version),
        }
    }
}

/// SCAN pattern matching one key per bucket of a config version.
pub fn bucket_scan_pattern(version: i32) -> String {
    format!("*:{}:{}", ACCUMULATED_TOKENS_SUFFIX, version)
}

/// Extract `(namespace, bucket)` from a key built by [`to_redis_key`].
pub fn parse_bucket_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix('{')?;
    let end = rest.find("}:")?;
    let (namespace, bucket) = rest[..end].split_once(':')?;
    Some((namespace.to_string(), bucket.to_string()))
}

/// Group bucket keys by namespace.
pub fn existing_buckets<'a, I>(keys: I) -> HashMap<String, Vec<String>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut buckets: HashMap<String, Vec<String>> = HashMap::new();
    for key in keys {
        if let Some((namespace, bucket)) = parse_bucket_key(key) {
            buckets.entry(namespace).or_default().push(bucket);
        }
    }
    buckets
}

/// Keys of buckets seen in Redis that the configuration no longer knows.
///
/// Namespaces allowing dynamic buckets are left alone, as are global and
/// namespace default buckets.
pub fn find_keys_to_delete(
    existing: &HashMap<String, Vec<String>>,
    cfg: &ServiceConfig,
    version: i32,
) -> Vec<String> {
    let mut keys = Vec::new();

    for (namespace, buckets) in existing {
        if namespace == GLOBAL_NAMESPACE {
            continue;
        }

        let ns_cfg = cfg.namespaces.get(namespace);
        for bucket in buckets {
            let unknown = match ns_cfg {
                None => true,
                Some(ns) if ns.dynamic_bucket_template.is_none() => {
                    !ns.buckets.contains_key(bucket) && bucket != DEFAULT_BUCKET_NAME
                }
                Some(_) => false,
            };

            if unknown {
                let bucket_keys = BucketKeys::new(namespace, bucket, version);
                keys.push(bucket_keys.tokens_next_available);
                keys.push(bucket_keys.accumulated_tokens);
            }
        }
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketConfig, NamespaceConfig};

    #[test]
    fn test_key_format() {
        let keys = BucketKeys::new("ns", "b", 3);
        assert_eq!(keys.tokens_next_available, "{ns:b}:TNA:3");
        assert_eq!(keys.accumulated_tokens, "{ns:b}:AT:3");
        assert_eq!(bucket_scan_pattern(3), "*:AT:3");
    }

    #[test]
    fn test_parse_bucket_key() {
        assert_eq!(
            parse_bucket_key("{ns:b}:AT:3"),
            Some(("ns".to_string(), "b".to_string()))
        );
        assert_eq!(
            parse_bucket_key("{ns:a:b}:AT:0"),
            Some(("ns".to_string(), "a:b".to_string()))
        );
        assert_eq!(parse_bucket_key("plain"), None);
        assert_eq!(parse_bucket_key("{nocolon}:AT:0"), None);
    }

    #[test]
    fn test_find_keys_to_delete() {
        let mut cfg = ServiceConfig::default();
        let mut fixed = NamespaceConfig::new("fixed");
        fixed.buckets.insert("kept".to_string(), BucketConfig::new("kept"));
        cfg.namespaces.insert("fixed".to_string(), fixed);

        let mut dynamic = NamespaceConfig::new("dyn");
        dynamic.dynamic_bucket_template = Some(BucketConfig::default());
        cfg.namespaces.insert("dyn".to_string(), dynamic);

        let keys: Vec<String> = [
            "{fixed:kept}:AT:0",
            "{fixed:gone}:AT:0",
            "{fixed:___DEFAULT_BUCKET___}:AT:0",
            "{dyn:anything}:AT:0",
            "{___GLOBAL___:___DEFAULT_BUCKET___}:AT:0",
            "{removed:x}:AT:0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let existing = existing_buckets(&keys);
        let mut to_delete = find_keys_to_delete(&existing, &cfg, 0);
        to_delete.sort();

        assert_eq!(
            to_delete,
            vec![
                "{fixed:gone}:AT:0",
                "{fixed:gone}:TNA:0",
                "{removed:x}:AT:0",
                "{removed:x}:TNA:0",
            ]
        );
    }
}
