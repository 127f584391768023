use crate::errors::{QuotaError, Result};
use lazy_static::lazy_static;
use redis::aio::ConnectionLike;
use redis::Script;
use tracing::{debug, info};

lazy_static! {
    static ref TAKE_SCRIPT: Script = Script::new(include_str!("../../scripts/token_bucket.lua"));
}

/// Arguments of the take script, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeArgs {
    pub now_nanos: i64,
    pub nanos_between_tokens: i64,
    pub max_tokens: i64,
    pub requested: i64,
    pub max_wait_nanos: i64,
    pub idle_ttl_millis: i64,
    pub max_debt_nanos: i64,
}

impl TakeArgs {
    pub fn to_argv(&self) -> [i64; 7] {
        [
            self.now_nanos,
            self.nanos_between_tokens,
            self.max_tokens,
            self.requested,
            self.max_wait_nanos,
            self.idle_ttl_millis,
            self.max_debt_nanos,
        ]
    }
}

/// Load the take script into Redis, returning its SHA
pub async fn load_script<C: ConnectionLike>(conn: &mut C) -> Result<String> {
    debug!("Loading take script into Redis...");

    let sha = TAKE_SCRIPT
        .prepare_invoke()
        .load_async(conn)
        .await
        .map_err(|e| QuotaError::ScriptExecutionError(format!("Failed to load Lua script: {}", e)))?;

    info!("Lua script loaded successfully (SHA: {})", sha);
    Ok(sha)
}

/// The take script, shared by every Redis bucket
pub fn take_script() -> &'static Script {
    &TAKE_SCRIPT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_order() {
        let args = TakeArgs {
            now_nanos: 1,
            nanos_between_tokens: 2,
            max_tokens: 3,
            requested: 4,
            max_wait_nanos: 5,
            idle_ttl_millis: 6,
            max_debt_nanos: 7,
        };
        assert_eq!(args.to_argv(), [1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_script_hash_is_stable() {
        assert_eq!(take_script().get_hash().len(), 40);
        assert_eq!(take_script().get_hash(), take_script().get_hash());
    }
}
