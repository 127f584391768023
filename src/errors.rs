use std::fmt;
use thiserror::Error;

/// Public reasons a quota request can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    /// Tokens not available within the max wait time
    Timeout,
    /// No bucket (and no default) could serve the request
    NoBucket,
    /// Dynamic bucket couldn't be created
    TooManyBuckets,
    /// More tokens requested than the bucket allows per request
    TooManyTokensRequested,
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorReason::Timeout => "ER_TIMEOUT",
            ErrorReason::NoBucket => "ER_NO_BUCKET",
            ErrorReason::TooManyBuckets => "ER_TOO_MANY_BUCKETS",
            ErrorReason::TooManyTokensRequested => "ER_TOO_MANY_TOKENS_REQUESTED",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Timed out waiting on {namespace}:{bucket}")]
    Timeout { namespace: String, bucket: String },

    #[error("No such bucket {namespace}:{bucket}")]
    NoBucket { namespace: String, bucket: String },

    #[error("Cannot create dynamic bucket {namespace}:{bucket}: namespace holds {max} dynamic buckets")]
    TooManyBuckets {
        namespace: String,
        bucket: String,
        max: usize,
    },

    #[error("Too many tokens requested on {namespace}:{bucket}: requested {requested}, max {max}")]
    TooManyTokensRequested {
        namespace: String,
        bucket: String,
        requested: u64,
        max: u64,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid rate configuration: {0}")]
    InvalidRate(String),

    #[error("Namespace already exists: {0}")]
    NamespaceExists(String),

    #[error("No such namespace: {0}")]
    NoNamespace(String),

    #[error("Bucket container has been stopped")]
    Stopped,

    #[error("Redis connection error: {0}")]
    RedisConnectionError(#[from] redis::RedisError),

    #[error("Script execution error: {0}")]
    ScriptExecutionError(String),

    #[error("File system error: {0}")]
    FileSystemError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl QuotaError {
    /// The caller-visible reason for this error, if it is one of the quota outcomes.
    pub fn reason(&self) -> Option<ErrorReason> {
        match self {
            QuotaError::Timeout { .. } => Some(ErrorReason::Timeout),
            QuotaError::NoBucket { .. } => Some(ErrorReason::NoBucket),
            QuotaError::TooManyBuckets { .. } => Some(ErrorReason::TooManyBuckets),
            QuotaError::TooManyTokensRequested { .. } => Some(ErrorReason::TooManyTokensRequested),
            _ => None,
        }
    }

    pub(crate) fn no_bucket(namespace: &str, bucket: &str) -> Self {
        QuotaError::NoBucket {
            namespace: namespace.to_string(),
            bucket: bucket.to_string(),
        }
    }
}

/// Result type alias for quota operations
pub type Result<T> = std::result::Result<T, QuotaError>;
