pub mod config;
pub mod container;
pub mod errors;
pub mod events;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod service;

// Re-export commonly used types
pub use config::{AppConfig, BucketConfig, NamespaceConfig, ServiceConfig};
pub use container::{Bucket, BucketContainer};
pub use errors::{ErrorReason, QuotaError, Result};
pub use events::{Event, EventProducer, EventSink, EventType};
pub use limiter::{LimiterFactory, RateLimiter, TakeOutcome};
pub use service::{Grant, QuotaService};
