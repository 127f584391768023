use quotad::config::loader::load_config;
use quotad::config::Backend;
use quotad::limiter::memory::MemoryLimiterFactory;
use quotad::redis::RedisLimiterFactory;
use quotad::{metrics, BucketContainer, EventProducer, EventSink, LimiterFactory, QuotaService};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EVENT_BUFFER_SIZE: usize = 10_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quotad=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Quota service starting...");

    let config = load_config().await?;

    let factory: Arc<dyn LimiterFactory> = match config.backend {
        Backend::Memory => Arc::new(MemoryLimiterFactory::default()),
        Backend::Redis => Arc::new(RedisLimiterFactory::new(config.redis.clone())?),
    };

    let events: Arc<dyn EventSink> = EventProducer::register(metrics::record_event, EVENT_BUFFER_SIZE);

    let container = Arc::new(
        BucketContainer::new(config.service, factory, Arc::clone(&events), config.reaper).await?,
    );
    let service = QuotaService::new(Arc::clone(&container), events);

    tracing::info!("Serving buckets:\n{}", service.container());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    container.stop();
    Ok(())
}
