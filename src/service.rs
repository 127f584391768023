use crate::container::BucketContainer;
use crate::errors::{QuotaError, Result};
use crate::events::{Event, EventSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Tokens handed out by [`QuotaService::allow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub tokens: u64,
    /// How long the caller must wait before using the tokens
    pub wait_time: Duration,
}

/// Caller-facing entry point: admission checks around bucket takes.
pub struct QuotaService {
    container: Arc<BucketContainer>,
    events: Arc<dyn EventSink>,
}

impl QuotaService {
    pub fn new(container: Arc<BucketContainer>, events: Arc<dyn EventSink>) -> Self {
        Self { container, events }
    }

    pub fn container(&self) -> &Arc<BucketContainer> {
        &self.container
    }

    /// Reserve `tokens` on `namespace:name`.
    ///
    /// The max wait is the bucket's wait timeout, lowered to
    /// `max_wait_override` when one is given.
    pub async fn allow(
        &self,
        namespace: &str,
        name: &str,
        tokens: u64,
        max_wait_override: Option<Duration>,
    ) -> Result<Grant> {
        let bucket = self.container.find_bucket(namespace, name)?;
        let cfg = bucket.config();

        if tokens > cfg.max_tokens_per_request {
            self.events.emit(Event::too_many_tokens_requested(
                bucket.namespace(),
                bucket.name(),
                bucket.is_dynamic(),
                tokens,
            ));
            return Err(QuotaError::TooManyTokensRequested {
                namespace: namespace.to_string(),
                bucket: name.to_string(),
                requested: tokens,
                max: cfg.max_tokens_per_request,
            });
        }

        let max_wait = match max_wait_override {
            Some(max_wait) => max_wait.min(cfg.wait_timeout()),
            None => cfg.wait_timeout(),
        };

        let outcome = bucket.take(tokens, max_wait).await;
        if !outcome.granted {
            debug!(
                "Timed out taking {} tokens from {} (max wait {:?})",
                tokens,
                bucket.fqn(),
                max_wait
            );
            self.events.emit(Event::timed_out(
                bucket.namespace(),
                bucket.name(),
                bucket.is_dynamic(),
                tokens,
            ));
            return Err(QuotaError::Timeout {
                namespace: namespace.to_string(),
                bucket: name.to_string(),
            });
        }

        self.events.emit(Event::tokens_served(
            bucket.namespace(),
            bucket.name(),
            bucket.is_dynamic(),
            tokens,
            outcome.wait_time,
        ));

        Ok(Grant {
            tokens,
            wait_time: outcome.wait_time,
        })
    }

    /// Like [`allow`](Self::allow), then sleep out the wait time.
    ///
    /// With a deadline, the max wait is capped by the time left and the
    /// sleep never outlasts it.
    pub async fn acquire(
        &self,
        namespace: &str,
        name: &str,
        tokens: u64,
        deadline: Option<Instant>,
    ) -> Result<Grant> {
        let override_wait = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let grant = self.allow(namespace, name, tokens, override_wait).await?;

        if grant.wait_time.is_zero() {
            return Ok(grant);
        }

        let sleep = tokio::time::sleep(grant.wait_time);
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, sleep).await.map_err(|_| {
                QuotaError::Timeout {
                    namespace: namespace.to_string(),
                    bucket: name.to_string(),
                }
            })?,
            None => sleep.await,
        }

        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketConfig, NamespaceConfig, ReaperConfig, ServiceConfig};
    use crate::events::test_support::RecordingSink;
    use crate::events::EventType;
    use crate::limiter::memory::MemoryLimiterFactory;
    use crate::limiter::LimiterFactory;

    async fn service() -> (QuotaService, Arc<RecordingSink>) {
        let mut bucket = BucketConfig::new("b");
        bucket.size = 100;
        bucket.fill_rate = 50;
        bucket.max_tokens_per_request = 100;

        let mut ns = NamespaceConfig::default();
        ns.buckets.insert("b".to_string(), bucket);

        let mut cfg = ServiceConfig::default();
        cfg.namespaces.insert("ns".to_string(), ns);
        cfg.apply_defaults();

        let events = Arc::new(RecordingSink::default());
        let factory: Arc<dyn LimiterFactory> = Arc::new(MemoryLimiterFactory::default());
        let container = BucketContainer::new(
            cfg,
            factory,
            Arc::clone(&events) as Arc<dyn EventSink>,
            ReaperConfig::default(),
        )
        .await
        .unwrap();

        let svc = QuotaService::new(Arc::new(container), Arc::clone(&events) as Arc<dyn EventSink>);
        (svc, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_with_debt() {
        let (svc, events) = service().await;

        let grant = svc.allow("ns", "b", 100, Some(Duration::ZERO)).await.unwrap();
        assert_eq!(grant.wait_time, Duration::ZERO);

        // Goes into debt; the next caller pays for it.
        let grant = svc.allow("ns", "b", 10, Some(Duration::ZERO)).await.unwrap();
        assert_eq!(grant.wait_time, Duration::ZERO);

        let err = svc.allow("ns", "b", 10, Some(Duration::ZERO)).await.unwrap_err();
        assert!(matches!(err, QuotaError::Timeout { .. }));

        let grant = svc
            .allow("ns", "b", 10, Some(Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(grant.wait_time, Duration::from_millis(200));

        assert_eq!(events.count(EventType::TokensServed), 3);
        assert_eq!(events.count(EventType::TimeoutServingTokens), 1);
    }

    #[tokio::test]
    async fn test_too_many_tokens() {
        let (svc, events) = service().await;
        let err = svc.allow("ns", "b", 101, None).await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::TooManyTokensRequested {
                requested: 101,
                max: 100,
                ..
            }
        ));
        assert_eq!(events.count(EventType::TooManyTokensRequested), 1);
    }

    #[tokio::test]
    async fn test_unknown_bucket() {
        let (svc, events) = service().await;
        let err = svc.allow("nowhere", "b", 1, None).await.unwrap_err();
        assert!(matches!(err, QuotaError::NoBucket { .. }));
        assert_eq!(events.count(EventType::BucketMiss), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sleeps_out_the_wait() {
        let (svc, _events) = service().await;
        svc.allow("ns", "b", 100, None).await.unwrap();
        svc.allow("ns", "b", 10, None).await.unwrap();

        let start = Instant::now();
        let grant = svc.acquire("ns", "b", 1, None).await.unwrap();
        assert_eq!(grant.wait_time, Duration::from_millis(200));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_respects_deadline() {
        let (svc, _events) = service().await;
        svc.allow("ns", "b", 100, None).await.unwrap();
        svc.allow("ns", "b", 10, None).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(100);
        let err = svc.acquire("ns", "b", 1, Some(deadline)).await.unwrap_err();
        assert!(matches!(err, QuotaError::Timeout { .. }));
        assert!(Instant::now() < deadline);
    }
}
