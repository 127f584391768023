//! In-process limiter.
//!
//! Each bucket owns a task that holds its [`TokenBucketState`] and serves
//! take requests one at a time, in arrival order, from a bounded queue.

use crate::config::{BucketConfig, ServiceConfig};
use crate::errors::{QuotaError, Result};
use crate::limiter::token_bucket::{TokenBucketParams, TokenBucketState};
use crate::limiter::{duration_nanos, LimiterFactory, RateLimiter, TakeOutcome};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_QUEUE_SIZE: usize = 1024;

struct TakeRequest {
    requested: i64,
    max_wait_nanos: i64,
    reply: oneshot::Sender<Option<i64>>,
}

pub struct MemoryLimiter {
    cfg: BucketConfig,
    tx: mpsc::Sender<TakeRequest>,
    shutdown: Arc<Notify>,
    closed: AtomicBool,
}

impl MemoryLimiter {
    /// Spawn the bucket task on the current tokio runtime.
    pub fn spawn(cfg: &BucketConfig, queue_size: usize) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            QuotaError::InternalError(format!(
                "Cannot start bucket {} outside a tokio runtime: {}",
                cfg.fqn(),
                e
            ))
        })?;

        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let shutdown = Arc::new(Notify::new());
        let params = TokenBucketParams::from_config(cfg);

        handle.spawn(run_bucket(cfg.fqn(), params, rx, Arc::clone(&shutdown)));

        Ok(Self {
            cfg: cfg.clone(),
            tx,
            shutdown,
            closed: AtomicBool::new(false),
        })
    }
}

async fn run_bucket(
    fqn: String,
    params: TokenBucketParams,
    mut rx: mpsc::Receiver<TakeRequest>,
    shutdown: Arc<Notify>,
) {
    let epoch = Instant::now();
    let mut state = TokenBucketState::new(&params, 0);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                rx.close();
                break;
            }
            req = rx.recv() => match req {
                Some(req) => serve(&mut state, &params, epoch, req),
                None => {
                    debug!("All handles to bucket {} dropped", fqn);
                    return;
                }
            }
        }
    }

    // Requests queued before the shutdown still get an answer.
    while let Some(req) = rx.recv().await {
        serve(&mut state, &params, epoch, req);
    }
    debug!("Bucket task for {} stopped", fqn);
}

fn serve(state: &mut TokenBucketState, params: &TokenBucketParams, epoch: Instant, req: TakeRequest) {
    let now = duration_nanos(epoch.elapsed());
    let result = state.take(params, now, req.requested, req.max_wait_nanos);
    // The caller may have given up; nothing to undo.
    let _ = req.reply.send(result);
}

#[async_trait]
impl RateLimiter for MemoryLimiter {
    async fn take(&self, requested: u64, max_wait: Duration) -> TakeOutcome {
        if self.closed.load(Ordering::Acquire) {
            return TakeOutcome::rejected();
        }

        let (reply, response) = oneshot::channel();
        let req = TakeRequest {
            requested: i64::try_from(requested).unwrap_or(i64::MAX),
            max_wait_nanos: duration_nanos(max_wait),
            reply,
        };

        if self.tx.send(req).await.is_err() {
            debug!("Bucket {} no longer accepts requests", self.cfg.fqn());
            return TakeOutcome::rejected();
        }

        match response.await {
            Ok(Some(wait_nanos)) => TakeOutcome::from_wait_nanos(wait_nanos),
            Ok(None) | Err(_) => TakeOutcome::rejected(),
        }
    }

    fn config(&self) -> &BucketConfig {
        &self.cfg
    }

    fn destroy(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
    }
}

/// Factory for [`MemoryLimiter`]s
#[derive(Debug, Clone)]
pub struct MemoryLimiterFactory {
    queue_size: usize,
}

impl MemoryLimiterFactory {
    pub fn new(queue_size: usize) -> Self {
        Self { queue_size }
    }
}

impl Default for MemoryLimiterFactory {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}

#[async_trait]
impl LimiterFactory for MemoryLimiterFactory {
    async fn init(&self, cfg: &ServiceConfig) -> Result<()> {
        info!(
            "Initialized in-memory limiter factory for config version {}",
            cfg.version
        );
        Ok(())
    }

    fn new_limiter(
        &self,
        namespace: &str,
        name: &str,
        cfg: &BucketConfig,
        dynamic: bool,
    ) -> Result<Box<dyn RateLimiter>> {
        debug!(
            "Creating bucket {}:{} (dynamic: {}) with {} tokens/sec and capacity {}",
            namespace, name, dynamic, cfg.fill_rate, cfg.size
        );
        Ok(Box::new(MemoryLimiter::spawn(cfg, self.queue_size)?))
    }
}
