//! Background removal of idle buckets.
//!
//! Every watched bucket gets a [`Watcher`] sent to the reaper task. A sweep
//! drains each watcher's activity flag; a watcher that saw no activity for
//! longer than its bucket's max idle time gets its bucket removed. The next
//! sweep is due after the smallest max idle time among remaining watchers,
//! and never later than `min_frequency`.

use crate::config::{fully_qualified_name, ReaperConfig};
use crate::container::bucket::ActivityFlag;
use crate::metrics;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

/// Something buckets can be reaped from.
pub trait Reap: Send + Sync + 'static {
    /// Remove `namespace:name` if its live instance still owns `flag`.
    fn reap(&self, namespace: &str, name: &str, flag: &Arc<ActivityFlag>) -> bool;
}

pub struct Watcher {
    namespace: String,
    name: String,
    flag: Arc<ActivityFlag>,
    max_idle: Duration,
    last_activity: Instant,
}

impl Watcher {
    pub fn new(namespace: &str, name: &str, flag: Arc<ActivityFlag>, max_idle: Duration) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            flag,
            max_idle,
            last_activity: Instant::now(),
        }
    }

    fn too_idle(&mut self, now: Instant) -> bool {
        if self.flag.drain() {
            self.last_activity = now;
            return false;
        }
        now.saturating_duration_since(self.last_activity) > self.max_idle
    }
}

/// Intake side of the reaper. Closing it stops the task.
pub(crate) struct ReaperHandle {
    tx: Mutex<Option<mpsc::UnboundedSender<Watcher>>>,
}

impl ReaperHandle {
    /// Register a watcher; false once the reaper is stopped.
    pub(crate) fn watch(&self, watcher: Watcher) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(watcher).is_ok(),
            None => false,
        }
    }

    pub(crate) fn stop(&self) {
        if self.tx.lock().take().is_some() {
            debug!("Reaper intake closed");
        }
    }
}

pub(crate) type ReaperIntake = mpsc::UnboundedReceiver<Watcher>;

/// Create the intake; watchers sent before [`start`] are queued.
pub(crate) fn channel() -> (ReaperHandle, ReaperIntake) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ReaperHandle {
        tx: Mutex::new(Some(tx)),
    };
    (handle, rx)
}

/// Start the reaper task for `target`.
///
/// The task ends when the handle is stopped or `target` is dropped.
pub(crate) fn start<R: Reap>(cfg: ReaperConfig, target: Weak<R>, intake: ReaperIntake) {
    tokio::spawn(run(cfg, target, intake));
}

async fn run<R: Reap>(cfg: ReaperConfig, target: Weak<R>, mut rx: ReaperIntake) {
    info!(
        "Reaper started (initial sleep: {:?}, min frequency: {:?})",
        cfg.init_sleep, cfg.min_frequency
    );

    let mut watchers: Vec<Watcher> = Vec::new();
    let mut next_sweep = Instant::now() + cfg.init_sleep;

    loop {
        tokio::select! {
            watcher = rx.recv() => match watcher {
                Some(watcher) => {
                    debug!(
                        "Watching {} (max idle: {:?})",
                        fully_qualified_name(&watcher.namespace, &watcher.name),
                        watcher.max_idle
                    );
                    watchers.push(watcher);
                }
                None => break,
            },
            _ = sleep_until(next_sweep) => {
                let Some(target) = target.upgrade() else {
                    break;
                };
                let interval = sweep(&mut watchers, target.as_ref(), cfg.min_frequency);
                next_sweep = Instant::now() + interval;
            }
        }
    }

    info!("Reaper stopped with {} watchers", watchers.len());
}

/// Run one sweep and return the delay until the next one.
fn sweep<R: Reap + ?Sized>(watchers: &mut Vec<Watcher>, target: &R, min_frequency: Duration) -> Duration {
    let now = Instant::now();
    let mut reaped = 0u64;
    let mut next = min_frequency;

    watchers.retain_mut(|w| {
        // Removed by someone else already.
        if w.flag.is_destroyed() {
            return false;
        }

        if w.too_idle(now) {
            if target.reap(&w.namespace, &w.name, &w.flag) {
                reaped += 1;
                debug!(
                    "Reaped {} after {:?} idle",
                    fully_qualified_name(&w.namespace, &w.name),
                    now.saturating_duration_since(w.last_activity)
                );
            }
            return false;
        }

        next = next.min(w.max_idle);
        true
    });

    if reaped > 0 {
        info!("Reaper removed {} idle buckets, {} still watched", reaped, watchers.len());
    }
    metrics::record_reaped(reaped);

    next
}
