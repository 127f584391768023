//! Notifications emitted by the bucket container and the quota service.
//!
//! Listeners are hooked in through an [`EventSink`]. The [`EventProducer`] sink
//! buffers events on a bounded channel and hands them to a listener task, so
//! emitting never blocks the caller.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TokensServed,
    TimeoutServingTokens,
    TooManyTokensRequested,
    BucketMiss,
    BucketCreated,
    BucketRemoved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TokensServed => "EVENT_TOKENS_SERVED",
            EventType::TimeoutServingTokens => "EVENT_TIMEOUT_SERVING_TOKENS",
            EventType::TooManyTokensRequested => "EVENT_TOO_MANY_TOKENS_REQUESTED",
            EventType::BucketMiss => "EVENT_BUCKET_MISS",
            EventType::BucketCreated => "EVENT_BUCKET_CREATED",
            EventType::BucketRemoved => "EVENT_BUCKET_REMOVED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub namespace: String,
    pub bucket_name: String,
    pub dynamic: bool,
    pub num_tokens: u64,
    pub wait_time: Duration,
}

impl Event {
    fn named(event_type: EventType, namespace: &str, bucket_name: &str, dynamic: bool) -> Self {
        Self {
            event_type,
            namespace: namespace.to_string(),
            bucket_name: bucket_name.to_string(),
            dynamic,
            num_tokens: 0,
            wait_time: Duration::ZERO,
        }
    }

    pub fn tokens_served(
        namespace: &str,
        bucket_name: &str,
        dynamic: bool,
        num_tokens: u64,
        wait_time: Duration,
    ) -> Self {
        Self {
            num_tokens,
            wait_time,
            ..Self::named(EventType::TokensServed, namespace, bucket_name, dynamic)
        }
    }

    pub fn timed_out(namespace: &str, bucket_name: &str, dynamic: bool, num_tokens: u64) -> Self {
        Self {
            num_tokens,
            ..Self::named(EventType::TimeoutServingTokens, namespace, bucket_name, dynamic)
        }
    }

    pub fn too_many_tokens_requested(
        namespace: &str,
        bucket_name: &str,
        dynamic: bool,
        num_tokens: u64,
    ) -> Self {
        Self {
            num_tokens,
            ..Self::named(EventType::TooManyTokensRequested, namespace, bucket_name, dynamic)
        }
    }

    pub fn bucket_miss(namespace: &str, bucket_name: &str) -> Self {
        Self::named(EventType::BucketMiss, namespace, bucket_name, false)
    }

    pub fn bucket_created(namespace: &str, bucket_name: &str, dynamic: bool) -> Self {
        Self::named(EventType::BucketCreated, namespace, bucket_name, dynamic)
    }

    pub fn bucket_removed(namespace: &str, bucket_name: &str, dynamic: bool) -> Self {
        Self::named(EventType::BucketRemoved, namespace, bucket_name, dynamic)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event{{type: {}, namespace: {}, name: {}, dynamic: {}, numTokens: {}, waitTime: {:?}}}",
            self.event_type,
            self.namespace,
            self.bucket_name,
            self.dynamic,
            self.num_tokens,
            self.wait_time
        )
    }
}

/// Receives events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardEvents;

impl EventSink for DiscardEvents {
    fn emit(&self, _event: Event) {}
}

/// Buffers events and feeds them to a listener running on its own task.
#[derive(Debug)]
pub struct EventProducer {
    tx: mpsc::Sender<Event>,
}

impl EventProducer {
    /// Spawn a listener task fed by a buffer of `buffer_size` events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register<F>(listener: F, buffer_size: usize) -> Arc<Self>
    where
        F: Fn(Event) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(buffer_size.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                listener(event);
            }
            debug!("Event listener shutting down");
        });

        Arc::new(Self { tx })
    }
}

impl EventSink for EventProducer {
    fn emit(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!("Event buffer full; dropping {}", event.event_type);
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("Event listener gone; dropping event");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that keeps everything it receives.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        pub fn count(&self, event_type: EventType) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| e.event_type == event_type)
                .count()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: Event) {
            self.events.lock().push(event);
        }
    }
}
