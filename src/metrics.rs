use crate::events::{Event, EventType};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

lazy_static! {
    // Request metrics
    pub static ref TOKENS_SERVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotad_tokens_served_total",
        "Total number of tokens granted",
        &["namespace", "dynamic"]
    ).unwrap();

    pub static ref TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotad_timeouts_total",
        "Requests that could not be served within their max wait",
        &["namespace"]
    ).unwrap();

    pub static ref TOO_MANY_TOKENS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotad_too_many_tokens_requested_total",
        "Requests exceeding the per-request token limit",
        &["namespace"]
    ).unwrap();

    pub static ref WAIT_DURATION: HistogramVec = register_histogram_vec!(
        "quotad_wait_duration_seconds",
        "Wait time handed out with granted tokens",
        &["namespace"],
        vec![0.0, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    // Bucket lifecycle metrics
    pub static ref BUCKET_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotad_bucket_events_total",
        "Bucket created, removed and miss events",
        &["event", "namespace", "dynamic"]
    ).unwrap();

    pub static ref BUCKETS_REAPED_TOTAL: IntCounter = register_int_counter!(
        "quotad_buckets_reaped_total",
        "Buckets removed by the reaper due to inactivity"
    ).unwrap();

    // Redis metrics
    pub static ref REDIS_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotad_redis_errors_total",
        "Total number of Redis errors",
        &["error_type"]
    ).unwrap();

    pub static ref REDIS_RECONNECTS_TOTAL: IntCounter = register_int_counter!(
        "quotad_redis_reconnects_total",
        "Successful Redis reconnections"
    ).unwrap();

    pub static ref REDIS_DURATION: HistogramVec = register_histogram_vec!(
        "quotad_redis_duration_seconds",
        "Redis command duration in seconds",
        &["command"],
        vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]
    ).unwrap();
}

fn dynamic_label(dynamic: bool) -> &'static str {
    if dynamic {
        "true"
    } else {
        "false"
    }
}

/// Event listener that updates the Prometheus counters.
///
/// Register it with [`crate::events::EventProducer::register`].
pub fn record_event(event: Event) {
    let ns = event.namespace.as_str();
    match event.event_type {
        EventType::TokensServed => {
            TOKENS_SERVED_TOTAL
                .with_label_values(&[ns, dynamic_label(event.dynamic)])
                .inc_by(event.num_tokens);
            WAIT_DURATION
                .with_label_values(&[ns])
                .observe(event.wait_time.as_secs_f64());
        }
        EventType::TimeoutServingTokens => {
            TIMEOUTS_TOTAL.with_label_values(&[ns]).inc();
        }
        EventType::TooManyTokensRequested => {
            TOO_MANY_TOKENS_TOTAL.with_label_values(&[ns]).inc();
        }
        EventType::BucketMiss | EventType::BucketCreated | EventType::BucketRemoved => {
            BUCKET_EVENTS_TOTAL
                .with_label_values(&[event.event_type.as_str(), ns, dynamic_label(event.dynamic)])
                .inc();
        }
    }
}

/// Record buckets removed in one reaper sweep
pub fn record_reaped(count: u64) {
    BUCKETS_REAPED_TOTAL.inc_by(count);
}

/// Record Redis error
pub fn record_redis_error(error_type: &str) {
    REDIS_ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Record a successful reconnect
pub fn record_redis_reconnect() {
    REDIS_RECONNECTS_TOTAL.inc();
}

/// Record Redis operation duration
pub fn record_redis_duration(command: &str, duration_secs: f64) {
    REDIS_DURATION
        .with_label_values(&[command])
        .observe(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_record_event_counts_tokens() {
        let before = TOKENS_SERVED_TOTAL
            .with_label_values(&["metrics_test", "false"])
            .get();
        record_event(Event::tokens_served(
            "metrics_test",
            "b",
            false,
            7,
            Duration::from_millis(3),
        ));
        let after = TOKENS_SERVED_TOTAL
            .with_label_values(&["metrics_test", "false"])
            .get();
        assert_eq!(after - before, 7);
    }

    #[test]
    fn test_record_bucket_events() {
        record_event(Event::bucket_created("metrics_test_ns", "b", true));
        let created = BUCKET_EVENTS_TOTAL
            .with_label_values(&["EVENT_BUCKET_CREATED", "metrics_test_ns", "true"])
            .get();
        assert!(created >= 1);
    }
}
