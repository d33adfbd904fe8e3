//! Router and daemon metrics, exported through the `metrics` facade.

use metrics::counter;

pub fn record_suppressed(limiter: &str) {
    counter!("lf_ratelimit_suppressed_total", "limiter" => limiter.to_string()).increment(1);
}

pub fn record_action_failure(action: &str, hook: &'static str) {
    counter!(
        "lf_action_failures_total",
        "action" => action.to_string(),
        "hook" => hook
    )
    .increment(1);
}

pub fn record_forwarded(queue: &str, count: usize) {
    counter!("lf_router_forwarded_total", "queue" => queue.to_string()).increment(count as u64);
}

pub fn record_preprocess_discard(reason: &'static str) {
    counter!("lf_preprocess_discarded_total", "reason" => reason).increment(1);
}

pub fn record_internal_dropped() {
    counter!("lf_internal_messages_dropped_total").increment(1);
}
