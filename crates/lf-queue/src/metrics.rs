//! Queue metrics, exported through the `metrics` facade.

use metrics::{counter, gauge};

pub fn record_enqueued(queue: &str) {
    counter!("lf_queue_enqueued_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_spilled(queue: &str) {
    counter!("lf_queue_spilled_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_discarded(queue: &str, reason: &str) {
    counter!(
        "lf_queue_discarded_total",
        "queue" => queue.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_transient_full(queue: &str) {
    counter!("lf_queue_transient_full_total", "queue" => queue.to_string()).increment(1);
}

pub fn set_queue_depth(queue: &str, depth: usize) {
    gauge!("lf_queue_depth", "queue" => queue.to_string()).set(depth as f64);
}

pub fn set_active_workers(queue: &str, count: usize) {
    gauge!("lf_queue_active_workers", "queue" => queue.to_string()).set(count as f64);
}
