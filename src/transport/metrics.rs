use crate::ErrorKind;
use http::StatusCode;
use std::time::Duration;

pub(crate) struct InFlightGuard {
    gauge: metrics::Gauge,
}

impl InFlightGuard {
    pub(crate) fn new() -> Self {
        let gauge = metrics::gauge!("offline_comments_inflight");
        gauge.increment(1.0);
        Self { gauge }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.decrement(1.0);
    }
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

fn error_kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Transport => "transport",
        ErrorKind::BodyUsed => "body_used",
        ErrorKind::Storage => "storage",
        ErrorKind::Encode => "encode",
        ErrorKind::Policy => "policy",
        ErrorKind::InvalidConfig => "invalid_config",
        ErrorKind::Task => "task",
    }
}

/// Outcome of a live submission attempt.
pub(crate) fn record_live(status: Option<StatusCode>, latency: Duration) {
    let status_class = status.map(status_class).unwrap_or("transport");
    metrics::counter!(
        "offline_comments_live_attempts_total",
        "status_class" => status_class
    )
    .increment(1);
    metrics::histogram!(
        "offline_comments_live_duration_seconds",
        "status_class" => status_class
    )
    .record(latency);
}

pub(crate) fn record_enqueue(queue: &str, error_kind: Option<ErrorKind>) {
    let queue = queue.to_owned();
    match error_kind {
        None => metrics::counter!("offline_comments_enqueued_total", "queue" => queue).increment(1),
        Some(kind) => metrics::counter!(
            "offline_comments_enqueue_failures_total",
            "queue" => queue,
            "kind" => error_kind_label(kind)
        )
        .increment(1),
    }
}

/// `outcome` is one of `delivered`, `failed`, `expired`, `dropped`.
pub(crate) fn record_replay(queue: &str, outcome: &'static str, count: usize) {
    if count == 0 {
        return;
    }
    metrics::counter!(
        "offline_comments_replayed_total",
        "queue" => queue.to_owned(),
        "outcome" => outcome
    )
    .increment(count as u64);
}
