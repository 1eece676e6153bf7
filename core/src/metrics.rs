use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::Utc;
use serde::Serialize;

/// Process-wide request counters. Initialized once at startup and shared
/// behind an `Arc`; not hot-reloadable.
#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    responses_success: AtomicU64,
    responses_error: AtomicU64,
    cache_hits: AtomicU64,
    tool_calls: AtomicU64,
    streaming_sessions: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub responses_success: u64,
    pub responses_error: u64,
    pub cache_hits: u64,
    pub tool_calls: u64,
    pub streaming_sessions: u64,
    pub timestamp: String,
}

impl Metrics {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.responses_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.responses_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_call(&self) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_streaming_session(&self) {
        self.streaming_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            responses_success: self.responses_success.load(Ordering::Relaxed),
            responses_error: self.responses_error.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            streaming_sessions: self.streaming_sessions.load(Ordering::Relaxed),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::default();
        metrics.record_request();
        metrics.record_request();
        metrics.record_success();
        metrics.record_cache_hit();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.responses_success, 1);
        assert_eq!(snapshot.responses_error, 0);
        assert_eq!(snapshot.cache_hits, 1);
    }
}
