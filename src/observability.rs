use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Report polling counters shared by every session of an orchestrator
#[derive(Debug, Default)]
pub struct PollingMetrics {
    pub submissions: AtomicU64,
    pub polls: AtomicU64,
    pub transient_failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub failures: AtomicU64,
    pub successes: AtomicU64,
    pub superseded: AtomicU64,
}

impl PollingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_failure(&self) {
        self.transient_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        warn!("Report polling session timed out");
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> PollingStats {
        PollingStats {
            submissions: self.submissions.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Report polling metrics: submissions={}, polls={}, transient_failures={}, timeouts={}, failures={}, successes={}, superseded={}",
            stats.submissions,
            stats.polls,
            stats.transient_failures,
            stats.timeouts,
            stats.failures,
            stats.successes,
            stats.superseded
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollingStats {
    pub submissions: u64,
    pub polls: u64,
    pub transient_failures: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub successes: u64,
    pub superseded: u64,
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
