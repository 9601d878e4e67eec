use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Outcome;
use crate::error::TxErrorKind;
use crate::types::Disposition;

/// Live counters for tenant-scoped invocations
pub struct LiveMetrics {
    invocations: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    rollback_failures: AtomicU64,
    teardown_failures: AtomicU64,
    total_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,

    // Returned error kinds
    failures_by_kind: RwLock<HashMap<TxErrorKind, u64>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            released: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            rollback_failures: AtomicU64::new(0),
            teardown_failures: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            max_duration_ms: AtomicU64::new(0),
            failures_by_kind: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, outcome: &Outcome) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if outcome.success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        match outcome.disposition {
            Some(Disposition::Released) => {
                self.released.fetch_add(1, Ordering::Relaxed);
            }
            Some(Disposition::Discarded) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }

        if outcome.rollback_failed() {
            self.rollback_failures.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.teardown_failed() {
            self.teardown_failures.fetch_add(1, Ordering::Relaxed);
        }

        self.total_duration_ms
            .fetch_add(outcome.duration_ms, Ordering::Relaxed);
        self.max_duration_ms
            .fetch_max(outcome.duration_ms, Ordering::Relaxed);

        if let Some(kind) = outcome.error_kind {
            *self.failures_by_kind.write().entry(kind).or_insert(0) += 1;
        }
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn teardown_failures(&self) -> u64 {
        self.teardown_failures.load(Ordering::Relaxed)
    }

    pub fn rollback_failures(&self) -> u64 {
        self.rollback_failures.load(Ordering::Relaxed)
    }

    pub fn failures_of(&self, kind: TxErrorKind) -> u64 {
        self.failures_by_kind.read().get(&kind).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let invocations = self.invocations();
        let total = self.total_duration_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            invocations,
            succeeded: self.succeeded(),
            failed: self.failed(),
            released: self.released(),
            discarded: self.discarded(),
            rollback_failures: self.rollback_failures(),
            teardown_failures: self.teardown_failures(),
            average_duration_ms: if invocations == 0 { 0 } else { total / invocations },
            max_duration_ms: self.max_duration_ms.load(Ordering::Relaxed),
            failures_by_kind: self
                .failures_by_kind
                .read()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
        }
    }
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`LiveMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub invocations: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub released: u64,
    pub discarded: u64,
    pub rollback_failures: u64,
    pub teardown_failures: u64,
    pub average_duration_ms: u64,
    pub max_duration_ms: u64,
    pub failures_by_kind: HashMap<String, u64>,
}

impl MetricsSnapshot {
    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            100.0
        } else {
            (self.succeeded as f64 / self.invocations as f64) * 100.0
        }
    }

    /// Share of returned connections that had to be thrown away, as percentage
    pub fn discard_rate(&self) -> f64 {
        let returned = self.released + self.discarded;
        if returned == 0 {
            0.0
        } else {
            (self.discarded as f64 / returned as f64) * 100.0
        }
    }
}
