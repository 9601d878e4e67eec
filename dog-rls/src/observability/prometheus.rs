use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

use super::{Outcome, OutcomeSink};
use crate::types::Disposition;

/// Exports outcomes as Prometheus series.
#[derive(Clone)]
pub struct PrometheusSink {
    invocations: IntCounterVec,
    connections: IntCounterVec,
    rollback_failures: IntCounter,
    teardown_failures: IntCounter,
    duration: Histogram,
}

impl PrometheusSink {
    /// Create the series and register them in `registry`.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let invocations = IntCounterVec::new(
            Opts::new("tenant_tx_invocations_total", "Tenant-scoped invocations by result"),
            &["result", "kind"],
        )?;
        let connections = IntCounterVec::new(
            Opts::new("tenant_tx_connections_total", "Connections handed back to the pool"),
            &["disposition"],
        )?;
        let rollback_failures = IntCounter::new(
            "tenant_tx_rollback_failures_total",
            "Rollbacks that failed after a unit of work error",
        )?;
        let teardown_failures = IntCounter::new(
            "tenant_tx_teardown_failures_total",
            "Session context teardowns that failed",
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new("tenant_tx_duration_seconds", "Invocation wall time")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(invocations.clone()))?;
        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(rollback_failures.clone()))?;
        registry.register(Box::new(teardown_failures.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            invocations,
            connections,
            rollback_failures,
            teardown_failures,
            duration,
        })
    }
}

impl OutcomeSink for PrometheusSink {
    fn record_outcome(&self, outcome: &Outcome) {
        let result = if outcome.success { "ok" } else { "error" };
        let kind = outcome.error_kind.map(|k| k.as_str()).unwrap_or("none");
        self.invocations.with_label_values(&[result, kind]).inc();

        if let Some(disposition) = outcome.disposition {
            self.connections
                .with_label_values(&[disposition.as_str()])
                .inc();
        }
        if outcome.rollback_failed() {
            self.rollback_failures.inc();
        }
        if outcome.teardown_failed() {
            self.teardown_failures.inc();
        }
        self.duration.observe(outcome.duration_ms as f64 / 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::TenantRef;
    use crate::types::InvocationId;
    use chrono::Utc;

    #[test]
    fn records_discards_and_teardown_failures() {
        let registry = Registry::new();
        let sink = PrometheusSink::register(&registry).unwrap();

        sink.record_outcome(&Outcome {
            invocation_id: InvocationId::new(),
            success: true,
            duration_ms: 12,
            tenant: TenantRef {
                user_id: "u1".into(),
                organization_id: "o1".into(),
            },
            error_kind: None,
            error_detail: None,
            rollback_error: None,
            teardown_error: Some("RESET failed".into()),
            connection_id: Some(1),
            disposition: Some(Disposition::Discarded),
            at: Utc::now(),
        });

        assert_eq!(sink.teardown_failures.get(), 1);
        assert_eq!(sink.connections.with_label_values(&["discarded"]).get(), 1);
        assert_eq!(sink.invocations.with_label_values(&["ok", "none"]).get(), 1);
        assert!(!registry.gather().is_empty());
    }
}
