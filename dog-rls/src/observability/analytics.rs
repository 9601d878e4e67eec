use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{LiveMetrics, Outcome, OutcomeSink};
use crate::error::TxErrorKind;

/// Default instrumentation sink: structured logs, live metrics and an
/// outcome broadcast, optionally fanned out to further sinks.
#[derive(Clone)]
pub struct ObservabilityLayer {
    outcome_broadcaster: broadcast::Sender<Outcome>,
    metrics: Arc<LiveMetrics>,
    sinks: Vec<Arc<dyn OutcomeSink>>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        let (outcome_broadcaster, _) = broadcast::channel(10000);

        Self {
            outcome_broadcaster,
            metrics: Arc::new(LiveMetrics::new()),
            sinks: Vec::new(),
        }
    }

    /// Forward every outcome to another sink as well.
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Subscribe to outcomes recorded from now on.
    pub fn event_stream(&self) -> broadcast::Receiver<Outcome> {
        self.outcome_broadcaster.subscribe()
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }

    fn log(&self, outcome: &Outcome) {
        let tenant = &outcome.tenant;
        if let Some(err) = &outcome.rollback_error {
            warn!(
                invocation_id = %outcome.invocation_id,
                user_id = %tenant.user_id,
                organization_id = %tenant.organization_id,
                "rollback failed: {}", err
            );
        }
        if let Some(err) = &outcome.teardown_error {
            warn!(
                invocation_id = %outcome.invocation_id,
                user_id = %tenant.user_id,
                organization_id = %tenant.organization_id,
                connection_id = ?outcome.connection_id,
                "session context teardown failed, connection discarded: {}", err
            );
        }

        match outcome.error_kind {
            None => debug!(
                invocation_id = %outcome.invocation_id,
                duration_ms = outcome.duration_ms,
                disposition = ?outcome.disposition,
                "tenant transaction committed"
            ),
            // the caller's own failure; reported to them already
            Some(TxErrorKind::WorkFailed) | Some(TxErrorKind::InvalidIdentity) => info!(
                invocation_id = %outcome.invocation_id,
                duration_ms = outcome.duration_ms,
                kind = ?outcome.error_kind,
                "tenant transaction failed: {}",
                outcome.error_detail.as_deref().unwrap_or("")
            ),
            Some(kind) => warn!(
                invocation_id = %outcome.invocation_id,
                duration_ms = outcome.duration_ms,
                kind = kind.as_str(),
                disposition = ?outcome.disposition,
                "tenant transaction failed: {}",
                outcome.error_detail.as_deref().unwrap_or("")
            ),
        }
    }
}

impl OutcomeSink for ObservabilityLayer {
    fn record_outcome(&self, outcome: &Outcome) {
        self.log(outcome);
        self.metrics.record(outcome);
        let _ = self.outcome_broadcaster.send(outcome.clone());
        for sink in &self.sinks {
            sink.record_outcome(outcome);
        }
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}
