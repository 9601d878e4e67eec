pub mod analytics;
pub mod metrics;
pub mod outcome;

#[cfg(feature = "metrics")]
pub mod prometheus;

#[cfg(feature = "tracing-basic")]
pub mod tracing;

pub use analytics::ObservabilityLayer;
pub use metrics::{LiveMetrics, MetricsSnapshot};
pub use outcome::{NoopSink, Outcome, OutcomeSink, TenantRef};

#[cfg(feature = "metrics")]
pub use self::prometheus::PrometheusSink;

#[cfg(feature = "tracing-basic")]
pub use self::tracing::init_tracing;
