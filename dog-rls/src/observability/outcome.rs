use chrono::{DateTime, Utc};
use dog_core::TenantIdentity;
use serde::{Deserialize, Serialize};

use crate::error::TxErrorKind;
use crate::types::{Disposition, InvocationId};

/// Reference-only view of the tenant an invocation ran as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRef {
    pub user_id: String,
    pub organization_id: String,
}

impl From<&TenantIdentity> for TenantRef {
    fn from(identity: &TenantIdentity) -> Self {
        Self {
            user_id: identity.user_id.as_str().to_string(),
            organization_id: identity.organization_id.as_str().to_string(),
        }
    }
}

/// One event per manager invocation. Never carries the work's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub invocation_id: InvocationId,
    pub success: bool,
    pub duration_ms: u64,
    pub tenant: TenantRef,
    /// Kind of the error returned to the caller, if any.
    pub error_kind: Option<TxErrorKind>,
    pub error_detail: Option<String>,
    /// Rollback failure; never returned to the caller.
    pub rollback_error: Option<String>,
    /// Teardown failure (`ContextTeardownFailed`); never returned to the caller.
    pub teardown_error: Option<String>,
    pub connection_id: Option<u64>,
    /// `None` when no connection was ever acquired.
    pub disposition: Option<Disposition>,
    pub at: DateTime<Utc>,
}

impl Outcome {
    pub fn teardown_failed(&self) -> bool {
        self.teardown_error.is_some()
    }

    pub fn rollback_failed(&self) -> bool {
        self.rollback_error.is_some()
    }

    /// Every error kind this invocation ran into, returned or absorbed.
    pub fn incidents(&self) -> Vec<TxErrorKind> {
        let mut kinds: Vec<TxErrorKind> = self.error_kind.into_iter().collect();
        if self.teardown_failed() {
            kinds.push(TxErrorKind::ContextTeardownFailed);
        }
        kinds
    }

    pub fn has_incident(&self, kind: TxErrorKind) -> bool {
        self.incidents().contains(&kind)
    }

    #[cfg(feature = "json")]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Receives one [`Outcome`] per invocation.
pub trait OutcomeSink: Send + Sync {
    fn record_outcome(&self, outcome: &Outcome);
}

impl<F> OutcomeSink for F
where
    F: Fn(&Outcome) + Send + Sync,
{
    fn record_outcome(&self, outcome: &Outcome) {
        self(outcome)
    }
}

/// Drops every outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl OutcomeSink for NoopSink {
    fn record_outcome(&self, _outcome: &Outcome) {}
}
