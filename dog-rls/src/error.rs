use std::time::Duration;

use dog_core::{DogError, MissingIdentity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TxPhase;

/// Result type for tenant-scoped operations
pub type TxResult<T> = Result<T, TxError>;

/// How a driver-level failure left the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbErrorKind {
    /// The statement failed; the link is still fine.
    Statement,
    /// The link is dead or its protocol state is unknown.
    ConnectionLost,
    /// Refused before reaching the database.
    Rejected,
}

/// Error reported by a connection for a single statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
}

impl DbError {
    pub fn statement(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Statement,
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::ConnectionLost,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        self.kind == DbErrorKind::ConnectionLost
    }
}

/// Errors from the connection pool itself.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("no connection available within {timeout:?}")]
    Exhausted { timeout: Duration },

    #[error("connection pool is closed")]
    Closed,

    #[error("failed to open connection: {0}")]
    Connect(#[source] DbError),
}

/// Configuration errors raised while building pools or session keys.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid session key {key:?}: {reason}")]
    InvalidSessionKey { key: String, reason: &'static str },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("missing required setting: {0}")]
    Missing(String),
}

/// Infrastructure errors for one tenant-scoped invocation
#[derive(Error, Debug)]
pub enum TxError {
    #[error("invalid tenant identity: {} is empty", .0.field())]
    InvalidIdentity(MissingIdentity),

    #[error("connection pool exhausted after {timeout:?}")]
    PoolExhausted { timeout: Duration },

    #[error("transaction failed while {phase}: {source}")]
    TransactionFailed {
        phase: TxPhase,
        #[source]
        source: DbError,
    },

    #[error("unit of work failed: {0}")]
    WorkFailed(#[source] anyhow::Error),

    /// Only ever reported to the instrumentation sink.
    #[error("session context teardown failed: {0}")]
    ContextTeardownFailed(#[source] DbError),

    #[error("connection poisoned while {phase}: {source}")]
    ConnectionPoisoned {
        phase: TxPhase,
        #[source]
        source: DbError,
    },

    #[error("tenant transaction cancelled")]
    Cancelled,
}

/// Fieldless mirror of [`TxError`] for events and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxErrorKind {
    InvalidIdentity,
    PoolExhausted,
    TransactionFailed,
    WorkFailed,
    ContextTeardownFailed,
    ConnectionPoisoned,
    Cancelled,
}

impl TxErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxErrorKind::InvalidIdentity => "invalid_identity",
            TxErrorKind::PoolExhausted => "pool_exhausted",
            TxErrorKind::TransactionFailed => "transaction_failed",
            TxErrorKind::WorkFailed => "work_failed",
            TxErrorKind::ContextTeardownFailed => "context_teardown_failed",
            TxErrorKind::ConnectionPoisoned => "connection_poisoned",
            TxErrorKind::Cancelled => "cancelled",
        }
    }
}

impl TxError {
    pub fn kind(&self) -> TxErrorKind {
        match self {
            TxError::InvalidIdentity(_) => TxErrorKind::InvalidIdentity,
            TxError::PoolExhausted { .. } => TxErrorKind::PoolExhausted,
            TxError::TransactionFailed { .. } => TxErrorKind::TransactionFailed,
            TxError::WorkFailed(_) => TxErrorKind::WorkFailed,
            TxError::ContextTeardownFailed(_) => TxErrorKind::ContextTeardownFailed,
            TxError::ConnectionPoisoned { .. } => TxErrorKind::ConnectionPoisoned,
            TxError::Cancelled => TxErrorKind::Cancelled,
        }
    }

    /// Classify a failed transaction-control statement by what it did to the link.
    pub(crate) fn control(phase: TxPhase, source: DbError) -> Self {
        if source.is_connection_lost() {
            TxError::ConnectionPoisoned { phase, source }
        } else {
            TxError::TransactionFailed { phase, source }
        }
    }

    /// The error `work` raised, when this is `WorkFailed`.
    pub fn work_error(&self) -> Option<&anyhow::Error> {
        match self {
            TxError::WorkFailed(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn into_work_error(self) -> Result<anyhow::Error, TxError> {
        match self {
            TxError::WorkFailed(inner) => Ok(inner),
            other => Err(other),
        }
    }

    /// Request-boundary view of this failure, source stripped.
    pub fn to_dog_error(&self) -> DogError {
        let dog = match self {
            TxError::InvalidIdentity(_) => DogError::bad_request(self.to_string()),
            TxError::PoolExhausted { .. } => {
                DogError::too_many_requests("database is busy, retry later")
            }
            TxError::Cancelled => DogError::timeout("request cancelled"),
            TxError::ConnectionPoisoned { .. } => DogError::unavailable("database unavailable"),
            TxError::WorkFailed(inner) => match DogError::from_anyhow(inner) {
                Some(dog) => dog.sanitize_for_client(),
                None => DogError::general_error("request failed"),
            },
            TxError::TransactionFailed { .. } | TxError::ContextTeardownFailed(_) => {
                DogError::general_error("request failed")
            }
        };
        dog.sanitize_for_client()
    }
}

impl From<PoolError> for TxError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { timeout } => TxError::PoolExhausted { timeout },
            PoolError::Closed => TxError::TransactionFailed {
                phase: TxPhase::Acquiring,
                source: DbError::rejected("connection pool is closed"),
            },
            PoolError::Connect(source) => TxError::control(TxPhase::Acquiring, source),
        }
    }
}
