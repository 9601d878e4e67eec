//! # dog-rls: Tenant-Scoped Transactions over Pooled Connections
//!
//! **Row-level-security session context that never leaks between tenants**
//!
//! Every unit of work runs inside its own transaction on a borrowed pooled
//! connection, with the caller's user and organization installed as
//! transaction-local settings that RLS policies read. When the work is done
//! the settings are torn down before the connection goes back to the pool;
//! if teardown cannot be confirmed the connection is discarded instead.
//!
//! ## Guarantees
//!
//! - **No cross-tenant bleed**: a released connection carries no tenant context
//! - **No leaks**: every acquired connection is released or discarded exactly once,
//!   including on cancellation
//! - **Honest errors**: the caller's own error comes back unwrapped inside
//!   [`TxError::WorkFailed`]; cleanup failures go to the instrumentation sink
//! - **Bound parameters only**: identities never get spliced into SQL text
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_rls::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), TxError> {
//! let manager = TenantTxManager::new(Arc::new(MemoryPool::new(4)));
//! let identity = TenantIdentity::new("user-1", "org-1");
//!
//! let user = manager
//!     .run_tenant_scoped(&identity, |mut tx| {
//!         Box::pin(async move {
//!             let rows = tx
//!                 .execute(&Statement::new("SELECT current_setting($1)").bind("app.current_user_id"))
//!                 .await?;
//!             anyhow::Ok(rows.scalar().and_then(SqlValue::as_str).map(str::to_string))
//!         })
//!     })
//!     .await?;
//! assert_eq!(user.as_deref(), Some("user-1"));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod observability;
pub mod session;
pub mod statement;
pub mod types;

pub use backend::{ConnectionPool, PooledConnection};
pub use config::{PoolConfig, TenantTxConfig};
pub use error::{ConfigError, DbError, DbErrorKind, PoolError, TxError, TxErrorKind, TxResult};
pub use manager::{TenantTx, TenantTxManager, WorkFuture};
pub use observability::{LiveMetrics, MetricsSnapshot, NoopSink, ObservabilityLayer, Outcome, OutcomeSink};
pub use session::{DecodeError, SessionContextCodec, SessionKeys};
pub use statement::{Row, Rows, SqlValue, Statement};
pub use types::{Disposition, InvocationId, TxPhase};

pub use dog_core::{OrganizationId, TenantIdentity, UserId};

#[cfg(feature = "memory")]
pub use backend::memory::MemoryPool;

#[cfg(feature = "postgres")]
pub use backend::postgres::PgTenantPool;

/// Everything a request handler needs to run tenant-scoped work
pub mod prelude {
    pub use crate::{
        ConnectionPool, TenantIdentity, TenantTx, TenantTxConfig, TenantTxManager, TxError,
        TxResult,
    };

    pub use crate::{Rows, SqlValue, Statement};

    // Observability
    pub use crate::{LiveMetrics, ObservabilityLayer, Outcome, OutcomeSink};

    #[cfg(feature = "memory")]
    pub use crate::MemoryPool;

    #[cfg(feature = "postgres")]
    pub use crate::PgTenantPool;
}
