//! Tenant-scoped transactions.
//!
//! [`TenantTxManager::run_tenant_scoped`] borrows one pooled connection,
//! opens a transaction, installs the tenant's session context, runs the
//! caller's work, commits or rolls back, tears the context down and hands
//! the connection back. A connection whose teardown failed, or whose link
//! broke, is discarded instead of released so no other tenant can ever
//! observe a stale context on it.

mod handle;
mod lease;

pub use handle::{TenantTx, WorkFuture};

use chrono::Utc;
use dog_core::TenantIdentity;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

use crate::{
    backend::ConnectionPool,
    config::TenantTxConfig,
    error::{TxError, TxResult},
    observability::{ObservabilityLayer, Outcome, OutcomeSink, TenantRef},
    session::SessionContextCodec,
    types::InvocationId,
};
use lease::Lease;

/// Runs units of work under a tenant's row-level-security context.
pub struct TenantTxManager<P: ConnectionPool> {
    pool: Arc<P>,
    codec: SessionContextCodec,
    sink: Arc<dyn OutcomeSink>,
    config: TenantTxConfig,
}

impl<P: ConnectionPool> TenantTxManager<P> {
    /// Manager with default config, reporting to a fresh [`ObservabilityLayer`].
    pub fn new(pool: Arc<P>) -> Self {
        Self::with_config(pool, TenantTxConfig::default())
    }

    pub fn with_config(pool: Arc<P>, config: TenantTxConfig) -> Self {
        Self {
            pool,
            codec: SessionContextCodec::new(config.session_keys.clone()),
            sink: Arc::new(ObservabilityLayer::new()),
            config,
        }
    }

    /// Replace the instrumentation sink.
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    pub fn config(&self) -> &TenantTxConfig {
        &self.config
    }

    pub fn codec(&self) -> &SessionContextCodec {
        &self.codec
    }

    /// Run `work` inside one transaction scoped to `identity`.
    ///
    /// Returns the work's value after a successful commit. Errors raised by
    /// `work` come back as [`TxError::WorkFailed`] with the original error
    /// inside. Exactly one [`Outcome`] is reported per call.
    ///
    /// ```ignore
    /// let id = manager
    ///     .run_tenant_scoped(&identity, |mut tx| Box::pin(async move {
    ///         let rows = tx.execute(&Statement::new("SELECT count(*) FROM tickets")).await?;
    ///         anyhow::Ok(rows.scalar().and_then(SqlValue::as_i64))
    ///     }))
    ///     .await?;
    /// ```
    pub async fn run_tenant_scoped<T, F>(&self, identity: &TenantIdentity, work: F) -> TxResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(TenantTx<'t, P::Conn>) -> WorkFuture<'t, T> + Send,
    {
        self.run_tenant_scoped_until(identity, futures::future::pending::<()>(), work)
            .await
    }

    /// Like [`run_tenant_scoped`](Self::run_tenant_scoped), but gives up with
    /// [`TxError::Cancelled`] once `cancel` completes. Cancellation is
    /// observed while waiting for a connection and while work runs; the
    /// transaction is rolled back and the context torn down either way.
    #[instrument(
        name = "tenant_tx",
        skip(self, identity, cancel, work),
        fields(user_id = %identity.user_id, organization_id = %identity.organization_id)
    )]
    pub async fn run_tenant_scoped_until<T, F, S>(
        &self,
        identity: &TenantIdentity,
        cancel: S,
        work: F,
    ) -> TxResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(TenantTx<'t, P::Conn>) -> WorkFuture<'t, T> + Send,
        S: Future<Output = ()> + Send,
    {
        let invocation_id = InvocationId::new();
        let started = Instant::now();

        if let Some(missing) = identity.missing() {
            let err = TxError::InvalidIdentity(missing);
            self.report_unleased(invocation_id, identity, started, &err);
            return Err(err);
        }

        tokio::pin!(cancel);

        debug!(%invocation_id, "acquiring connection");
        let acquired = tokio::select! {
            biased;
            acquired = self.pool.acquire(self.config.acquire_timeout) => acquired.map_err(TxError::from),
            _ = cancel.as_mut() => Err(TxError::Cancelled),
        };
        let conn = match acquired {
            Ok(conn) => conn,
            Err(err) => {
                self.report_unleased(invocation_id, identity, started, &err);
                return Err(err);
            }
        };

        let mut lease = Lease::new(
            self.pool.clone(),
            self.codec.clone(),
            self.sink.clone(),
            conn,
            identity,
            invocation_id,
            started,
        );

        let result = match lease.open(identity).await {
            Ok(()) => lease.run_work(identity, work, cancel.as_mut()).await,
            Err(err) => Err(err),
        };
        let disposition = lease.finish().await;
        debug_assert!(lease.phase().is_terminal());

        lease.emit(result.as_ref().err(), disposition);
        result
    }

    /// Outcome for invocations that never held a connection.
    fn report_unleased(
        &self,
        invocation_id: InvocationId,
        identity: &TenantIdentity,
        started: Instant,
        err: &TxError,
    ) {
        self.sink.record_outcome(&Outcome {
            invocation_id,
            success: false,
            duration_ms: started.elapsed().as_millis() as u64,
            tenant: TenantRef::from(identity),
            error_kind: Some(err.kind()),
            error_detail: Some(err.to_string()),
            rollback_error: None,
            teardown_error: None,
            connection_id: None,
            disposition: None,
            at: Utc::now(),
        });
    }
}

impl<P: ConnectionPool> Clone for TenantTxManager<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            codec: self.codec.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
        }
    }
}
