use chrono::Utc;
use dog_core::TenantIdentity;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use super::handle::{TenantTx, WorkFuture};
use crate::{
    backend::{ConnectionPool, PooledConnection},
    error::{DbError, TxError, TxErrorKind},
    observability::{Outcome, OutcomeSink, TenantRef},
    session::SessionContextCodec,
    statement::Statement,
    types::{Disposition, InvocationId, TxPhase},
};

/// Exclusive possession of one pooled connection for one invocation.
///
/// Walks the [`TxPhase`] machine. If dropped while still holding the
/// connection (caller cancelled, work panicked), `Drop` hands the
/// connection to a cleanup task so rollback, teardown and release or
/// discard still happen.
pub(crate) struct Lease<P: ConnectionPool> {
    pool: Arc<P>,
    codec: SessionContextCodec,
    sink: Arc<dyn OutcomeSink>,
    conn: Option<P::Conn>,
    connection_id: u64,
    phase: TxPhase,
    tenant: TenantRef,
    invocation_id: InvocationId,
    started: Instant,
    poisoned: bool,
    aborted_by: Option<DbError>,
    committed: bool,
    rollback_error: Option<String>,
    teardown_error: Option<String>,
}

impl<P: ConnectionPool> Lease<P> {
    pub(crate) fn new(
        pool: Arc<P>,
        codec: SessionContextCodec,
        sink: Arc<dyn OutcomeSink>,
        conn: P::Conn,
        identity: &TenantIdentity,
        invocation_id: InvocationId,
        started: Instant,
    ) -> Self {
        Self {
            pool,
            codec,
            sink,
            connection_id: conn.id(),
            conn: Some(conn),
            phase: TxPhase::Acquiring,
            tenant: TenantRef::from(identity),
            invocation_id,
            started,
            poisoned: false,
            aborted_by: None,
            committed: false,
            rollback_error: None,
            teardown_error: None,
        }
    }

    fn advance(&mut self, next: TxPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal phase change {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(
            invocation_id = %self.invocation_id,
            connection_id = self.connection_id,
            from = ?self.phase,
            to = ?next,
            "phase"
        );
        self.phase = next;
    }

    fn usable(&self) -> bool {
        !self.poisoned && self.conn.as_ref().is_some_and(|c| c.is_usable())
    }

    async fn exec(&mut self, statement: &Statement) -> Result<(), DbError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DbError::connection_lost("connection already returned"))?;
        match conn.execute(statement).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.is_connection_lost() {
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    /// BEGIN, then install the session context.
    pub(crate) async fn open(&mut self, identity: &TenantIdentity) -> Result<(), TxError> {
        if let Err(e) = self.exec(&Statement::begin()).await {
            return Err(TxError::control(TxPhase::TransactionOpen, e));
        }
        self.advance(TxPhase::TransactionOpen);

        for statement in self.codec.install(identity) {
            if let Err(e) = self.exec(&statement).await {
                let err = TxError::control(TxPhase::ContextInstalled, e);
                self.roll_back().await;
                return Err(err);
            }
        }
        self.advance(TxPhase::ContextInstalled);
        Ok(())
    }

    /// Run the unit of work, then commit, or roll back on failure or cancellation.
    pub(crate) async fn run_work<T, F, S>(
        &mut self,
        identity: &TenantIdentity,
        work: F,
        cancel: Pin<&mut S>,
    ) -> Result<T, TxError>
    where
        F: for<'t> FnOnce(TenantTx<'t, P::Conn>) -> WorkFuture<'t, T>,
        S: Future<Output = ()>,
    {
        self.advance(TxPhase::WorkRunning);

        let finished = match self.conn.as_mut() {
            Some(conn) => {
                let tx = TenantTx::new(conn, identity, &self.codec, &mut self.aborted_by);
                let work = work(tx);
                tokio::select! {
                    biased;
                    result = work => Some(result),
                    _ = cancel => None,
                }
            }
            None => {
                self.roll_back().await;
                return Err(TxError::control(
                    TxPhase::WorkRunning,
                    DbError::connection_lost("connection already returned"),
                ));
            }
        };

        match finished {
            Some(Ok(value)) => {
                self.advance(TxPhase::Committing);
                if let Some(failed) = self.aborted_by.take() {
                    // The server would turn this COMMIT into a rollback
                    warn!(
                        invocation_id = %self.invocation_id,
                        connection_id = self.connection_id,
                        "work returned Ok after a failed statement: {}", failed
                    );
                    let source = DbError {
                        kind: failed.kind,
                        message: format!(
                            "transaction aborted by an earlier failed statement: {}",
                            failed.message
                        ),
                    };
                    let err = TxError::control(TxPhase::Committing, source);
                    self.roll_back().await;
                    return Err(err);
                }
                match self.exec(&Statement::commit()).await {
                    Ok(()) => {
                        self.committed = true;
                        Ok(value)
                    }
                    Err(e) => {
                        let err = TxError::control(TxPhase::Committing, e);
                        self.roll_back().await;
                        Err(err)
                    }
                }
            }
            Some(Err(work_error)) => {
                self.roll_back().await;
                Err(TxError::WorkFailed(work_error))
            }
            None => {
                debug!(invocation_id = %self.invocation_id, "cancelled while work was running");
                self.roll_back().await;
                Err(TxError::Cancelled)
            }
        }
    }

    /// Rollback failures never replace the primary error; they poison the connection.
    async fn roll_back(&mut self) {
        self.advance(TxPhase::RollingBack);
        if !self.usable() {
            self.poisoned = true;
            return;
        }
        if let Err(e) = self.exec(&Statement::rollback()).await {
            warn!(
                invocation_id = %self.invocation_id,
                connection_id = self.connection_id,
                "rollback failed: {}", e
            );
            self.rollback_error = Some(e.to_string());
            self.poisoned = true;
        }
    }

    /// Tear the session context down, then release or discard the connection.
    pub(crate) async fn finish(&mut self) -> Option<Disposition> {
        self.advance(TxPhase::ContextTearingDown);

        let alive = self.conn.as_ref().is_some_and(|c| c.is_usable());
        if alive {
            for statement in self.codec.teardown() {
                if let Err(e) = self.exec(&statement).await {
                    if self.teardown_error.is_none() {
                        self.teardown_error = Some(TxError::ContextTeardownFailed(e).to_string());
                    }
                }
            }
        } else {
            self.poisoned = true;
        }

        self.dispose()
    }

    fn dispose(&mut self) -> Option<Disposition> {
        let conn = self.conn.take()?;
        let clean = conn.is_usable() && !self.poisoned && self.teardown_error.is_none();
        let disposition = if clean {
            self.pool.release(conn);
            Disposition::Released
        } else {
            warn!(
                invocation_id = %self.invocation_id,
                connection_id = self.connection_id,
                "connection discarded instead of released"
            );
            self.pool.discard(conn);
            Disposition::Discarded
        };
        self.advance(disposition.phase());
        Some(disposition)
    }

    pub(crate) fn phase(&self) -> TxPhase {
        self.phase
    }

    pub(crate) fn emit(&self, error: Option<&TxError>, disposition: Option<Disposition>) {
        self.sink.record_outcome(&Outcome {
            invocation_id: self.invocation_id.clone(),
            success: error.is_none(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            tenant: self.tenant.clone(),
            error_kind: error.map(TxError::kind),
            error_detail: error.map(ToString::to_string),
            rollback_error: self.rollback_error.clone(),
            teardown_error: self.teardown_error.clone(),
            connection_id: Some(self.connection_id),
            disposition,
            at: Utc::now(),
        });
    }
}

impl<P: ConnectionPool> Drop for Lease<P> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        error!(
            invocation_id = %self.invocation_id,
            connection_id = self.connection_id,
            phase = ?self.phase,
            in_transaction = self.phase.may_hold_transaction(),
            "tenant transaction abandoned while holding a connection"
        );

        let abandoned = Abandoned {
            pool: self.pool.clone(),
            codec: self.codec.clone(),
            sink: self.sink.clone(),
            conn,
            outcome: Outcome {
                invocation_id: self.invocation_id.clone(),
                success: false,
                duration_ms: 0,
                tenant: self.tenant.clone(),
                error_kind: Some(TxErrorKind::Cancelled),
                error_detail: Some(abandoned_detail(self.phase, self.committed)),
                rollback_error: self.rollback_error.clone(),
                teardown_error: None,
                connection_id: Some(self.connection_id),
                disposition: None,
                at: Utc::now(),
            },
            started: self.started,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(abandoned.clean_up());
            }
            Err(_) => abandoned.discard_now(),
        }
    }
}

/// A drop after COMMIT succeeded must not read as a lost transaction.
fn abandoned_detail(phase: TxPhase, committed: bool) -> String {
    if committed {
        format!("abandoned while {phase}; the transaction had already committed")
    } else {
        format!("abandoned while {phase}")
    }
}

/// Connection left behind by a dropped invocation.
struct Abandoned<P: ConnectionPool> {
    pool: Arc<P>,
    codec: SessionContextCodec,
    sink: Arc<dyn OutcomeSink>,
    conn: P::Conn,
    outcome: Outcome,
    started: Instant,
}

impl<P: ConnectionPool> Abandoned<P> {
    async fn clean_up(mut self) {
        // ROLLBACK outside a transaction is harmless, so always issue it
        let mut clean = self.conn.is_usable();
        if clean {
            if let Err(e) = self.conn.execute(&Statement::rollback()).await {
                self.outcome.rollback_error = Some(e.to_string());
                clean = false;
            }
        }
        if self.conn.is_usable() {
            for statement in self.codec.teardown() {
                if let Err(e) = self.conn.execute(&statement).await {
                    clean = false;
                    self.outcome
                        .teardown_error
                        .get_or_insert_with(|| TxError::ContextTeardownFailed(e).to_string());
                }
            }
        }
        clean &= self.conn.is_usable();

        let disposition = if clean {
            self.pool.release(self.conn);
            Disposition::Released
        } else {
            self.pool.discard(self.conn);
            Disposition::Discarded
        };
        self.outcome.disposition = Some(disposition);
        self.outcome.duration_ms = self.started.elapsed().as_millis() as u64;
        self.sink.record_outcome(&self.outcome);
    }

    fn discard_now(mut self) {
        self.pool.discard(self.conn);
        self.outcome.disposition = Some(Disposition::Discarded);
        self.outcome.duration_ms = self.started.elapsed().as_millis() as u64;
        self.sink.record_outcome(&self.outcome);
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryPool;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn abandon_during(phase: TxPhase, committed: bool) -> Outcome {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let pool = Arc::new(MemoryPool::new(1));
        let conn = runtime
            .block_on(pool.acquire(Duration::from_millis(50)))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let sink: Arc<dyn OutcomeSink> = Arc::new(move |o: &Outcome| recorded.lock().push(o.clone()));
        let identity = TenantIdentity::new("u1", "o1");
        let mut lease = Lease::new(
            pool.clone(),
            SessionContextCodec::default(),
            sink,
            conn,
            &identity,
            InvocationId::new(),
            Instant::now(),
        );
        lease.phase = phase;
        lease.committed = committed;

        // Outside the runtime, so the connection is discarded on the spot
        drop(lease);

        assert_eq!(pool.stats().discarded, 1);
        let mut outcomes = seen.lock();
        assert_eq!(outcomes.len(), 1);
        outcomes.remove(0)
    }

    #[test]
    fn drop_after_commit_says_the_commit_completed() {
        let outcome = abandon_during(TxPhase::ContextTearingDown, true);

        assert_eq!(outcome.error_kind, Some(TxErrorKind::Cancelled));
        assert_eq!(outcome.disposition, Some(Disposition::Discarded));
        let detail = outcome.error_detail.unwrap_or_default();
        assert!(detail.contains("already committed"), "{detail}");
    }

    #[test]
    fn drop_before_commit_does_not_claim_one() {
        let outcome = abandon_during(TxPhase::WorkRunning, false);

        let detail = outcome.error_detail.unwrap_or_default();
        assert_eq!(detail, "abandoned while running work");
    }
}
