use dog_core::TenantIdentity;
use futures::future::BoxFuture;

use crate::{
    backend::PooledConnection,
    error::{DbError, DbErrorKind},
    session::SessionContextCodec,
    statement::{Rows, Statement},
};

/// Future returned by a unit of work; borrows the handle for `'t` only.
pub type WorkFuture<'t, T> = BoxFuture<'t, anyhow::Result<T>>;

/// Transaction-scoped handle given to a unit of work.
///
/// Borrows the connection for the duration of the work and cannot escape
/// it. Statements that would end the transaction or touch the session
/// context are refused before they reach the database.
///
/// A statement that fails on the server leaves the transaction aborted
/// until the work rolls back to a savepoint. The failure is remembered
/// even if the work swallows the error, and the invocation then rolls
/// back instead of committing.
pub struct TenantTx<'t, C: PooledConnection> {
    conn: &'t mut C,
    identity: &'t TenantIdentity,
    codec: &'t SessionContextCodec,
    aborted_by: &'t mut Option<DbError>,
}

impl<'t, C: PooledConnection> TenantTx<'t, C> {
    pub(crate) fn new(
        conn: &'t mut C,
        identity: &'t TenantIdentity,
        codec: &'t SessionContextCodec,
        aborted_by: &'t mut Option<DbError>,
    ) -> Self {
        Self {
            conn,
            identity,
            codec,
            aborted_by,
        }
    }

    /// The identity every statement on this handle runs as.
    pub fn identity(&self) -> &TenantIdentity {
        self.identity
    }

    pub async fn execute(&mut self, statement: &Statement) -> Result<Rows, DbError> {
        if statement.is_transaction_control() {
            return Err(DbError::rejected(format!(
                "{} is managed by the tenant transaction",
                statement.verb()
            )));
        }
        if self.codec.touches_context(statement) {
            return Err(DbError::rejected(
                "session context is managed by the tenant transaction",
            ));
        }
        let result = self.conn.execute(statement).await;
        match &result {
            Ok(_) if statement.rolls_back_to_savepoint() => *self.aborted_by = None,
            Ok(_) => {}
            Err(e) if e.kind != DbErrorKind::Rejected => {
                self.aborted_by.get_or_insert_with(|| e.clone());
            }
            Err(_) => {}
        }
        result
    }
}
