#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use std::time::Duration;

use crate::{
    error::{DbError, PoolError},
    statement::{Rows, Statement},
};

/// One physical database link, owned by the pool and lent out per invocation.
#[async_trait]
pub trait PooledConnection: Send + 'static {
    /// Execute one statement with its bound parameters.
    async fn execute(&mut self, statement: &Statement) -> Result<Rows, DbError>;

    /// False once the link is known to be dead or in an unknown protocol state.
    fn is_usable(&self) -> bool;

    /// Stable id for logs; not used for any tenant affinity.
    fn id(&self) -> u64;
}

/// Pool primitives the transaction manager relies on.
///
/// Pools are built once at process start, shared behind an `Arc`, and closed
/// at shutdown. `release` and `discard` are synchronous so they can run from
/// drop guards.
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    type Conn: PooledConnection;

    /// Wait up to `timeout` for a connection.
    async fn acquire(&self, timeout: Duration) -> Result<Self::Conn, PoolError>;

    /// Hand a healthy connection back for reuse.
    fn release(&self, conn: Self::Conn);

    /// Remove a connection from rotation; its state can no longer be trusted.
    fn discard(&self, conn: Self::Conn);
}
