//! Postgres backend on top of a sqlx `PgPool`.
//!
//! Transaction control goes through plain `BEGIN`/`COMMIT`/`ROLLBACK`
//! statements on a pooled connection so the manager, not sqlx, owns the
//! transaction boundaries. Discarded connections are detached from the
//! pool and closed.

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Either, Executor, PgPool, Postgres, Row as _, TypeInfo, ValueRef};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    backend::{ConnectionPool, PooledConnection},
    config::PoolConfig,
    error::{DbError, PoolError},
    statement::{Row, Rows, SqlValue, Statement},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Pool handle built at process start and closed at shutdown.
#[derive(Clone)]
pub struct PgTenantPool {
    pool: PgPool,
}

impl PgTenantPool {
    /// Connect using [`PoolConfig`]; the URL is required.
    pub async fn connect(config: &PoolConfig) -> Result<Self, PoolError> {
        let url = config
            .require_url()
            .map_err(|e| PoolError::Connect(DbError::rejected(e.to_string())))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections as u32)
            .min_connections(config.min_connections as u32)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(url)
            .await
            .map_err(|e| PoolError::Connect(map_sqlx_error(e)))?;
        info!(
            max_connections = config.max_connections,
            "connected tenant pool"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    /// Wait for lent connections to come back, then close them all.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("tenant pool closed");
    }
}

pub struct PgPooledConnection {
    id: u64,
    conn: PoolConnection<Postgres>,
    broken: bool,
}

#[async_trait]
impl ConnectionPool for PgTenantPool {
    type Conn = PgPooledConnection;

    async fn acquire(&self, timeout: Duration) -> Result<PgPooledConnection, PoolError> {
        let conn = match tokio::time::timeout(timeout, self.pool.acquire()).await {
            Err(_) | Ok(Err(sqlx::Error::PoolTimedOut)) => {
                return Err(PoolError::Exhausted { timeout })
            }
            Ok(Err(sqlx::Error::PoolClosed)) => return Err(PoolError::Closed),
            Ok(Err(e)) => return Err(PoolError::Connect(map_sqlx_error(e))),
            Ok(Ok(conn)) => conn,
        };
        Ok(PgPooledConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            conn,
            broken: false,
        })
    }

    fn release(&self, conn: PgPooledConnection) {
        debug!(connection_id = conn.id, "releasing connection");
        drop(conn.conn);
    }

    fn discard(&self, conn: PgPooledConnection) {
        warn!(connection_id = conn.id, "discarding connection");
        let raw = conn.conn.detach();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = raw.close().await {
                        debug!("closing discarded connection failed: {}", e);
                    }
                });
            }
            // dropping closes the socket without the terminate message
            Err(_) => drop(raw),
        }
    }
}

#[async_trait]
impl PooledConnection for PgPooledConnection {
    async fn execute(&mut self, statement: &Statement) -> Result<Rows, DbError> {
        if self.broken {
            return Err(DbError::connection_lost("connection previously failed"));
        }
        let query = bind_params(sqlx::query(&statement.text), &statement.params);

        let mut out = Rows::empty();
        let mut stream = (&mut *self.conn).fetch_many(query);
        loop {
            match stream.try_next().await {
                Ok(Some(Either::Left(done))) => out.rows_affected += done.rows_affected(),
                Ok(Some(Either::Right(row))) => out.rows.push(decode_row(&row)?),
                Ok(None) => break,
                Err(e) => {
                    let err = map_sqlx_error(e);
                    if err.is_connection_lost() {
                        self.broken = true;
                    }
                    return Err(err);
                }
            }
        }
        Ok(out)
    }

    fn is_usable(&self) -> bool {
        !self.broken
    }

    fn id(&self) -> u64 {
        self.id
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, DbError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx).map_err(map_sqlx_error)?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let value = match column.type_info().name() {
            "BOOL" => SqlValue::Bool(row.try_get(idx).map_err(map_sqlx_error)?),
            "INT2" => SqlValue::Int(row.try_get::<i16, _>(idx).map_err(map_sqlx_error)? as i64),
            "INT4" => SqlValue::Int(row.try_get::<i32, _>(idx).map_err(map_sqlx_error)? as i64),
            "INT8" => SqlValue::Int(row.try_get(idx).map_err(map_sqlx_error)?),
            "FLOAT4" => SqlValue::Float(row.try_get::<f32, _>(idx).map_err(map_sqlx_error)? as f64),
            "FLOAT8" => SqlValue::Float(row.try_get(idx).map_err(map_sqlx_error)?),
            "UUID" => SqlValue::Text(
                row.try_get::<uuid::Uuid, _>(idx)
                    .map_err(map_sqlx_error)?
                    .to_string(),
            ),
            _ => SqlValue::Text(row.try_get::<String, _>(idx).map_err(map_sqlx_error)?),
        };
        values.push(value);
    }
    Ok(Row(values))
}

fn map_sqlx_error(err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::PoolClosed => DbError::connection_lost(err.to_string()),
        other => DbError::statement(other.to_string()),
    }
}
