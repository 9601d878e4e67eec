use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use super::connection::MemoryConnection;
use super::journal::{Fault, JournalEntry, JournalEvent, Shared};
use crate::{
    backend::{ConnectionPool, PooledConnection},
    config::PoolConfig,
    error::PoolError,
};

/// Counters for asserting the always-release property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub opened: u64,
    pub acquired: u64,
    pub released: u64,
    pub discarded: u64,
    pub idle: usize,
}

impl PoolStats {
    /// Connections lent out and not yet returned or discarded.
    pub fn outstanding(&self) -> u64 {
        self.acquired
            .saturating_sub(self.released)
            .saturating_sub(self.discarded)
    }
}

/// Bounded in-memory pool for testing and development.
///
/// Idle connections are reused last-in first-out, so back-to-back
/// invocations land on the same physical connection.
pub struct MemoryPool {
    shared: Arc<Shared>,
    idle: Mutex<Vec<MemoryConnection>>,
    permits: Arc<Semaphore>,
    max_connections: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

impl MemoryPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.max_connections)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Script a failure for upcoming statements on any connection.
    pub fn inject(&self, fault: Fault) {
        self.shared.inject(fault);
    }

    pub fn clear_faults(&self) {
        self.shared.clear_faults();
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.shared.journal()
    }

    pub fn clear_journal(&self) {
        self.shared.clear_journal();
    }

    /// Returns are read before acquisitions, so a snapshot taken while other
    /// tasks hand connections back never counts more returns than loans.
    pub fn stats(&self) -> PoolStats {
        let released = self.released.load(Ordering::SeqCst);
        let discarded = self.discarded.load(Ordering::SeqCst);
        PoolStats {
            opened: self.next_id.load(Ordering::SeqCst) - 1,
            acquired: self.acquired.load(Ordering::SeqCst),
            released,
            discarded,
            idle: self.idle.lock().len(),
        }
    }

    /// Settings still visible on each idle connection, keyed by connection id.
    pub fn idle_settings(&self) -> Vec<(u64, HashMap<String, String>)> {
        self.idle
            .lock()
            .iter()
            .map(|c| (c.id(), c.visible_settings()))
            .collect()
    }

    /// Stop handing out connections and drop the idle ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        self.idle.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn open(&self) -> MemoryConnection {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(connection_id = id, "opening in-memory connection");
        MemoryConnection::open(id, self.shared.clone())
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new(PoolConfig::default().max_connections)
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    type Conn = MemoryConnection;

    async fn acquire(&self, timeout: Duration) -> Result<MemoryConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let permit = match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Err(_) => return Err(PoolError::Exhausted { timeout }),
            Ok(Err(_)) => return Err(PoolError::Closed),
            Ok(Ok(permit)) => permit,
        };

        let reused = self.idle.lock().pop();
        let mut conn = match reused {
            Some(conn) => conn,
            None => self.open(),
        };
        conn.permit = Some(permit);

        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.shared.record(conn.id(), JournalEvent::Acquired);
        Ok(conn)
    }

    fn release(&self, mut conn: MemoryConnection) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.shared.record(conn.id(), JournalEvent::Released);

        // free the slot only once the connection is back in the idle list
        let permit = conn.permit.take();
        if !self.is_closed() {
            self.idle.lock().push(conn);
        }
        drop(permit);
    }

    fn discard(&self, conn: MemoryConnection) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
        self.shared.record(conn.id(), JournalEvent::Discarded);
        debug!(connection_id = conn.id(), "discarding in-memory connection");
        drop(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::Statement;

    #[test]
    fn outstanding_never_underflows() {
        let racing = PoolStats {
            acquired: 1,
            released: 1,
            discarded: 1,
            ..PoolStats::default()
        };
        assert_eq!(racing.outstanding(), 0);

        let lent = PoolStats {
            acquired: 5,
            released: 2,
            discarded: 1,
            ..PoolStats::default()
        };
        assert_eq!(lent.outstanding(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stats_stay_consistent_under_concurrent_returns() {
        let pool = Arc::new(MemoryPool::new(4));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let conn = pool.acquire(Duration::from_millis(200)).await.unwrap();
                        pool.release(conn);
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let stats = pool.stats();
            assert!(stats.released + stats.discarded <= stats.acquired, "{stats:?}");
            tokio::task::yield_now().await;
        }
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let pool = MemoryPool::new(2);

        let first = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let id = first.id();
        pool.release(first);
        let second = pool.acquire(Duration::from_millis(50)).await.unwrap();

        assert_eq!(second.id(), id);
        assert_eq!(pool.stats().opened, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_all_connections_are_lent() {
        let pool = MemoryPool::new(1);
        let _held = pool.acquire(Duration::from_millis(50)).await.unwrap();

        let err = pool.acquire(Duration::from_millis(20)).await.unwrap_err();

        assert!(matches!(err, PoolError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn discarded_connections_are_replaced() {
        let pool = MemoryPool::new(1);
        let mut conn = pool.acquire(Duration::from_millis(50)).await.unwrap();
        conn.execute(&Statement::new("SELECT set_config($1, $2, false)").bind("app.k").bind("v"))
            .await
            .unwrap();
        let id = conn.id();
        pool.discard(conn);

        let fresh = pool.acquire(Duration::from_millis(50)).await.unwrap();

        assert_ne!(fresh.id(), id);
        assert!(fresh.visible_settings().is_empty());
        let stats = pool.stats();
        assert_eq!((stats.acquired, stats.discarded, stats.outstanding()), (2, 1, 1));
    }

    #[tokio::test]
    async fn closed_pool_refuses_acquire() {
        let pool = MemoryPool::new(1);
        pool.close();
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)).await,
            Err(PoolError::Closed)
        ));
    }
}
