//! In-memory backend.
//!
//! A bounded pool of simulated Postgres sessions with a shared journal of
//! every statement and pool event, plus scripted faults. Used by the test
//! suite and for running services without a database.

pub mod connection;
pub mod journal;
pub mod pool;

pub use connection::MemoryConnection;
pub use journal::{Fault, FaultMode, JournalEntry, JournalEvent, StatementClass};
pub use pool::{MemoryPool, PoolStats};
