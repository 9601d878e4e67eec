use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-invocation state machine.
///
/// ```text
/// Idle -> Acquiring -> TransactionOpen -> ContextInstalled -> WorkRunning
///      -> (Committing | RollingBack) -> ContextTearingDown -> (Released | Discarded)
/// ```
///
/// Any phase from `Acquiring` onward may jump to `RollingBack` or
/// `ContextTearingDown` on failure; every path ends in a terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxPhase {
    Idle,
    Acquiring,
    TransactionOpen,
    ContextInstalled,
    WorkRunning,
    Committing,
    RollingBack,
    ContextTearingDown,
    Released,
    Discarded,
}

impl TxPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxPhase::Released | TxPhase::Discarded)
    }

    /// Whether a transaction may still be open on the connection.
    pub fn may_hold_transaction(&self) -> bool {
        matches!(
            self,
            TxPhase::TransactionOpen
                | TxPhase::ContextInstalled
                | TxPhase::WorkRunning
                | TxPhase::Committing
                | TxPhase::RollingBack
        )
    }

    /// Legal forward moves. Failure edges are included.
    pub fn can_advance_to(&self, next: TxPhase) -> bool {
        use TxPhase::*;
        match (self, next) {
            (Idle, Acquiring) => true,
            (Acquiring, TransactionOpen) => true,
            (Acquiring, ContextTearingDown) => true,
            (TransactionOpen, ContextInstalled) => true,
            (TransactionOpen, RollingBack) => true,
            (ContextInstalled, WorkRunning) => true,
            (WorkRunning, Committing) | (WorkRunning, RollingBack) => true,
            (Committing, RollingBack) => true,
            (Committing, ContextTearingDown) | (RollingBack, ContextTearingDown) => true,
            (ContextTearingDown, Released) | (ContextTearingDown, Discarded) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxPhase::Idle => "idle",
            TxPhase::Acquiring => "acquiring",
            TxPhase::TransactionOpen => "opening transaction",
            TxPhase::ContextInstalled => "installing context",
            TxPhase::WorkRunning => "running work",
            TxPhase::Committing => "committing",
            TxPhase::RollingBack => "rolling back",
            TxPhase::ContextTearingDown => "tearing down context",
            TxPhase::Released => "released",
            TxPhase::Discarded => "discarded",
        }
    }
}

impl fmt::Display for TxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the borrowed connection at the end of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    Released,
    Discarded,
}

impl Disposition {
    pub fn phase(&self) -> TxPhase {
        match self {
            Disposition::Released => TxPhase::Released,
            Disposition::Discarded => TxPhase::Discarded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Released => "released",
            Disposition::Discarded => "discarded",
        }
    }
}
