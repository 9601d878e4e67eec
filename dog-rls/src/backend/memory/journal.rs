use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::statement::Statement;

/// Coarse statement classes, used for fault matching and journal queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementClass {
    Begin,
    Commit,
    Rollback,
    SetConfig,
    Reset,
    Other,
}

impl StatementClass {
    pub fn of(stmt: &Statement) -> Self {
        match stmt.verb().as_str() {
            "BEGIN" => StatementClass::Begin,
            "START" if stmt.is_transaction_control() => StatementClass::Begin,
            "COMMIT" | "END" => StatementClass::Commit,
            "ROLLBACK" | "ABORT" if stmt.is_transaction_control() => StatementClass::Rollback,
            "RESET" => StatementClass::Reset,
            _ if stmt.text.to_ascii_lowercase().contains("set_config(") => StatementClass::SetConfig,
            _ => StatementClass::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Statement fails, connection stays healthy.
    Error,
    /// Statement fails and the connection dies with it.
    KillConnection,
}

/// A scripted failure for the next matching statement(s).
#[derive(Debug, Clone)]
pub struct Fault {
    pub class: StatementClass,
    pub mode: FaultMode,
    /// `None` means every match fails.
    pub remaining: Option<usize>,
    pub message: String,
}

impl Fault {
    pub fn error(class: StatementClass) -> Self {
        Self {
            class,
            mode: FaultMode::Error,
            remaining: Some(1),
            message: format!("injected {:?} failure", class),
        }
    }

    pub fn kill(class: StatementClass) -> Self {
        Self {
            mode: FaultMode::KillConnection,
            message: format!("connection dropped during {:?}", class),
            ..Self::error(class)
        }
    }

    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    pub fn always(mut self) -> Self {
        self.remaining = None;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JournalEvent {
    Opened,
    Acquired,
    Executed {
        statement: Statement,
        class: StatementClass,
        ok: bool,
    },
    Released,
    Discarded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub seq: u64,
    pub connection_id: u64,
    pub event: JournalEvent,
}

impl JournalEntry {
    pub fn class(&self) -> Option<StatementClass> {
        match &self.event {
            JournalEvent::Executed { class, .. } => Some(*class),
            _ => None,
        }
    }
}

/// State shared by a pool and every connection it opened.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    seq: AtomicU64,
    next_row_id: AtomicI64,
    journal: Mutex<Vec<JournalEntry>>,
    faults: Mutex<Vec<Fault>>,
}

impl Shared {
    pub(crate) fn record(&self, connection_id: u64, event: JournalEvent) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.journal.lock().push(JournalEntry {
            seq,
            connection_id,
            event,
        });
    }

    pub(crate) fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    pub(crate) fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    pub(crate) fn inject(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub(crate) fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Consume one hit of the first fault matching `class`.
    pub(crate) fn take_fault(&self, class: StatementClass) -> Option<(FaultMode, String)> {
        let mut faults = self.faults.lock();
        let idx = faults.iter().position(|f| f.class == class)?;
        let hit = (faults[idx].mode, faults[idx].message.clone());
        let exhausted = match faults[idx].remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            faults.remove(idx);
        }
        Some(hit)
    }

    pub(crate) fn next_row_id(&self) -> i64 {
        self.next_row_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_control_and_context_statements() {
        let cases = [
            ("BEGIN", StatementClass::Begin),
            ("start transaction", StatementClass::Begin),
            ("COMMIT", StatementClass::Commit),
            ("ROLLBACK", StatementClass::Rollback),
            ("ROLLBACK TO SAVEPOINT a", StatementClass::Other),
            ("SELECT set_config($1, $2, true)", StatementClass::SetConfig),
            ("RESET app.current_user_id", StatementClass::Reset),
            ("INSERT INTO t VALUES (1)", StatementClass::Other),
        ];
        for (text, class) in cases {
            assert_eq!(StatementClass::of(&Statement::new(text)), class, "{text}");
        }
    }

    #[test]
    fn limited_faults_expire() {
        let shared = Shared::default();
        shared.inject(Fault::error(StatementClass::Reset).times(2));

        assert!(shared.take_fault(StatementClass::Reset).is_some());
        assert!(shared.take_fault(StatementClass::Commit).is_none());
        assert!(shared.take_fault(StatementClass::Reset).is_some());
        assert!(shared.take_fault(StatementClass::Reset).is_none());
    }
}
