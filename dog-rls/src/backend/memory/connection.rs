use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

use super::journal::{FaultMode, JournalEvent, Shared, StatementClass};
use crate::{
    backend::PooledConnection,
    error::DbError,
    statement::{Row, Rows, SqlValue, Statement},
};

/// In-process stand-in for one Postgres session.
///
/// Models just enough server behaviour to observe tenant leakage:
/// session-level settings survive transactions, `set_config(.., true)`
/// settings die at COMMIT/ROLLBACK, `RESET` clears both. A statement that
/// fails inside a transaction aborts it: everything but ROLLBACK,
/// `ROLLBACK TO SAVEPOINT` or COMMIT is refused, and COMMIT rolls back.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    alive: bool,
    in_transaction: bool,
    aborted: bool,
    session: HashMap<String, String>,
    local: HashMap<String, String>,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl MemoryConnection {
    pub(crate) fn open(id: u64, shared: Arc<Shared>) -> Self {
        shared.record(id, JournalEvent::Opened);
        Self {
            id,
            shared,
            alive: true,
            in_transaction: false,
            aborted: false,
            session: HashMap::new(),
            local: HashMap::new(),
            permit: None,
        }
    }

    /// Value a `current_setting` call would see right now.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.local
            .get(key)
            .or_else(|| self.session.get(key))
            .map(String::as_str)
    }

    /// Every setting visible on this connection, local overriding session.
    pub fn visible_settings(&self) -> HashMap<String, String> {
        let mut all = self.session.clone();
        all.extend(self.local.clone());
        all
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// True once a statement failed inside the open transaction.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn refused_while_aborted(&self, stmt: &Statement, class: StatementClass) -> bool {
        self.aborted
            && !matches!(class, StatementClass::Commit | StatementClass::Rollback)
            && !stmt.rolls_back_to_savepoint()
    }

    fn apply(&mut self, stmt: &Statement, class: StatementClass) -> Result<Rows, DbError> {
        match class {
            StatementClass::Begin => {
                self.in_transaction = true;
                Ok(Rows::empty())
            }
            StatementClass::Commit | StatementClass::Rollback => {
                self.in_transaction = false;
                self.aborted = false;
                self.local.clear();
                Ok(Rows::empty())
            }
            StatementClass::SetConfig => self.set_config(stmt),
            StatementClass::Reset => {
                let key = stmt
                    .text
                    .split_whitespace()
                    .nth(1)
                    .map(|k| k.trim_end_matches(';'))
                    .ok_or_else(|| DbError::statement("syntax error at end of input"))?;
                if key.eq_ignore_ascii_case("ALL") {
                    self.session.clear();
                    self.local.clear();
                } else {
                    self.session.remove(key);
                    self.local.remove(key);
                }
                Ok(Rows::empty())
            }
            StatementClass::Other => self.run_other(stmt),
        }
    }

    fn set_config(&mut self, stmt: &Statement) -> Result<Rows, DbError> {
        let text_param = |idx: usize| {
            stmt.params
                .get(idx)
                .and_then(SqlValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| DbError::statement(format!("set_config: missing text parameter ${}", idx + 1)))
        };
        let key = text_param(0)?;
        let value = text_param(1)?;
        let is_local = match stmt.params.get(2) {
            Some(v) => v.as_bool().unwrap_or(false),
            None => stmt.text.to_ascii_lowercase().contains("true)"),
        };

        if is_local {
            // outside a transaction block a local setting has no effect
            if self.in_transaction {
                self.local.insert(key, value.clone());
            }
        } else {
            self.session.insert(key, value.clone());
        }
        Ok(Rows::single(SqlValue::Text(value)))
    }

    fn run_other(&mut self, stmt: &Statement) -> Result<Rows, DbError> {
        let lowered = stmt.text.to_ascii_lowercase();
        if lowered.contains("current_setting(") {
            let key = stmt
                .params
                .first()
                .and_then(SqlValue::as_str)
                .ok_or_else(|| DbError::statement("current_setting: missing key parameter"))?;
            let value = self
                .setting(key)
                .map(|v| SqlValue::Text(v.to_string()))
                .unwrap_or(SqlValue::Null);
            return Ok(Rows::single(value));
        }

        match stmt.verb().as_str() {
            "INSERT" if lowered.contains("returning") => Ok(Rows {
                rows_affected: 1,
                rows: vec![Row(vec![SqlValue::Int(self.shared.next_row_id())])],
            }),
            "INSERT" | "UPDATE" | "DELETE" => Ok(Rows::affected(1)),
            "ROLLBACK" if stmt.rolls_back_to_savepoint() => {
                self.aborted = false;
                Ok(Rows::empty())
            }
            "" => Err(DbError::statement("empty statement")),
            _ => Ok(Rows::empty()),
        }
    }
}

#[async_trait]
impl PooledConnection for MemoryConnection {
    async fn execute(&mut self, statement: &Statement) -> Result<Rows, DbError> {
        if !self.alive {
            return Err(DbError::connection_lost("connection is closed"));
        }
        let class = StatementClass::of(statement);

        let result = match self.shared.take_fault(class) {
            Some((FaultMode::Error, message)) => Err(DbError::statement(message)),
            Some((FaultMode::KillConnection, message)) => {
                self.alive = false;
                self.in_transaction = false;
                Err(DbError::connection_lost(message))
            }
            None if self.refused_while_aborted(statement, class) => Err(DbError::statement(
                "current transaction is aborted, commands ignored until end of transaction block",
            )),
            None => self.apply(statement, class),
        };
        let ends_transaction = matches!(class, StatementClass::Commit | StatementClass::Rollback);
        if result.is_err() && self.in_transaction && !ends_transaction {
            self.aborted = true;
        }

        self.shared.record(
            self.id,
            JournalEvent::Executed {
                statement: statement.clone(),
                class,
                ok: result.is_ok(),
            },
        );
        result
    }

    fn is_usable(&self) -> bool {
        self.alive
    }

    fn id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::journal::Fault;

    fn conn() -> MemoryConnection {
        MemoryConnection::open(1, Arc::new(Shared::default()))
    }

    #[tokio::test]
    async fn local_settings_end_with_the_transaction() {
        let mut conn = conn();
        let set = Statement::new("SELECT set_config($1, $2, true)")
            .bind("app.current_user_id")
            .bind("u1");

        conn.execute(&Statement::begin()).await.unwrap();
        conn.execute(&set).await.unwrap();
        assert_eq!(conn.setting("app.current_user_id"), Some("u1"));

        conn.execute(&Statement::commit()).await.unwrap();
        assert_eq!(conn.setting("app.current_user_id"), None);
    }

    #[tokio::test]
    async fn session_settings_survive_until_reset() {
        let mut conn = conn();
        let set = Statement::new("SELECT set_config($1, $2, false)")
            .bind("app.current_user_id")
            .bind("u1");

        conn.execute(&set).await.unwrap();
        conn.execute(&Statement::begin()).await.unwrap();
        conn.execute(&Statement::rollback()).await.unwrap();
        assert_eq!(conn.setting("app.current_user_id"), Some("u1"));

        conn.execute(&Statement::new("RESET app.current_user_id")).await.unwrap();
        assert!(conn.visible_settings().is_empty());
    }

    #[tokio::test]
    async fn killed_connection_refuses_everything() {
        let mut conn = conn();
        conn.shared.inject(Fault::kill(StatementClass::Begin));

        let err = conn.execute(&Statement::begin()).await.unwrap_err();
        assert!(err.is_connection_lost());
        assert!(!conn.is_usable());
        assert!(conn.execute(&Statement::new("SELECT 1")).await.is_err());
    }

    #[tokio::test]
    async fn failed_statement_aborts_the_transaction() {
        let mut conn = conn();
        let set = Statement::new("SELECT set_config($1, $2, true)")
            .bind("app.current_user_id")
            .bind("u1");
        conn.execute(&Statement::begin()).await.unwrap();
        conn.execute(&set).await.unwrap();
        conn.shared.inject(Fault::error(StatementClass::Other));

        assert!(conn.execute(&Statement::new("INSERT INTO notes VALUES (1)")).await.is_err());
        assert!(conn.is_aborted());
        let err = conn.execute(&Statement::new("SELECT 1")).await.unwrap_err();
        assert!(err.message.contains("current transaction is aborted"));

        // COMMIT on an aborted transaction only ends it
        conn.execute(&Statement::commit()).await.unwrap();
        assert!(!conn.is_aborted());
        assert!(!conn.in_transaction());
        assert_eq!(conn.setting("app.current_user_id"), None);
        conn.execute(&Statement::new("SELECT 1")).await.unwrap();
    }

    #[tokio::test]
    async fn rollback_to_savepoint_recovers_an_aborted_transaction() {
        let mut conn = conn();
        conn.execute(&Statement::begin()).await.unwrap();
        conn.execute(&Statement::new("SAVEPOINT sp1")).await.unwrap();
        conn.shared.inject(Fault::error(StatementClass::Other));
        assert!(conn.execute(&Statement::new("UPDATE notes SET body = ''")).await.is_err());

        conn.execute(&Statement::new("ROLLBACK TO SAVEPOINT sp1")).await.unwrap();

        assert!(!conn.is_aborted());
        assert!(conn.in_transaction());
        conn.execute(&Statement::new("SELECT 1")).await.unwrap();
    }

    #[tokio::test]
    async fn failures_outside_a_transaction_do_not_stick() {
        let mut conn = conn();
        assert!(conn.execute(&Statement::new("")).await.is_err());
        assert!(!conn.is_aborted());
        conn.execute(&Statement::new("SELECT 1")).await.unwrap();
    }

    #[tokio::test]
    async fn current_setting_reads_visible_value() {
        let mut conn = conn();
        let read = Statement::new("SELECT current_setting($1, true)").bind("app.current_user_id");

        let rows = conn.execute(&read).await.unwrap();
        assert_eq!(rows.scalar(), Some(&SqlValue::Null));
    }
}
