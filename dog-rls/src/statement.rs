use serde::{Deserialize, Serialize};
use std::fmt;

/// A value bound to a statement parameter (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Statement text plus its bound parameters.
///
/// Values never get spliced into `text`; drivers send them out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub text: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    /// Append the next positional parameter.
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn begin() -> Self {
        Self::new("BEGIN")
    }

    pub fn commit() -> Self {
        Self::new("COMMIT")
    }

    pub fn rollback() -> Self {
        Self::new("ROLLBACK")
    }

    /// Leading keyword, uppercased. Empty for blank statements.
    pub fn verb(&self) -> String {
        self.text
            .split_whitespace()
            .next()
            .map(|w| w.trim_end_matches(';').to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// `ROLLBACK TO [SAVEPOINT] name`, which recovers a failed transaction.
    pub fn rolls_back_to_savepoint(&self) -> bool {
        let mut words = self.text.split_whitespace().map(|w| w.to_ascii_uppercase());
        words.next().as_deref() == Some("ROLLBACK")
            && matches!(words.next().as_deref(), Some("TO") | Some("SAVEPOINT"))
    }

    /// True for statements that open or end the surrounding transaction.
    /// Savepoints don't count.
    pub fn is_transaction_control(&self) -> bool {
        let mut words = self.text.split_whitespace().map(|w| {
            w.trim_end_matches(';').to_ascii_uppercase()
        });
        match words.next().as_deref() {
            Some("BEGIN") | Some("COMMIT") | Some("END") | Some("ABORT") => true,
            Some("START") => words.next().as_deref() == Some("TRANSACTION"),
            Some("ROLLBACK") => !matches!(
                words.next().as_deref(),
                Some("TO") | Some("SAVEPOINT")
            ),
            _ => false,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} params]", self.text, self.params.len())
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.0.get(idx)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a statement returned.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rows {
    pub rows_affected: u64,
    pub rows: Vec<Row>,
}

impl Rows {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            rows: Vec::new(),
        }
    }

    pub fn single(value: SqlValue) -> Self {
        Self {
            rows_affected: 1,
            rows: vec![Row(vec![value])],
        }
    }

    /// First column of the first row.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|r| r.get(0))
    }
}
