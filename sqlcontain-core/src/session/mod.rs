//! Driver-neutral database session abstraction.
//!
//! The hardening engine only ever talks to a [`SqlSession`]. The tiberius
//! backend lives in [`mssql`]; integration tests provide an in-memory fake.

use std::fmt;

use async_trait::async_trait;

use crate::error::{ContainError, SqlError};

#[cfg(feature = "mssql")]
pub mod mssql;

#[cfg(feature = "mssql")]
pub use mssql::{TiberiusConnector, TiberiusSession};

/// Positional statement parameter, referenced as `@P1..@Pn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// Any integer column
    Int(i64),
    /// `bit` column
    Bool(bool),
    /// Any character column
    Text(String),
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Int(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", u8::from(*v)),
            Self::Text(v) => write!(f, "N'{}'", v.replace('\'', "''")),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Conversion from a scalar result. NULL and "no row" map to `Default`.
pub trait FromSqlValue: Sized + Default {
    /// Converts a scalar result to `Self`.
    ///
    /// # Errors
    /// Returns [`ContainError::Conversion`] when the value has an incompatible type.
    fn from_sql_value(value: Option<SqlValue>) -> crate::Result<Self>;
}

fn conversion(expected: &str, actual: &SqlValue) -> ContainError {
    ContainError::Conversion {
        context: format!("expected {}, got {:?}", expected, actual),
    }
}

impl FromSqlValue for i64 {
    fn from_sql_value(value: Option<SqlValue>) -> crate::Result<Self> {
        match value {
            None | Some(SqlValue::Null) => Ok(0),
            Some(SqlValue::Int(v)) => Ok(v),
            Some(SqlValue::Bool(v)) => Ok(i64::from(v)),
            Some(SqlValue::Text(s)) => s
                .trim()
                .parse()
                .map_err(|_| conversion("integer", &SqlValue::Text(s.clone()))),
        }
    }
}

impl FromSqlValue for i32 {
    fn from_sql_value(value: Option<SqlValue>) -> crate::Result<Self> {
        let wide = i64::from_sql_value(value)?;
        i32::try_from(wide).map_err(|_| conversion("32-bit integer", &SqlValue::Int(wide)))
    }
}

impl FromSqlValue for bool {
    fn from_sql_value(value: Option<SqlValue>) -> crate::Result<Self> {
        match value {
            None | Some(SqlValue::Null) => Ok(false),
            Some(SqlValue::Bool(v)) => Ok(v),
            Some(SqlValue::Int(v)) => Ok(v != 0),
            Some(other) => Err(conversion("bit", &other)),
        }
    }
}

impl FromSqlValue for String {
    fn from_sql_value(value: Option<SqlValue>) -> crate::Result<Self> {
        match value {
            None | Some(SqlValue::Null) => Ok(String::new()),
            Some(SqlValue::Text(v)) => Ok(v),
            Some(SqlValue::Int(v)) => Ok(v.to_string()),
            Some(SqlValue::Bool(v)) => Ok(u8::from(v).to_string()),
        }
    }
}

/// An open connection exclusively owned by one hardening run.
#[async_trait]
pub trait SqlSession: Send {
    /// Executes a batch, draining every result it produces.
    ///
    /// Parameterless batches are sent verbatim so session state such as an
    /// open transaction carries over to the next call.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<(), SqlError>;

    /// Runs a query and returns the first column of the first row, or `None`
    /// when there are no rows.
    async fn query_scalar(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlValue>, SqlError>;

    /// The database the live connection reports as current.
    fn database(&self) -> Option<&str>;

    /// The catalog the connection was configured with.
    fn connection_catalog(&self) -> Option<&str>;
}

/// Opens privileged sessions against a catalog of the configured server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new session whose initial catalog is `catalog`.
    ///
    /// # Errors
    /// Returns [`ContainError::Connection`] with credentials removed.
    async fn connect(&self, catalog: &str) -> crate::Result<Box<dyn SqlSession>>;
}
