//! Error taxonomy for the containment engine.
//!
//! Every failure the engine can surface is a typed variant. Diagnostic data
//! that callers need (the offending SQL, the skipped DENY list, trigger
//! verification state) travels as fields rather than as free-form text, and
//! credentials never appear in any message.

use std::fmt;

use thiserror::Error;

/// Server-side error returned by a [`SqlSession`](crate::session::SqlSession).
///
/// Driver neutral: the tiberius session maps token errors onto this, the
/// test fakes construct it directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SqlError {
    /// Server error number, when the failure came from the server
    pub number: Option<u32>,
    /// Server or transport message
    pub message: String,
}

/// SQL Server error number for "Incorrect syntax near ...".
pub const INCORRECT_SYNTAX_ERROR: u32 = 102;

impl SqlError {
    /// Creates a server error with a number.
    pub fn server(number: u32, message: impl Into<String>) -> Self {
        Self {
            number: Some(number),
            message: message.into(),
        }
    }

    /// Creates a transport or client-side error without a server number.
    pub fn client(message: impl Into<String>) -> Self {
        Self {
            number: None,
            message: message.into(),
        }
    }

    /// Returns true when the error looks like the edition does not recognise
    /// the statement syntax at all.
    ///
    /// Error 102 or an "Incorrect syntax near" message. A genuine syntax
    /// regression in a statement is classified the same way.
    pub fn is_unsupported_syntax(&self) -> bool {
        self.number == Some(INCORRECT_SYNTAX_ERROR)
            || self
                .message
                .to_ascii_lowercase()
                .contains("incorrect syntax near")
    }
}

/// Where the "current database" used for `USE` checks was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSource {
    /// The database the live connection reports
    ConnectionDatabase,
    /// The database declared in [`HardenerOptions`](crate::HardenerOptions)
    OptionsDatabase,
    /// The catalog the connection was configured with
    ConnectionString,
}

impl fmt::Display for CatalogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionDatabase => "Connection.Database",
            Self::OptionsDatabase => "Options.Database",
            Self::ConnectionString => "ConnectionString.InitialCatalog",
        };
        f.write_str(name)
    }
}

/// A `USE <database>` statement that would have switched catalogs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossDatabaseUse {
    /// Batch text containing the `USE`
    pub offending_sql: String,
    /// Database named by the `USE`
    pub target_database: String,
    /// Database the run is scoped to
    pub original_initial_catalog: String,
    /// Where `original_initial_catalog` came from
    pub original_initial_catalog_source: CatalogSource,
}

/// The trigger events a failing stage had attempted, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttemptedEvents {
    /// The failure happened before trigger events were probed
    #[default]
    NotProbed,
    /// Event names that were attempted
    Events(Vec<String>),
}

impl fmt::Display for AttemptedEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotProbed => f.write_str("(not-probed)"),
            Self::Events(events) => f.write_str(&events.join(",")),
        }
    }
}

/// Why an aggregate failure was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// DENY statements were skipped as unsupported and not confirmed in the catalog
    SkippedDeny,
    /// One or more DENY statements failed outright
    DenyFailed,
}

/// Aggregate failure from the DENY stage.
#[derive(Debug)]
pub struct AggregateFailure {
    /// What kind of aggregate this is
    pub kind: AggregateKind,
    /// Human readable summary
    pub message: String,
    /// DENY statements that remain unconfirmed
    pub skipped_deny: Vec<String>,
    /// `"<Scope>:<Database>"` for the options in effect
    pub options_summary: String,
    /// Trigger events attempted so far
    pub attempted_events: AttemptedEvents,
    /// Underlying failures, one per failed statement
    pub causes: Vec<ContainError>,
}

/// No trigger event survived probing and filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTriggerEvents {
    /// Events that were attempted
    pub attempted_events: Vec<String>,
    /// Unconfirmed DENY statements carried along for context
    pub skipped_deny: Vec<String>,
}

/// Post-creation state of a blocking trigger that failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDiagnostics {
    /// Reserved trigger name
    pub trigger_name: String,
    /// The CREATE TRIGGER statement that was executed
    pub attempted_sql: String,
    /// Catalog object id (0 when missing)
    pub object_id: i64,
    /// Whether the catalog reports the trigger disabled
    pub is_disabled: bool,
    /// Hex SHA-256 of the trigger definition (empty when unreadable)
    pub definition_hash: String,
    /// Events the trigger was created for
    pub supported_events: Vec<String>,
    /// Events attempted, for diagnostics
    pub attempted_events: AttemptedEvents,
    /// Unconfirmed DENY statements carried along for context
    pub skipped_deny: Vec<String>,
}

/// Main error type for containment operations.
///
/// # Security
/// Messages never include passwords or connection strings. Offending SQL is
/// carried because it is produced by the engine or by the untrusted caller,
/// never by the credential store.
#[derive(Debug, Error)]
pub enum ContainError {
    /// Invalid options, detected before any I/O
    #[error("Configuration error ({field}): {message}")]
    Configuration {
        /// Name of the offending option
        field: &'static str,
        /// What is wrong with it
        message: String,
    },

    /// Connecting principal lacks a required server role
    #[error("Insufficient privileges: {required}")]
    InsufficientPrivileges {
        /// The role or permission that is required
        required: String,
    },

    /// Database connection could not be established (credentials sanitized)
    #[error("Database connection failed: {context}")]
    Connection {
        /// Sanitized context
        context: String,
        /// Underlying transport/driver error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A SQL batch or scalar query failed
    #[error("{context}: {source}\nSQL:\n{offending_sql}")]
    Execution {
        /// What was being attempted
        context: String,
        /// Text of the batch that failed
        offending_sql: String,
        /// The server error
        #[source]
        source: SqlError,
    },

    /// A `USE` targeted a different catalog than the run is scoped to
    #[error(
        "USE of a different database is disallowed by the disallow_use option (target '{}', current '{}' from {})",
        .0.target_database,
        .0.original_initial_catalog,
        .0.original_initial_catalog_source
    )]
    CrossDatabaseUse(Box<CrossDatabaseUse>),

    /// DENY stage aggregate failure
    #[error("{}", .0.message)]
    Aggregate(Box<AggregateFailure>),

    /// No trigger events could be used for the blocking trigger
    #[error("No supported trigger events discovered (attempted: {})", .0.attempted_events.join(","))]
    MissingTriggerEvents(Box<MissingTriggerEvents>),

    /// A created trigger did not verify
    #[error(
        "Trigger verification failed after CREATE for '{}' (object_id={}, disabled={}, hash='{}')",
        .0.trigger_name,
        .0.object_id,
        .0.is_disabled,
        .0.definition_hash
    )]
    TriggerVerification(Box<TriggerDiagnostics>),

    /// A scalar result could not be converted to the requested type
    #[error("Result conversion failed: {context}")]
    Conversion {
        /// Expected vs actual description
        context: String,
    },

    /// OS precondition (platform or elevation) not met
    #[error("Platform requirement not met: {message}")]
    Platform {
        /// What is missing
        message: String,
    },

    /// I/O operation failed
    #[error("I/O operation failed: {context}")]
    Io {
        /// What was being attempted
        context: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The run was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,
}

/// Convenience type alias for Results with ContainError
pub type Result<T> = std::result::Result<T, ContainError>;

impl ContainError {
    /// Creates a configuration error for a named option
    pub fn configuration(field: &'static str, message: impl Into<String>) -> Self {
        Self::Configuration {
            field,
            message: message.into(),
        }
    }

    /// Creates an insufficient privileges error
    pub fn insufficient_privileges(required: impl Into<String>) -> Self {
        Self::InsufficientPrivileges {
            required: required.into(),
        }
    }

    /// Creates a connection error with sanitized context
    pub fn connection_failed<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// Wraps a server error with the SQL that produced it
    pub fn execution(context: impl Into<String>, offending_sql: impl Into<String>, source: SqlError) -> Self {
        Self::Execution {
            context: context.into(),
            offending_sql: offending_sql.into(),
            source,
        }
    }

    /// Creates a platform requirement error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// The SQL text attached to this error, if any.
    pub fn offending_sql(&self) -> Option<&str> {
        match self {
            Self::Execution { offending_sql, .. } => Some(offending_sql),
            Self::CrossDatabaseUse(details) => Some(&details.offending_sql),
            _ => None,
        }
    }

    /// The server error underneath an execution failure, if any.
    pub fn sql_error(&self) -> Option<&SqlError> {
        match self {
            Self::Execution { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Unconfirmed DENY statements carried by this error.
    pub fn skipped_deny(&self) -> &[String] {
        match self {
            Self::Aggregate(agg) => &agg.skipped_deny,
            Self::MissingTriggerEvents(missing) => &missing.skipped_deny,
            Self::TriggerVerification(diag) => &diag.skipped_deny,
            _ => &[],
        }
    }

    /// True for aggregate failures, which the orchestrator propagates unchanged.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Aggregate(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_syntax_by_number() {
        let err = SqlError::server(102, "whatever");
        assert!(err.is_unsupported_syntax());
    }

    #[test]
    fn test_unsupported_syntax_by_message() {
        let err = SqlError::server(156, "Incorrect syntax near the keyword 'EXTERNAL'.");
        assert!(err.is_unsupported_syntax());

        let err = SqlError::client("INCORRECT SYNTAX NEAR 'LIBRARY'");
        assert!(err.is_unsupported_syntax());
    }

    #[test]
    fn test_other_errors_are_not_unsupported_syntax() {
        let err = SqlError::server(15151, "Cannot find the user 'public'");
        assert!(!err.is_unsupported_syntax());
        assert!(!SqlError::client("connection reset").is_unsupported_syntax());
    }

    #[test]
    fn test_execution_error_carries_sql() {
        let error = ContainError::execution(
            "SQL execution failed",
            "DENY CREATE ASSEMBLY TO public;",
            SqlError::server(4613, "Grantor does not have GRANT permission."),
        );

        assert_eq!(error.offending_sql(), Some("DENY CREATE ASSEMBLY TO public;"));
        assert_eq!(error.sql_error().and_then(|e| e.number), Some(4613));
        assert!(error.to_string().contains("DENY CREATE ASSEMBLY"));
    }

    #[test]
    fn test_attempted_events_display() {
        assert_eq!(AttemptedEvents::NotProbed.to_string(), "(not-probed)");
        let events = AttemptedEvents::Events(vec!["CREATE_TABLE".into(), "DROP_TABLE".into()]);
        assert_eq!(events.to_string(), "CREATE_TABLE,DROP_TABLE");
    }

    #[test]
    fn test_catalog_source_display() {
        assert_eq!(CatalogSource::ConnectionDatabase.to_string(), "Connection.Database");
        assert_eq!(CatalogSource::OptionsDatabase.to_string(), "Options.Database");
        assert_eq!(
            CatalogSource::ConnectionString.to_string(),
            "ConnectionString.InitialCatalog"
        );
    }

    #[test]
    fn test_error_creation() {
        let error = ContainError::configuration("server", "Server is required");
        assert!(error.to_string().contains("Server is required"));
        assert!(error.to_string().contains("server"));

        let error = ContainError::insufficient_privileges("sysadmin");
        assert!(error.to_string().contains("sysadmin"));
        assert!(!error.is_aggregate());
    }
}
