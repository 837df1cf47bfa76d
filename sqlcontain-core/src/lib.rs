//! SQL containment engine for SQL Server.
//!
//! Two layers protect a database from an untrusted SQL producer such as an
//! LLM-driven agent:
//! - a pre-execution [`scanner`] (with the [`gate`] that applies it to agent
//!   requests) that flags SQL text likely to mutate state
//! - server-side [`hardening`] that denies and blocks dangerous surface on
//!   the instance and the target database, independent of the scanner
//!
//! # Security Guarantees
//! - Fail-closed: unverified DENYs or triggers fail the run unless the caller
//!   opts into a specific relaxation
//! - Probing is side-effect free: every probe is rolled back and dropped
//! - Batches never switch databases behind the caller's back
//! - No credentials in logs, errors or `Debug` output

pub mod error;
pub mod executor;
pub mod firewall;
pub mod gate;
pub mod hardening;
pub mod logging;
pub mod options;
pub mod orchestrator;
pub mod scanner;
pub mod session;

// Re-export commonly used types
pub use error::{
    AggregateFailure, AggregateKind, AttemptedEvents, CatalogSource, ContainError, CrossDatabaseUse, Result, SqlError,
    TriggerDiagnostics,
};
pub use executor::{exec_scalar, execute_batches, execute_batches_cancellable, split_batches};
pub use options::{AuthMode, Credentials, HardenerOptions, Scope};
pub use orchestrator::{LogSink, RunOutcome, harden, run_with_connector};
pub use scanner::{Category, Finding, contains_mutations, scan};
pub use session::{Connector, FromSqlValue, SqlSession, SqlValue};

#[cfg(feature = "mssql")]
pub use orchestrator::run;
#[cfg(feature = "mssql")]
pub use session::{TiberiusConnector, TiberiusSession};

/// Cancellation handle accepted by long-running operations.
pub use tokio_util::sync::CancellationToken;
