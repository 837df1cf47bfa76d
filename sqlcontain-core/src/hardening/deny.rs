//! DENY application and catalog verification.
//!
//! Each DENY runs on its own. A failure that looks like the edition does not
//! know the syntax is recorded as skipped and re-checked against
//! `sys.database_permissions` once the pass is over. Anything else is a hard
//! failure, and all hard failures of the pass are reported together.

use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AggregateFailure, AggregateKind, AttemptedEvents, ContainError};
use crate::executor::{ensure_active, exec_scalar, execute_batches_cancellable};
use crate::options::HardenerOptions;
use crate::session::{SqlSession, SqlValue};
use crate::Result;

/// A fixed `DENY <permission> TO public` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DenyStatement {
    /// Permission name as it appears in `sys.database_permissions`
    pub permission: &'static str,
}

impl DenyStatement {
    /// The statement text.
    pub fn sql(&self) -> String {
        format!("DENY {} TO public;", self.permission)
    }
}

impl fmt::Display for DenyStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DENY {} TO public;", self.permission)
    }
}

/// Denies applied to every hardened database.
pub const DATABASE_DENIES: [DenyStatement; 5] = [
    DenyStatement { permission: "CREATE ASSEMBLY" },
    DenyStatement { permission: "ALTER ANY EXTERNAL DATA SOURCE" },
    DenyStatement { permission: "ALTER ANY EXTERNAL FILE FORMAT" },
    DenyStatement { permission: "ALTER ANY EXTERNAL LIBRARY" },
    DenyStatement { permission: "CREATE CREDENTIAL" },
];

/// Counts DENY rows for `@P1` granted to `public`.
pub const DENY_STATE_SQL: &str = "SELECT COUNT(*) FROM sys.database_permissions dp \
JOIN sys.database_principals p ON dp.grantee_principal_id = p.principal_id \
WHERE dp.permission_name = @P1 AND dp.state_desc = 'DENY' AND p.name = 'public';";

/// Result of a DENY pass that did not fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DenyOutcome {
    /// Statements executed in this pass
    pub applied: Vec<DenyStatement>,
    /// Statements not re-issued because the catalog already showed them
    pub already_effective: Vec<DenyStatement>,
    /// Statements confirmed in the catalog after being skipped
    pub verified: Vec<DenyStatement>,
    /// Statements still unconfirmed (only when `allow_skipped_deny` is set)
    pub skipped: Vec<DenyStatement>,
}

impl DenyOutcome {
    /// Statement texts of the unconfirmed denies.
    pub fn skipped_sql(&self) -> Vec<String> {
        self.skipped.iter().map(DenyStatement::sql).collect()
    }
}

/// Returns true when the catalog shows `permission` denied to `public`.
///
/// # Errors
/// Returns an execution error if the catalog query fails.
pub async fn is_deny_effective(conn: &mut dyn SqlSession, permission: &str) -> Result<bool> {
    let count: i64 = exec_scalar(conn, DENY_STATE_SQL, &[SqlValue::from(permission)]).await?;
    Ok(count > 0)
}

/// Re-checks skipped statements and returns those still unconfirmed.
///
/// A statement whose verification query fails stays unconfirmed.
pub async fn verify_skipped_denies(conn: &mut dyn SqlSession, skipped: &[DenyStatement]) -> Vec<DenyStatement> {
    let mut remaining = Vec::new();

    for deny in skipped {
        match is_deny_effective(conn, deny.permission).await {
            Ok(true) => debug!(permission = deny.permission, "Skipped DENY confirmed in catalog"),
            Ok(false) => remaining.push(*deny),
            Err(e) => {
                warn!(permission = deny.permission, error = %e, "Could not verify skipped DENY");
                remaining.push(*deny);
            }
        }
    }

    remaining
}

fn aggregate(
    kind: AggregateKind,
    message: String,
    remaining: &[DenyStatement],
    options: &HardenerOptions,
    causes: Vec<ContainError>,
) -> ContainError {
    ContainError::Aggregate(Box::new(AggregateFailure {
        kind,
        message,
        skipped_deny: remaining.iter().map(DenyStatement::sql).collect(),
        options_summary: options.summary(),
        attempted_events: AttemptedEvents::NotProbed,
        causes,
    }))
}

/// Applies [`DATABASE_DENIES`] on a session scoped to the target database.
///
/// # Errors
/// - [`AggregateKind::DenyFailed`] when any statement failed for a reason
///   other than unsupported syntax; every cause is attached
/// - [`AggregateKind::SkippedDeny`] when skipped statements remain
///   unconfirmed and `allow_skipped_deny` is false
/// - [`ContainError::Cancelled`] once `cancel` fires, without running the
///   remaining statements
pub async fn apply_database_denies(
    conn: &mut dyn SqlSession,
    options: &HardenerOptions,
    cancel: &CancellationToken,
) -> Result<DenyOutcome> {
    let mut outcome = DenyOutcome::default();
    let mut skipped = Vec::new();
    let mut failures = Vec::new();

    for deny in DATABASE_DENIES {
        ensure_active(cancel)?;
        match is_deny_effective(conn, deny.permission).await {
            Ok(true) => {
                debug!(permission = deny.permission, "DENY already effective");
                outcome.already_effective.push(deny);
                continue;
            }
            Ok(false) => {}
            Err(e) => debug!(permission = deny.permission, error = %e, "DENY pre-check failed"),
        }

        ensure_active(cancel)?;
        let sql = deny.sql();
        match execute_batches_cancellable(conn, &sql, Some(options), &[], cancel).await {
            Ok(()) => outcome.applied.push(deny),
            Err(ContainError::Cancelled) => return Err(ContainError::Cancelled),
            Err(e) if e.sql_error().is_some_and(|s| s.is_unsupported_syntax()) => {
                debug!(permission = deny.permission, error = %e, "DENY not supported by this edition");
                skipped.push(deny);
            }
            Err(e) => {
                warn!(permission = deny.permission, error = %e, "DENY failed");
                failures.push(e);
            }
        }
    }

    ensure_active(cancel)?;
    let remaining = verify_skipped_denies(conn, &skipped).await;
    outcome.verified = skipped.into_iter().filter(|d| !remaining.contains(d)).collect();

    if !failures.is_empty() {
        return Err(aggregate(
            AggregateKind::DenyFailed,
            format!("{} DENY statement(s) failed.", failures.len()),
            &remaining,
            options,
            failures,
        ));
    }

    if !remaining.is_empty() {
        let listed = remaining.iter().map(DenyStatement::sql).collect::<Vec<_>>().join(" ");
        if !options.allow_skipped_deny {
            return Err(aggregate(
                AggregateKind::SkippedDeny,
                format!("Skipped DENY statements could not be verified: {}", listed),
                &remaining,
                options,
                Vec::new(),
            ));
        }
        warn!(skipped = %listed, "Proceeding with unverified DENY statements (allow_skipped_deny)");
    }

    outcome.skipped = remaining;
    info!(
        applied = outcome.applied.len(),
        already_effective = outcome.already_effective.len(),
        verified = outcome.verified.len(),
        skipped = outcome.skipped.len(),
        "DENY pass complete"
    );
    Ok(outcome)
}
