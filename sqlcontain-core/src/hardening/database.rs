//! Database-level hardening.
//!
//! Order: pre-harden the database from the administrative session, then on
//! a session scoped to the target apply the DENY pass and install the
//! blocking trigger.

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::deny::apply_database_denies;
use super::trigger::{TriggerInstall, install_database_trigger};
use crate::executor::{ensure_active, execute_batches_cancellable};
use crate::options::HardenerOptions;
use crate::session::{Connector, SqlSession, SqlValue};
use crate::Result;

/// Existence check and database options, run on `master` with `@P1` bound
/// to the database name.
pub const PRE_HARDEN_SQL: &str = "IF DB_ID(@P1) IS NULL THROW 51000, 'Database not found.', 1; \
DECLARE @trustworthy nvarchar(max) = N'ALTER DATABASE ' + QUOTENAME(@P1) + N' SET TRUSTWORTHY OFF WITH NO_WAIT;'; \
EXEC sp_executesql @trustworthy; \
DECLARE @chaining nvarchar(max) = N'ALTER DATABASE ' + QUOTENAME(@P1) + N' SET DB_CHAINING OFF;'; \
EXEC sp_executesql @chaining;";

/// Hardens one database.
///
/// # Arguments
/// * `master` - Administrative session used for the pre-hardening step
/// * `connector` - Opens the session scoped to `database`
/// * `database` - Target database
/// * `options` - Run options
/// * `cancel` - Stops the run between statements
///
/// # Errors
/// Execution errors from pre-hardening, aggregate DENY failures, and trigger
/// installation failures propagate unchanged.
pub async fn harden_database(
    master: &mut dyn SqlSession,
    connector: &dyn Connector,
    database: &str,
    options: &HardenerOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(database, "Hardening database");

    execute_batches_cancellable(master, PRE_HARDEN_SQL, Some(options), &[SqlValue::from(database)], cancel).await?;

    ensure_active(cancel)?;
    let mut target = connector.connect(database).await?;

    let denies = apply_database_denies(target.as_mut(), options, cancel).await?;
    let install = install_database_trigger(target.as_mut(), options, &denies.skipped_sql(), cancel).await?;

    match install {
        TriggerInstall::Created(events) => info!(database, events = %events.join(","), "Database hardened"),
        TriggerInstall::AlreadyPresent => info!(database, "Database hardened (trigger already present)"),
        TriggerInstall::NoSupportedEvents => info!(database, "Database hardened without blocking trigger"),
    }
    Ok(())
}
