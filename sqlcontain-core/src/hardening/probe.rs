//! Transactional discovery of supported DDL trigger events.
//!
//! Each probe opens a transaction, tries to create a uniquely named trigger
//! over a set of events, then always rolls back and drops the probe trigger.
//! Sets that fail are split in half and probed again, so a fully supported
//! candidate list costs a single probe.

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::trigger::{TriggerScope, TriggerTemplate, drop_if_exists_sql};
use crate::error::ContainError;
use crate::executor::{execute_batches, execute_batches_cancellable};
use crate::session::SqlSession;
use crate::Result;

/// Upper bound on probe attempts per [`probe_supported_events`] call.
pub const MAX_PROBE_ATTEMPTS: u32 = 16;

/// Events tried for the database-scoped blocking trigger.
pub const CANDIDATE_EVENTS: [&str; 10] = [
    "DDL_DATABASE_LEVEL_EVENTS",
    "CREATE_TABLE",
    "ALTER_TABLE",
    "DROP_TABLE",
    "CREATE_PROCEDURE",
    "ALTER_PROCEDURE",
    "DROP_PROCEDURE",
    "INSERT",
    "UPDATE",
    "DELETE",
];

const BEGIN_SQL: &str = "BEGIN TRANSACTION;";
const ROLLBACK_SQL: &str = "IF XACT_STATE() <> 0 ROLLBACK TRANSACTION;";

/// Probe attempt accumulator shared across one divide-and-conquer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBudget {
    attempts: u32,
    max: u32,
}

impl Default for ProbeBudget {
    fn default() -> Self {
        Self::new(MAX_PROBE_ATTEMPTS)
    }
}

impl ProbeBudget {
    /// A budget allowing `max` probes.
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    /// Counts one attempt; false once the count exceeds the maximum.
    pub fn try_spend(&mut self) -> bool {
        self.attempts += 1;
        self.attempts <= self.max
    }

    /// True when no further attempt fits.
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max
    }

    /// Attempts counted so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Unique probe trigger name: `<base>_probe_<uuid>`.
pub fn probe_name(base: &str) -> String {
    format!("{}_probe_{}", base, Uuid::new_v4().simple())
}

/// Rolls back and drops the probe trigger. Both steps always run.
async fn cleanup(conn: &mut dyn SqlSession, name: &str) -> Result<()> {
    let rollback = execute_batches(conn, ROLLBACK_SQL, None, &[]).await;
    let dropped = execute_batches(conn, &drop_if_exists_sql(name, TriggerScope::Database), None, &[]).await;

    if let Err(e) = &rollback {
        warn!(probe = name, error = %e, "Probe rollback failed");
    }
    if let Err(e) = &dropped {
        warn!(probe = name, error = %e, "Probe cleanup drop failed");
    }
    rollback.and(dropped)
}

/// Attempts one probe. `Ok(true)` when the trigger could be created.
///
/// # Errors
/// Fails when the probe could not be rendered, the transaction could not be
/// opened, cleanup failed, or the run was cancelled. A rejected
/// `CREATE TRIGGER` is not an error.
pub async fn try_events(
    conn: &mut dyn SqlSession,
    base: &str,
    events: &[&str],
    cancel: &CancellationToken,
) -> Result<bool> {
    let name = probe_name(base);
    let create = TriggerTemplate::probe(name.as_str(), events).render()?;

    execute_batches(conn, BEGIN_SQL, None, &[]).await?;

    // CREATE TRIGGER must be the first statement of its batch.
    let created = execute_batches_cancellable(conn, &create, None, &[], cancel).await;
    let cleaned = cleanup(conn, &name).await;

    let supported = match created {
        Ok(()) => true,
        Err(ContainError::Cancelled) => return Err(ContainError::Cancelled),
        Err(e) => {
            debug!(events = %events.join(","), error = %e, "Probe rejected");
            false
        }
    };
    cleaned?;

    debug!(events = %events.join(","), supported, "Probe finished");
    Ok(supported)
}

fn probe_set<'a>(
    conn: &'a mut dyn SqlSession,
    base: &'a str,
    events: &'a [&'a str],
    budget: &'a mut ProbeBudget,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<Vec<String>>> {
    Box::pin(async move {
        if events.is_empty() || !budget.try_spend() {
            return Ok(Vec::new());
        }

        if try_events(conn, base, events, cancel).await? {
            return Ok(events.iter().map(ToString::to_string).collect());
        }
        if events.len() == 1 {
            return Ok(Vec::new());
        }

        let (left, right) = events.split_at(events.len() / 2);
        let mut supported = probe_set(&mut *conn, base, left, &mut *budget, cancel).await?;
        if budget.exhausted() {
            return Ok(supported);
        }
        supported.extend(probe_set(conn, base, right, budget, cancel).await?);
        Ok(supported)
    })
}

/// Returns the subset of `candidates` the connected edition accepts, in
/// candidate order.
///
/// At most [`MAX_PROBE_ATTEMPTS`] probes are made; when the budget runs out
/// the events found so far are returned.
///
/// # Errors
/// Propagates cleanup failures and [`ContainError::Cancelled`].
pub async fn probe_supported_events(
    conn: &mut dyn SqlSession,
    base: &str,
    candidates: &[&str],
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let mut budget = ProbeBudget::default();
    probe_with_budget(conn, base, candidates, &mut budget, cancel).await
}

/// [`probe_supported_events`] with a caller-supplied budget.
///
/// # Errors
/// Propagates cleanup failures and [`ContainError::Cancelled`].
pub async fn probe_with_budget(
    conn: &mut dyn SqlSession,
    base: &str,
    candidates: &[&str],
    budget: &mut ProbeBudget,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let supported = probe_set(conn, base, candidates, budget, cancel).await?;

    if budget.attempts() > budget.max {
        warn!(attempts = budget.max, "Probe budget exhausted; result may be incomplete");
    }
    info!(
        attempts = budget.attempts().min(budget.max),
        supported = %supported.join(","),
        "Trigger event probing complete"
    );
    Ok(supported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_counts_attempts() {
        let mut budget = ProbeBudget::new(2);
        assert!(budget.try_spend());
        assert!(!budget.exhausted());
        assert!(budget.try_spend());
        assert!(budget.exhausted());
        assert!(!budget.try_spend());
        assert_eq!(budget.attempts(), 3);
    }

    #[test]
    fn test_probe_names_are_unique() {
        let a = probe_name("trg_block_external_db_ops");
        let b = probe_name("trg_block_external_db_ops");
        assert_ne!(a, b);
        assert!(a.starts_with("trg_block_external_db_ops_probe_"));
        assert_eq!(a.len(), "trg_block_external_db_ops_probe_".len() + 32);
    }

    #[test]
    fn test_probe_name_renders() {
        let name = probe_name("trg");
        assert!(TriggerTemplate::probe(name, &CANDIDATE_EVENTS).render().is_ok());
    }
}
