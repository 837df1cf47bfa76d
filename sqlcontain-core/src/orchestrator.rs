//! Run sequencing: validate, connect, check role, harden by scope.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ContainError;
use crate::executor::{ensure_active, exec_scalar};
use crate::firewall;
use crate::hardening::{harden_database, harden_instance};
use crate::options::HardenerOptions;
use crate::session::{Connector, SqlSession};
use crate::Result;

/// Catalog the privileged session is opened against.
pub const ADMIN_CATALOG: &str = "master";

/// Server role the connecting principal must hold.
pub const REQUIRED_ROLE: &str = "sysadmin";

/// Caller-provided receiver for human-readable progress lines.
pub type LogSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Final status of [`run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Everything requested was applied and verified
    Success,
    /// A failure was logged to the sink
    Failed,
}

impl RunOutcome {
    /// Process exit code: 0 on success, 1 otherwise.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
        }
    }
}

/// Fails unless the session's login holds [`REQUIRED_ROLE`].
///
/// # Errors
/// [`ContainError::InsufficientPrivileges`], or an execution error if the
/// role query fails.
pub async fn ensure_sysadmin(conn: &mut dyn SqlSession) -> Result<()> {
    let member: i32 = exec_scalar(conn, "SELECT IS_SRVROLEMEMBER('sysadmin');", &[]).await?;
    if member == 1 {
        Ok(())
    } else {
        Err(ContainError::insufficient_privileges(REQUIRED_ROLE))
    }
}

/// Validates `options` and hardens the requested scope.
///
/// Instance hardening runs before database hardening when both are requested.
///
/// # Errors
/// Validation errors before any I/O, connection and role errors, and any
/// stage failure, unchanged.
pub async fn harden(connector: &dyn Connector, options: &HardenerOptions, cancel: &CancellationToken) -> Result<()> {
    options.validate()?;

    let mut master = connector.connect(ADMIN_CATALOG).await?;
    ensure_sysadmin(master.as_mut()).await?;
    ensure_active(cancel)?;

    if options.scope.includes_instance() {
        harden_instance(master.as_mut(), cancel).await?;
    }

    if options.scope.includes_database() {
        harden_database(master.as_mut(), connector, &options.database, options, cancel).await?;
    }

    Ok(())
}

fn report(sink: Option<LogSink<'_>>, line: &str) {
    if let Some(sink) = sink {
        sink(line);
    }
}

async fn run_firewall_only(options: &HardenerOptions, sink: Option<LogSink<'_>>) -> RunOutcome {
    let result = async {
        firewall::ensure_windows()?;
        let path = options.sqlservr_path.as_deref().ok_or_else(|| {
            ContainError::configuration("sqlservr_path", "A server binary path is required for the firewall rule.")
        })?;
        firewall::apply_outbound_block(path).await
    }
    .await;

    match result {
        Ok(()) => {
            report(sink, "Firewall rule applied.");
            RunOutcome::Success
        }
        Err(e) => {
            error!(error = %e, "Firewall configuration failed");
            report(sink, &format!("Firewall configuration failed: {}", e));
            RunOutcome::Failed
        }
    }
}

async fn request_firewall(options: &HardenerOptions, sink: Option<LogSink<'_>>) {
    let Some(path) = options.sqlservr_path.as_deref() else {
        warn!("Firewall requested without a server binary path; skipping");
        report(sink, "Firewall step skipped: no server binary path.");
        return;
    };

    match firewall::ensure_outbound_block(path).await {
        Ok(true) => report(sink, "Firewall step completed."),
        Ok(false) => {
            warn!("Elevated firewall step did not succeed");
            report(sink, "Firewall step did not succeed.");
        }
        Err(e) => {
            warn!(error = %e, "Firewall step unavailable");
            report(sink, &format!("Firewall step unavailable: {}", e));
        }
    }
}

/// [`run`] with an explicit connector and cancellation token.
///
/// # Errors
/// Only aggregate DENY failures are returned as `Err`; every other failure is
/// logged and reported as [`RunOutcome::Failed`].
pub async fn run_with_connector(
    connector: &dyn Connector,
    options: &HardenerOptions,
    sink: Option<LogSink<'_>>,
    cancel: &CancellationToken,
) -> Result<RunOutcome> {
    if options.internal_firewall_only {
        return Ok(run_firewall_only(options, sink).await);
    }

    report(sink, &format!("Hardening {}", options));

    match harden(connector, options, cancel).await {
        Ok(()) => {
            info!(summary = %options.summary(), "Hardening complete");
            report(sink, "Hardening complete.");
        }
        Err(e) if e.is_aggregate() => {
            error!(error = %e, "Hardening failed");
            report(sink, &format!("Hardening failed: {}", e));
            return Err(e);
        }
        Err(e) => {
            error!(error = %e, "Hardening failed");
            report(sink, &format!("Hardening failed: {}", e));
            return Ok(RunOutcome::Failed);
        }
    }

    if options.firewall {
        request_firewall(options, sink).await;
    }

    Ok(RunOutcome::Success)
}

/// Runs one hardening invocation against the server in `options`.
///
/// # Errors
/// Only aggregate DENY failures are returned as `Err`.
///
/// # Example
/// ```rust,no_run
/// use sqlcontain_core::{HardenerOptions, orchestrator::run};
///
/// # async fn example() -> sqlcontain_core::Result<()> {
/// let options = HardenerOptions::new("localhost").with_database("AgentSandbox");
/// let sink = |line: &str| println!("{}", line);
/// let outcome = run(&options, Some(&sink)).await?;
/// std::process::exit(outcome.exit_code());
/// # }
/// ```
#[cfg(feature = "mssql")]
pub async fn run(options: &HardenerOptions, sink: Option<LogSink<'_>>) -> Result<RunOutcome> {
    let connector = crate::session::TiberiusConnector::new(options);
    run_with_connector(&connector, options, sink, &CancellationToken::new()).await
}
