//! Instance-level hardening.
//!
//! Turns off OS and external-code surface through `sp_configure` and installs
//! a server-scoped trigger that blocks linked-server and credential DDL.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::trigger::{TriggerBody, TriggerScope, TriggerTemplate, existing_trigger, verify_trigger};
use crate::error::AttemptedEvents;
use crate::executor::{ensure_active, execute_batches_cancellable};
use crate::session::SqlSession;
use crate::Result;

/// Reserved name of the server-scoped blocking trigger.
pub const SERVER_TRIGGER_NAME: &str = "trg_block_unsafe_server_ops";

/// Error text raised by the server-scoped blocking trigger.
pub const SERVER_TRIGGER_MESSAGE: &str = "Linked servers and credentials are blocked on this instance.";

/// Events blocked by the server-scoped trigger.
pub const SERVER_TRIGGER_EVENTS: [&str; 4] = [
    "CREATE_LINKED_SERVER",
    "ALTER_LINKED_SERVER",
    "CREATE_CREDENTIAL",
    "ALTER_CREDENTIAL",
];

/// Option enabled first so the advanced options below can be changed.
pub const SHOW_ADVANCED_OPTIONS: (&str, i32) = ("show advanced options", 1);

/// Instance configuration applied on every run, in order.
pub const INSTANCE_SETTINGS: [(&str, i32); 7] = [
    ("xp_cmdshell", 0),
    ("Ole Automation Procedures", 0),
    ("Ad Hoc Distributed Queries", 0),
    ("clr enabled", 0),
    ("clr strict security", 1),
    ("external scripts enabled", 0),
    ("filestream access level", 0),
];

/// `sp_configure` followed by `RECONFIGURE WITH OVERRIDE`.
pub fn configure_sql(option: &str, value: i32) -> String {
    format!(
        "EXEC sp_configure N'{}', {}; RECONFIGURE WITH OVERRIDE;",
        option.replace('\'', "''"),
        value
    )
}

/// The server-scoped blocking trigger template.
pub fn server_trigger() -> TriggerTemplate {
    TriggerTemplate {
        name: SERVER_TRIGGER_NAME.to_string(),
        scope: TriggerScope::AllServer,
        events: SERVER_TRIGGER_EVENTS.iter().map(ToString::to_string).collect(),
        body: TriggerBody::RaiseError {
            message: SERVER_TRIGGER_MESSAGE.to_string(),
        },
    }
}

/// Applies instance configuration and installs the server trigger.
///
/// Configuration changes are issued unconditionally; the trigger is only
/// created when missing and is verified after creation.
///
/// # Errors
/// Any failed `sp_configure` is fatal. Trigger creation failures and
/// verification failures propagate. [`ContainError::Cancelled`] once
/// `cancel` fires; no further statement is sent after that.
///
/// [`ContainError::Cancelled`]: crate::error::ContainError::Cancelled
pub async fn harden_instance(conn: &mut dyn SqlSession, cancel: &CancellationToken) -> Result<()> {
    info!("Hardening instance configuration");

    let (option, value) = SHOW_ADVANCED_OPTIONS;
    execute_batches_cancellable(conn, &configure_sql(option, value), None, &[], cancel).await?;

    for (option, value) in INSTANCE_SETTINGS {
        debug!(option, value, "Applying instance setting");
        execute_batches_cancellable(conn, &configure_sql(option, value), None, &[], cancel).await?;
    }

    ensure_active(cancel)?;
    if existing_trigger(conn, SERVER_TRIGGER_NAME, TriggerScope::AllServer).await?.object_id != 0 {
        info!(trigger = SERVER_TRIGGER_NAME, "Server trigger already present");
        return Ok(());
    }

    let template = server_trigger();
    let sql = template.render()?;
    execute_batches_cancellable(conn, &sql, None, &[], cancel).await?;
    verify_trigger(conn, &template, &sql, AttemptedEvents::Events(template.events.clone()), &[]).await?;

    info!(trigger = SERVER_TRIGGER_NAME, "Server trigger installed");
    Ok(())
}
