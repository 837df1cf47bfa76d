//! Blocking DDL triggers: template rendering, installation and verification.
//!
//! All trigger DDL is assembled by [`TriggerTemplate`]. Names and event
//! lists are validated before interpolation and the name is always emitted
//! bracket-quoted.

use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::probe::{self, CANDIDATE_EVENTS};
use crate::error::{AttemptedEvents, ContainError, MissingTriggerEvents, TriggerDiagnostics};
use crate::executor::{ensure_active, exec_scalar, execute_batches_cancellable};
use crate::options::HardenerOptions;
use crate::session::{SqlSession, SqlValue};
use crate::Result;

/// Reserved name of the database-scoped blocking trigger.
pub const DATABASE_TRIGGER_NAME: &str = "trg_block_external_db_ops";

/// Error text raised by the database-scoped blocking trigger.
pub const DATABASE_TRIGGER_MESSAGE: &str = "External/CLR/external-data features are blocked in this database.";

/// User error number thrown by the database-scoped blocking trigger.
pub const DATABASE_TRIGGER_ERROR: u32 = 51000;

/// Event names containing any of these are never used in a blocking trigger.
pub const EXCLUDED_EVENT_TOKENS: [&str; 3] = ["EXTERNAL", "FILE FORMAT", "DATA SOURCE"];

const MAX_NAME_LEN: usize = 128;

/// Where a DDL trigger is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerScope {
    /// `ON DATABASE`, catalogued in `sys.triggers`
    Database,
    /// `ON ALL SERVER`, catalogued in `sys.server_triggers`
    AllServer,
}

impl fmt::Display for TriggerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => f.write_str("DATABASE"),
            Self::AllServer => f.write_str("ALL SERVER"),
        }
    }
}

/// Statement body of a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerBody {
    /// `ROLLBACK; THROW <number>, '<message>', 1;`
    Throw {
        /// User error number (50000 or above)
        number: u32,
        /// Error text
        message: String,
    },
    /// `ROLLBACK; RAISERROR('<message>', 16, 1);`
    RaiseError {
        /// Error text
        message: String,
    },
    /// Does nothing; used for capability probes
    Empty,
}

/// A `CREATE TRIGGER` statement with named slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerTemplate {
    /// Trigger name
    pub name: String,
    /// Attachment scope
    pub scope: TriggerScope,
    /// DDL event names or groups
    pub events: Vec<String>,
    /// Statement body
    pub body: TriggerBody,
}

fn quote_literal(text: &str) -> String {
    text.replace('\'', "''")
}

/// Brackets an identifier, doubling any closing bracket.
pub fn quote_name(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().count() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ContainError::configuration(
            "trigger_name",
            format!("invalid trigger name '{}'", name),
        ))
    }
}

fn validate_event(event: &str) -> Result<()> {
    let valid = !event.is_empty() && event.chars().all(|c| c.is_ascii_uppercase() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ContainError::configuration(
            "trigger_events",
            format!("invalid trigger event '{}'", event),
        ))
    }
}

impl TriggerTemplate {
    /// The database-scoped blocking trigger over `events`.
    pub fn database_block(events: &[String]) -> Self {
        Self {
            name: DATABASE_TRIGGER_NAME.to_string(),
            scope: TriggerScope::Database,
            events: events.to_vec(),
            body: TriggerBody::Throw {
                number: DATABASE_TRIGGER_ERROR,
                message: DATABASE_TRIGGER_MESSAGE.to_string(),
            },
        }
    }

    /// A throwaway database trigger used to test whether `events` are accepted.
    pub fn probe(name: impl Into<String>, events: &[&str]) -> Self {
        Self {
            name: name.into(),
            scope: TriggerScope::Database,
            events: events.iter().map(ToString::to_string).collect(),
            body: TriggerBody::Empty,
        }
    }

    /// Renders the `CREATE TRIGGER` statement.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid name, an empty event
    /// list, or an event that is not an upper-case identifier.
    ///
    /// # Example
    /// ```rust
    /// use sqlcontain_core::hardening::trigger::TriggerTemplate;
    ///
    /// let sql = TriggerTemplate::database_block(&["CREATE_TABLE".to_string()])
    ///     .render()
    ///     .unwrap();
    /// assert!(sql.starts_with("CREATE TRIGGER [trg_block_external_db_ops] ON DATABASE FOR CREATE_TABLE AS"));
    /// ```
    pub fn render(&self) -> Result<String> {
        validate_name(&self.name)?;
        if self.events.is_empty() {
            return Err(ContainError::configuration(
                "trigger_events",
                format!("trigger '{}' has no events", self.name),
            ));
        }
        for event in &self.events {
            validate_event(event)?;
        }

        let body = match &self.body {
            TriggerBody::Throw { number, message } => {
                format!("ROLLBACK; THROW {}, '{}', 1;", number, quote_literal(message))
            }
            TriggerBody::RaiseError { message } => {
                format!("ROLLBACK; RAISERROR('{}', 16, 1);", quote_literal(message))
            }
            TriggerBody::Empty => "SET NOCOUNT ON;".to_string(),
        };

        Ok(format!(
            "CREATE TRIGGER {} ON {} FOR {} AS BEGIN {} END;",
            quote_name(&self.name),
            self.scope,
            self.events.join(", "),
            body
        ))
    }
}

/// `DROP TRIGGER` guarded by an existence check.
pub fn drop_if_exists_sql(name: &str, scope: TriggerScope) -> String {
    let literal = quote_literal(name);
    match scope {
        TriggerScope::Database => format!(
            "IF EXISTS (SELECT 1 FROM sys.triggers WHERE name = N'{}' AND parent_class = 0) DROP TRIGGER {} ON DATABASE;",
            literal,
            quote_name(name)
        ),
        TriggerScope::AllServer => format!(
            "IF EXISTS (SELECT 1 FROM sys.server_triggers WHERE name = N'{}') DROP TRIGGER {} ON ALL SERVER;",
            literal,
            quote_name(name)
        ),
    }
}

/// Drops events that mention external-feature tokens.
pub fn filter_events(events: &[String]) -> Vec<String> {
    events
        .iter()
        .filter(|event| {
            let spaced = event.to_ascii_uppercase().replace('_', " ");
            !EXCLUDED_EVENT_TOKENS.iter().any(|token| spaced.contains(token))
        })
        .cloned()
        .collect()
}

/// Catalog state of a trigger after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerState {
    /// Catalog object id, 0 when missing
    pub object_id: i64,
    /// Disabled flag
    pub is_disabled: bool,
    /// Hex SHA-256 of the definition, empty when unreadable
    pub definition_hash: String,
}

impl TriggerState {
    /// Present, enabled and with a readable definition.
    pub fn is_healthy(&self) -> bool {
        self.object_id != 0 && !self.is_disabled && !self.definition_hash.trim().is_empty()
    }
}

struct CatalogQueries {
    object_id: &'static str,
    is_disabled: &'static str,
    definition_hash: &'static str,
}

fn catalog_queries(scope: TriggerScope) -> CatalogQueries {
    match scope {
        TriggerScope::Database => CatalogQueries {
            object_id: "SELECT object_id FROM sys.triggers WHERE name = @P1 AND parent_class = 0;",
            is_disabled: "SELECT CAST(ISNULL(is_disabled, 0) AS int) FROM sys.triggers WHERE object_id = @P1;",
            definition_hash: "SELECT CONVERT(varchar(66), HASHBYTES('SHA2_256', OBJECT_DEFINITION(@P1)), 1);",
        },
        TriggerScope::AllServer => CatalogQueries {
            object_id: "SELECT object_id FROM sys.server_triggers WHERE name = @P1;",
            is_disabled: "SELECT CAST(ISNULL(is_disabled, 0) AS int) FROM sys.server_triggers WHERE object_id = @P1;",
            definition_hash: "SELECT CONVERT(varchar(66), HASHBYTES('SHA2_256', definition), 1) FROM sys.server_sql_modules WHERE object_id = @P1;",
        },
    }
}

/// Looks up a trigger's object id, 0 when it does not exist.
///
/// # Errors
/// Returns an execution error if the catalog query fails.
pub async fn trigger_object_id(conn: &mut dyn SqlSession, name: &str, scope: TriggerScope) -> Result<i64> {
    exec_scalar(conn, catalog_queries(scope).object_id, &[SqlValue::from(name)]).await
}

/// Reads existence, disabled flag and definition hash of a trigger.
///
/// # Errors
/// Returns an execution error if any catalog query fails.
pub async fn read_trigger_state(conn: &mut dyn SqlSession, name: &str, scope: TriggerScope) -> Result<TriggerState> {
    let queries = catalog_queries(scope);
    let object_id = trigger_object_id(conn, name, scope).await?;
    if object_id == 0 {
        return Ok(TriggerState::default());
    }

    let id = [SqlValue::Int(object_id)];
    let is_disabled: bool = exec_scalar(conn, queries.is_disabled, &id).await?;
    let definition_hash: String = exec_scalar(conn, queries.definition_hash, &id).await?;

    Ok(TriggerState {
        object_id,
        is_disabled,
        definition_hash,
    })
}

/// Reads the state of an existing trigger, 0 object id when missing.
///
/// A trigger that is present but disabled or unreadable is left in place and
/// reported with a warning.
///
/// # Errors
/// Returns an execution error if any catalog query fails.
pub async fn existing_trigger(conn: &mut dyn SqlSession, name: &str, scope: TriggerScope) -> Result<TriggerState> {
    let state = read_trigger_state(conn, name, scope).await?;
    if state.object_id != 0 && !state.is_healthy() {
        warn!(
            trigger = name,
            object_id = state.object_id,
            is_disabled = state.is_disabled,
            "Existing trigger is disabled or has no readable definition"
        );
    }
    Ok(state)
}

/// Fails with full diagnostics unless the trigger is healthy.
///
/// # Errors
/// [`ContainError::TriggerVerification`] when the trigger is missing,
/// disabled or has no readable definition.
pub async fn verify_trigger(
    conn: &mut dyn SqlSession,
    template: &TriggerTemplate,
    attempted_sql: &str,
    attempted_events: AttemptedEvents,
    skipped_deny: &[String],
) -> Result<TriggerState> {
    let state = read_trigger_state(conn, &template.name, template.scope).await?;
    if state.is_healthy() {
        debug!(trigger = %template.name, object_id = state.object_id, "Trigger verified");
        return Ok(state);
    }

    Err(ContainError::TriggerVerification(Box::new(TriggerDiagnostics {
        trigger_name: template.name.clone(),
        attempted_sql: attempted_sql.to_string(),
        object_id: state.object_id,
        is_disabled: state.is_disabled,
        definition_hash: state.definition_hash,
        supported_events: template.events.clone(),
        attempted_events,
        skipped_deny: skipped_deny.to_vec(),
    })))
}

/// What [`install_database_trigger`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerInstall {
    /// The reserved trigger was already there
    AlreadyPresent,
    /// The trigger was created and verified for these events
    Created(Vec<String>),
    /// No usable event, tolerated by `allow_missing_trigger`
    NoSupportedEvents,
}

fn candidate_list() -> Vec<String> {
    CANDIDATE_EVENTS.iter().map(ToString::to_string).collect()
}

/// Installs and verifies the database-scoped blocking trigger.
///
/// `skipped_deny` is carried into any failure for context.
///
/// # Errors
/// - [`ContainError::MissingTriggerEvents`] when no event survives probing and
///   filtering and `allow_missing_trigger` is false
/// - [`ContainError::TriggerVerification`] when the created trigger does not verify
/// - [`ContainError::Cancelled`] when `cancel` fires
pub async fn install_database_trigger(
    conn: &mut dyn SqlSession,
    options: &HardenerOptions,
    skipped_deny: &[String],
    cancel: &CancellationToken,
) -> Result<TriggerInstall> {
    ensure_active(cancel)?;
    if existing_trigger(conn, DATABASE_TRIGGER_NAME, TriggerScope::Database).await?.object_id != 0 {
        info!(trigger = DATABASE_TRIGGER_NAME, "Database trigger already present");
        return Ok(TriggerInstall::AlreadyPresent);
    }

    let supported = probe::probe_supported_events(conn, DATABASE_TRIGGER_NAME, &CANDIDATE_EVENTS, cancel).await?;
    let events = filter_events(&supported);

    if events.is_empty() {
        if options.allow_missing_trigger {
            warn!(
                attempted = %CANDIDATE_EVENTS.join(","),
                "No supported trigger events; continuing without database trigger (allow_missing_trigger)"
            );
            return Ok(TriggerInstall::NoSupportedEvents);
        }
        return Err(ContainError::MissingTriggerEvents(Box::new(MissingTriggerEvents {
            attempted_events: candidate_list(),
            skipped_deny: skipped_deny.to_vec(),
        })));
    }

    let template = TriggerTemplate::database_block(&events);
    let sql = template.render()?;
    execute_batches_cancellable(conn, &sql, Some(options), &[], cancel).await?;

    verify_trigger(
        conn,
        &template,
        &sql,
        AttemptedEvents::Events(candidate_list()),
        skipped_deny,
    )
    .await?;

    info!(trigger = DATABASE_TRIGGER_NAME, events = %events.join(","), "Database trigger installed");
    Ok(TriggerInstall::Created(events))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_database_block() {
        let sql = TriggerTemplate::database_block(&["CREATE_TABLE".into(), "DROP_TABLE".into()])
            .render()
            .unwrap();
        assert_eq!(
            sql,
            "CREATE TRIGGER [trg_block_external_db_ops] ON DATABASE FOR CREATE_TABLE, DROP_TABLE AS BEGIN \
             ROLLBACK; THROW 51000, 'External/CLR/external-data features are blocked in this database.', 1; END;"
        );
    }

    #[test]
    fn test_render_server_raiserror_escapes_quotes() {
        let template = TriggerTemplate {
            name: "trg_x".into(),
            scope: TriggerScope::AllServer,
            events: vec!["CREATE_CREDENTIAL".into()],
            body: TriggerBody::RaiseError {
                message: "it's blocked".into(),
            },
        };
        let sql = template.render().unwrap();
        assert!(sql.contains("ON ALL SERVER FOR CREATE_CREDENTIAL"));
        assert!(sql.contains("RAISERROR('it''s blocked', 16, 1);"));
    }

    #[test]
    fn test_render_rejects_bad_slots() {
        let mut template = TriggerTemplate::probe("ok_name", &["CREATE_TABLE"]);
        template.name = "bad]; DROP DATABASE x; --".into();
        assert!(template.render().is_err());

        let template = TriggerTemplate::probe("ok_name", &["CREATE_TABLE; DROP"]);
        assert!(template.render().is_err());

        let template = TriggerTemplate::probe("ok_name", &[]);
        assert!(template.render().is_err());
    }

    #[test]
    fn test_quote_name_doubles_brackets() {
        assert_eq!(quote_name("a]b"), "[a]]b]");
    }

    #[test]
    fn test_drop_if_exists() {
        let sql = drop_if_exists_sql("trg_probe_1", TriggerScope::Database);
        assert_eq!(
            sql,
            "IF EXISTS (SELECT 1 FROM sys.triggers WHERE name = N'trg_probe_1' AND parent_class = 0) \
             DROP TRIGGER [trg_probe_1] ON DATABASE;"
        );
    }

    #[test]
    fn test_filter_events_removes_external() {
        let events: Vec<String> = [
            "CREATE_TABLE",
            "CREATE_EXTERNAL_TABLE",
            "CREATE_EXTERNAL_FILE_FORMAT",
            "ALTER_EXTERNAL_DATA_SOURCE",
            "DROP_PROCEDURE",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        assert_eq!(filter_events(&events), vec!["CREATE_TABLE", "DROP_PROCEDURE"]);
    }

    #[test]
    fn test_trigger_state_health() {
        let healthy = TriggerState {
            object_id: 7,
            is_disabled: false,
            definition_hash: "0xAB".into(),
        };
        assert!(healthy.is_healthy());
        assert!(!TriggerState::default().is_healthy());
        assert!(!TriggerState { is_disabled: true, ..healthy.clone() }.is_healthy());
        assert!(!TriggerState { definition_hash: String::new(), ..healthy }.is_healthy());
    }
}
