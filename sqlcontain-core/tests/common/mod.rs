//! In-memory SQL Server stand-in for integration tests.
//!
//! Recognizes exactly the statement shapes the engine emits: transactions,
//! DDL triggers, DENY grants, `sp_configure`, the database pre-hardening
//! batch and the catalog queries used for verification. Every statement is
//! recorded so tests can assert on what reached the server.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sqlcontain_core::{CancellationToken, Connector, ContainError, SqlError, SqlSession, SqlValue};
use tokio::task::JoinHandle;

/// A trigger in the fake catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeTrigger {
    pub object_id: i64,
    pub events: Vec<String>,
    pub definition: String,
    pub disabled: bool,
}

/// Per-database state.
#[derive(Debug, Clone, Default)]
pub struct FakeDatabase {
    pub triggers: BTreeMap<String, FakeTrigger>,
    pub denies: HashSet<String>,
    pub pre_hardened: bool,
}

/// One statement that reached the server.
#[derive(Debug, Clone)]
pub struct Executed {
    pub database: String,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Whole-server state, shared by all sessions.
#[derive(Debug)]
pub struct ServerState {
    pub databases: HashMap<String, FakeDatabase>,
    pub server_triggers: BTreeMap<String, FakeTrigger>,
    pub config: BTreeMap<String, i32>,
    pub sysadmin: bool,
    /// Trigger events rejected by CREATE TRIGGER
    pub unsupported_events: HashSet<String>,
    /// DENY permissions rejected with error 102
    pub unsupported_denies: HashSet<String>,
    /// Unsupported DENYs that still land in the catalog
    pub alternate_path_denies: HashSet<String>,
    /// DENY permissions rejected with a permission error
    pub failing_denies: HashSet<String>,
    /// `sp_configure` options that do not exist
    pub failing_config: HashSet<String>,
    /// Permission catalog queries fail
    pub fail_deny_verification: bool,
    /// Newly created triggers start disabled
    pub disable_created_triggers: bool,
    /// Newly created triggers have no readable definition
    pub blank_definitions: bool,
    /// ROLLBACK does not undo trigger creation
    pub ignore_rollback: bool,
    /// Statements starting with this prefix never complete
    pub stall_on: Option<String>,
    pub next_object_id: i64,
    pub log: Vec<Executed>,
    pub connects: Vec<String>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            databases: HashMap::from([("master".to_string(), FakeDatabase::default())]),
            server_triggers: BTreeMap::new(),
            config: BTreeMap::new(),
            sysadmin: true,
            unsupported_events: ["INSERT", "UPDATE", "DELETE"].iter().map(ToString::to_string).collect(),
            unsupported_denies: HashSet::new(),
            alternate_path_denies: HashSet::new(),
            failing_denies: HashSet::new(),
            failing_config: HashSet::new(),
            fail_deny_verification: false,
            disable_created_triggers: false,
            blank_definitions: false,
            ignore_rollback: false,
            stall_on: None,
            next_object_id: 1000,
            log: Vec::new(),
            connects: Vec::new(),
        }
    }
}

/// Cloneable handle to one fake server.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(self, name: &str) -> Self {
        self.state()
            .databases
            .insert(name.to_ascii_lowercase(), FakeDatabase::default());
        self
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().expect("fake server state poisoned")
    }

    /// A session that reports `database` as current and was opened with it.
    pub fn session(&self, database: &str) -> FakeSession {
        FakeSession {
            server: self.clone(),
            database: database.to_string(),
            reported: Some(database.to_string()),
            catalog: Some(database.to_string()),
            snapshot: None,
        }
    }

    /// A session on `database` with explicit reported and configured catalogs.
    pub fn session_reporting(&self, database: &str, reported: Option<&str>, catalog: Option<&str>) -> FakeSession {
        FakeSession {
            server: self.clone(),
            database: database.to_string(),
            reported: reported.map(ToString::to_string),
            catalog: catalog.map(ToString::to_string),
            snapshot: None,
        }
    }

    pub fn database(&self, name: &str) -> FakeDatabase {
        self.state()
            .databases
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.state().log.iter().map(|e| e.sql.clone()).collect()
    }

    pub fn count_executed(&self, prefix: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|e| starts_with_ignore_case(&e.sql, prefix))
            .count()
    }

    pub fn probe_triggers_left(&self, database: &str) -> Vec<String> {
        self.database(database)
            .triggers
            .keys()
            .filter(|name| name.contains("_probe_"))
            .cloned()
            .collect()
    }

    pub fn connects(&self) -> Vec<String> {
        self.state().connects.clone()
    }

    /// Makes statements starting with `prefix` hang until dropped.
    pub fn stall_on(self, prefix: &str) -> Self {
        self.state().stall_on = Some(prefix.to_string());
        self
    }

    /// Cancels `cancel` once a statement starting with `prefix` has arrived.
    pub fn cancel_when_executed(&self, prefix: &str, cancel: &CancellationToken) -> JoinHandle<()> {
        let server = self.clone();
        let prefix = prefix.to_string();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while server.count_executed(&prefix) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        })
    }
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.to_ascii_uppercase().starts_with(&prefix.to_ascii_uppercase())
}

#[async_trait]
impl Connector for FakeServer {
    async fn connect(&self, catalog: &str) -> sqlcontain_core::Result<Box<dyn SqlSession>> {
        let mut state = self.state();
        state.connects.push(catalog.to_string());
        if !state.databases.contains_key(&catalog.to_ascii_lowercase()) {
            return Err(ContainError::connection_failed(
                format!("Cannot open database '{}'", catalog),
                std::io::Error::new(std::io::ErrorKind::NotFound, "login failed"),
            ));
        }
        drop(state);
        Ok(Box::new(self.session(catalog)))
    }
}

/// A session bound to one database of a [`FakeServer`].
#[derive(Debug)]
pub struct FakeSession {
    server: FakeServer,
    database: String,
    reported: Option<String>,
    catalog: Option<String>,
    snapshot: Option<BTreeMap<String, FakeTrigger>>,
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}

fn text_param(params: &[SqlValue]) -> String {
    match params.first() {
        Some(SqlValue::Text(t)) => t.clone(),
        _ => String::new(),
    }
}

fn int_param(params: &[SqlValue]) -> i64 {
    match params.first() {
        Some(SqlValue::Int(v)) => *v,
        _ => 0,
    }
}

fn hash_of(definition: &str) -> Option<SqlValue> {
    if definition.is_empty() {
        return Some(SqlValue::Null);
    }
    let mut hasher = DefaultHasher::new();
    definition.hash(&mut hasher);
    Some(SqlValue::Text(format!("0x{:016X}", hasher.finish())))
}

impl FakeSession {
    fn create_trigger(&mut self, state: &mut ServerState, sql: &str) -> Result<(), SqlError> {
        let name = between(sql, "[", "]").unwrap_or_default().to_string();
        let server_scope = sql.contains(" ON ALL SERVER ");
        let events: Vec<String> = between(sql, " FOR ", " AS BEGIN")
            .unwrap_or_default()
            .split(", ")
            .map(|e| e.trim().to_string())
            .collect();

        if let Some(bad) = events.iter().find(|e| state.unsupported_events.contains(*e)) {
            return Err(SqlError::server(1084, format!("'{}' is an invalid event type.", bad)));
        }

        let trigger = FakeTrigger {
            object_id: state.next_object_id,
            events,
            definition: if state.blank_definitions { String::new() } else { sql.to_string() },
            disabled: state.disable_created_triggers,
        };

        let triggers = if server_scope {
            &mut state.server_triggers
        } else {
            &mut state
                .databases
                .entry(self.database.to_ascii_lowercase())
                .or_default()
                .triggers
        };

        if triggers.contains_key(&name) {
            return Err(SqlError::server(
                2714,
                format!("There is already an object named '{}' in the database.", name),
            ));
        }
        triggers.insert(name, trigger);
        state.next_object_id += 1;
        Ok(())
    }

    fn deny(state: &mut ServerState, db: &mut FakeDatabase, sql: &str) -> Result<(), SqlError> {
        let upper = sql.to_ascii_uppercase();
        let permission = between(&upper, "DENY ", " TO PUBLIC").unwrap_or_default().to_string();

        if state.failing_denies.contains(&permission) {
            return Err(SqlError::server(4613, "Grantor does not have GRANT permission."));
        }
        if state.unsupported_denies.contains(&permission) {
            if state.alternate_path_denies.contains(&permission) {
                db.denies.insert(permission);
            }
            return Err(SqlError::server(102, "Incorrect syntax near 'EXTERNAL'."));
        }
        db.denies.insert(permission);
        Ok(())
    }
}

#[async_trait]
impl SqlSession for FakeSession {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<(), SqlError> {
        let stalled = {
            let mut state = self.server.state();
            state.log.push(Executed {
                database: self.database.clone(),
                sql: sql.to_string(),
                params: params.to_vec(),
            });
            state
                .stall_on
                .as_deref()
                .is_some_and(|prefix| starts_with_ignore_case(sql.trim(), prefix))
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let server = self.server.clone();
        let mut state = server.state();

        let sql = sql.trim();
        let upper = sql.to_ascii_uppercase();
        let key = self.database.to_ascii_lowercase();

        if upper.starts_with("BEGIN TRAN") {
            self.snapshot = Some(state.databases.entry(key).or_default().triggers.clone());
            return Ok(());
        }

        if upper.starts_with("IF XACT_STATE() <> 0 ROLLBACK") {
            if let Some(snapshot) = self.snapshot.take() {
                if !state.ignore_rollback {
                    state.databases.entry(key).or_default().triggers = snapshot;
                }
            }
            return Ok(());
        }

        if upper.starts_with("IF EXISTS (SELECT 1 FROM SYS.TRIGGERS") {
            let name = between(sql, "N'", "'").unwrap_or_default();
            state.databases.entry(key).or_default().triggers.remove(name);
            return Ok(());
        }

        if upper.starts_with("IF EXISTS (SELECT 1 FROM SYS.SERVER_TRIGGERS") {
            let name = between(sql, "N'", "'").unwrap_or_default().to_string();
            state.server_triggers.remove(&name);
            return Ok(());
        }

        if upper.starts_with("CREATE TRIGGER") {
            return self.create_trigger(&mut state, sql);
        }

        if upper.starts_with("DENY ") {
            let mut db = state.databases.remove(&key).unwrap_or_default();
            let result = Self::deny(&mut state, &mut db, sql);
            state.databases.insert(key, db);
            return result;
        }

        if upper.starts_with("EXEC SP_CONFIGURE N'") {
            let option = between(sql, "N'", "'").unwrap_or_default().to_string();
            if state.failing_config.contains(&option) {
                return Err(SqlError::server(
                    15123,
                    format!("The configuration option '{}' does not exist, or it may be an advanced option.", option),
                ));
            }
            let value = between(sql, "', ", ";")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(-1);
            state.config.insert(option, value);
            return Ok(());
        }

        if upper.starts_with("IF DB_ID(@P1) IS NULL") {
            let name = text_param(params).to_ascii_lowercase();
            return match state.databases.get_mut(&name) {
                Some(db) => {
                    db.pre_hardened = true;
                    Ok(())
                }
                None => Err(SqlError::server(51000, "Database not found.")),
            };
        }

        Ok(())
    }

    async fn query_scalar(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlValue>, SqlError> {
        let server = self.server.clone();
        let mut state = server.state();
        let upper = sql.trim().to_ascii_uppercase();
        let key = self.database.to_ascii_lowercase();
        let db = state.databases.entry(key).or_default().clone();

        if upper.starts_with("SELECT DB_NAME()") {
            return Ok(self.reported.clone().map(SqlValue::Text));
        }

        if upper.contains("IS_SRVROLEMEMBER") {
            return Ok(Some(SqlValue::Int(i64::from(state.sysadmin))));
        }

        if upper.contains("SYS.DATABASE_PERMISSIONS") {
            if state.fail_deny_verification {
                return Err(SqlError::server(229, "The SELECT permission was denied."));
            }
            let permission = text_param(params).to_ascii_uppercase();
            return Ok(Some(SqlValue::Int(i64::from(db.denies.contains(&permission)))));
        }

        if upper.starts_with("SELECT OBJECT_ID FROM SYS.TRIGGERS") {
            let name = text_param(params);
            return Ok(db.triggers.get(&name).map(|t| SqlValue::Int(t.object_id)));
        }

        if upper.starts_with("SELECT OBJECT_ID FROM SYS.SERVER_TRIGGERS") {
            let name = text_param(params);
            return Ok(state.server_triggers.get(&name).map(|t| SqlValue::Int(t.object_id)));
        }

        let id = int_param(params);
        let by_id = |triggers: &BTreeMap<String, FakeTrigger>| triggers.values().find(|t| t.object_id == id).cloned();

        if upper.contains("IS_DISABLED") && upper.contains("SYS.TRIGGERS") {
            return Ok(by_id(&db.triggers).map(|t| SqlValue::Int(i64::from(t.disabled))));
        }

        if upper.contains("IS_DISABLED") && upper.contains("SYS.SERVER_TRIGGERS") {
            return Ok(by_id(&state.server_triggers).map(|t| SqlValue::Int(i64::from(t.disabled))));
        }

        if upper.contains("OBJECT_DEFINITION") {
            return Ok(by_id(&db.triggers).and_then(|t| hash_of(&t.definition)).or(Some(SqlValue::Null)));
        }

        if upper.contains("SYS.SERVER_SQL_MODULES") {
            return Ok(by_id(&state.server_triggers).and_then(|t| hash_of(&t.definition)));
        }

        Err(SqlError::server(208, format!("Invalid object name in '{}'.", sql)))
    }

    fn database(&self) -> Option<&str> {
        self.reported.as_deref()
    }

    fn connection_catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }
}
