//! Hardening run configuration.
//!
//! [`HardenerOptions`] is built once by the caller, validated once at entry
//! and then passed by reference through the whole run. The engine never
//! mutates it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::error::ContainError;

/// Breadth of a hardening run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Instance-wide configuration and server trigger only
    Instance,
    /// A single database only
    #[default]
    Database,
    /// Instance first, then the database
    Both,
}

impl Scope {
    /// Whether instance-level hardening runs for this scope.
    pub fn includes_instance(self) -> bool {
        matches!(self, Self::Instance | Self::Both)
    }

    /// Whether database-level hardening runs for this scope.
    pub fn includes_database(self) -> bool {
        matches!(self, Self::Database | Self::Both)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Instance => "Instance",
            Self::Database => "Database",
            Self::Both => "Both",
        };
        f.write_str(name)
    }
}

impl FromStr for Scope {
    type Err = ContainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instance" => Ok(Self::Instance),
            "database" => Ok(Self::Database),
            "both" => Ok(Self::Both),
            other => Err(ContainError::configuration(
                "scope",
                format!("unknown scope '{}' (expected Instance, Database or Both)", other),
            )),
        }
    }
}

/// How the privileged connection authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Integrated (Windows) authentication
    #[default]
    Trusted,
    /// SQL login with user name and password
    Sql,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trusted => f.write_str("Trusted"),
            Self::Sql => f.write_str("Sql"),
        }
    }
}

impl FromStr for AuthMode {
    type Err = ContainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trusted" | "integrated" | "windows" => Ok(Self::Trusted),
            "sql" | "credentialed" => Ok(Self::Sql),
            other => Err(ContainError::configuration(
                "auth",
                format!("unknown auth mode '{}' (expected Trusted or Sql)", other),
            )),
        }
    }
}

/// SQL login credentials; both fields are zeroed on drop.
#[derive(Clone, Default)]
pub struct Credentials {
    username: Zeroizing<String>,
    password: Zeroizing<String>,
}

impl Credentials {
    /// Creates new credentials with automatic memory zeroing
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Zeroizing::new(username.into()),
            password: Zeroizing::new(password.into()),
        }
    }

    /// Gets the username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Gets the password for handing to the driver. Never log this.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Checks if a password is present without exposing it
    pub fn has_password(&self) -> bool {
        !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &*self.username)
            .field("password", &"****")
            .finish()
    }
}

/// Options for one hardening invocation.
///
/// # Example
/// ```rust
/// use sqlcontain_core::{HardenerOptions, Scope};
///
/// let options = HardenerOptions::new("localhost")
///     .with_database("AgentSandbox")
///     .with_scope(Scope::Both);
///
/// assert!(options.validate().is_ok());
/// assert_eq!(options.summary(), "Both:AgentSandbox");
/// ```
#[derive(Debug, Clone)]
pub struct HardenerOptions {
    /// Server address: `host`, `host,port` or `host\instance`
    pub server: String,
    /// Optional explicit port (overrides `host,port`)
    pub port: Option<u16>,
    /// Authentication mode
    pub auth: AuthMode,
    /// Target database for database-scope hardening
    pub database: String,
    /// SQL login credentials (used when `auth` is [`AuthMode::Sql`])
    pub credentials: Credentials,
    /// Breadth of the run
    pub scope: Scope,
    /// Only apply the outbound firewall block and return
    pub internal_firewall_only: bool,
    /// Path of the server binary for the firewall rule
    pub sqlservr_path: Option<PathBuf>,
    /// Attempt the elevated firewall step after hardening
    pub firewall: bool,
    /// Tolerate DENY statements that could neither be applied nor confirmed
    pub allow_skipped_deny: bool,
    /// Tolerate an edition that supports no blocking trigger events
    pub allow_missing_trigger: bool,
    /// Reject `USE <other database>` inside executed batches
    pub disallow_use: bool,
    /// Accept the server certificate without validation
    pub trust_server_certificate: bool,
    /// TCP connect and login timeout
    pub connect_timeout: Duration,
}

impl Default for HardenerOptions {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: None,
            auth: AuthMode::Trusted,
            database: String::new(),
            credentials: Credentials::default(),
            scope: Scope::Database,
            internal_firewall_only: false,
            sqlservr_path: None,
            firewall: false,
            allow_skipped_deny: false,
            allow_missing_trigger: false,
            disallow_use: true,
            trust_server_certificate: false,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Display for HardenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HardenerOptions({} {}", self.server, self.scope)?;
        if !self.database.is_empty() {
            write!(f, " [{}]", self.database)?;
        }
        f.write_str(")")
        // Intentionally omit credentials
    }
}

impl HardenerOptions {
    /// Creates options for a server with strict defaults.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Default::default()
        }
    }

    /// Validates the options before any network or database call.
    ///
    /// # Errors
    /// - `server` is blank and `internal_firewall_only` is not set
    /// - `scope` includes the database and `database` is blank
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.trim().is_empty() && !self.internal_firewall_only {
            return Err(ContainError::configuration(
                "server",
                "Server is required unless internal_firewall_only is set.",
            ));
        }

        if self.scope.includes_database() && self.database.trim().is_empty() {
            return Err(ContainError::configuration(
                "database",
                "Database must be specified when the scope includes the database.",
            ));
        }

        if self.port == Some(0) {
            return Err(ContainError::configuration(
                "port",
                "port must be greater than 0",
            ));
        }

        if self.auth == AuthMode::Sql && self.credentials.username().trim().is_empty() {
            return Err(ContainError::configuration(
                "user",
                "A user name is required for SQL authentication.",
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(ContainError::configuration(
                "connect_timeout",
                "connect_timeout must be greater than 0",
            ));
        }

        Ok(())
    }

    /// `"<Scope>:<Database>"`, attached to aggregate failures.
    pub fn summary(&self) -> String {
        format!("{}:{}", self.scope, self.database)
    }

    /// Builder method to set the target database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Builder method to set the scope.
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Builder method to switch to SQL authentication.
    pub fn with_sql_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = AuthMode::Sql;
        self.credentials = Credentials::new(username, password);
        self
    }

    /// Builder method to set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}
