//! SQL Server session backed by tiberius.
//!
//! # Security
//! - Passwords are handed to the driver and never logged or stored in errors
//! - Connection errors carry the host and catalog only

use std::borrow::Cow;

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, ColumnData, Config, SqlBrowser, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::{Connector, SqlSession, SqlValue};
use crate::error::{ContainError, SqlError};
use crate::options::{AuthMode, HardenerOptions};

/// Default SQL Server TCP port.
pub const DEFAULT_PORT: u16 = 1433;

impl ToSql for SqlValue {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Self::Null => ColumnData::String(None),
            Self::Int(v) => ColumnData::I64(Some(*v)),
            Self::Bool(v) => ColumnData::Bit(Some(*v)),
            Self::Text(v) => ColumnData::String(Some(Cow::Borrowed(v.as_str()))),
        }
    }
}

fn map_error(error: tiberius::error::Error) -> SqlError {
    match error {
        tiberius::error::Error::Server(token) => SqlError::server(token.code(), token.message()),
        other => SqlError::client(other.to_string()),
    }
}

fn column_value(data: ColumnData<'static>) -> Result<SqlValue, SqlError> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| SqlValue::Int(i64::from(v))),
        ColumnData::I16(v) => v.map(|v| SqlValue::Int(i64::from(v))),
        ColumnData::I32(v) => v.map(|v| SqlValue::Int(i64::from(v))),
        ColumnData::I64(v) => v.map(SqlValue::Int),
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::String(v) => v.map(|v| SqlValue::Text(v.into_owned())),
        ColumnData::F32(v) => v.map(|v| SqlValue::Text(v.to_string())),
        ColumnData::F64(v) => v.map(|v| SqlValue::Text(v.to_string())),
        ColumnData::Guid(v) => v.map(|v| SqlValue::Text(v.to_string())),
        ColumnData::Binary(v) => v.map(|bytes| {
            let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
            SqlValue::Text(format!("0x{}", hex))
        }),
        other => {
            return Err(SqlError::client(format!(
                "unsupported scalar column type: {:?}",
                other
            )));
        }
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// Splits `host`, `host,port` and `host\instance` forms.
///
/// Returns `(host, port, instance)`. A `tcp:` prefix and the `.`/`(local)`
/// aliases are accepted.
pub fn parse_server(server: &str) -> (String, Option<u16>, Option<String>) {
    let server = server.trim();
    let server = server.strip_prefix("tcp:").unwrap_or(server);

    let (address, port) = match server.rsplit_once(',') {
        Some((address, port)) => (address, port.trim().parse().ok()),
        None => (server, None),
    };

    let (host, instance) = match address.split_once('\\') {
        Some((host, instance)) if !instance.is_empty() => (host, Some(instance.to_string())),
        Some((host, _)) => (host, None),
        None => (address, None),
    };

    let host = match host.trim() {
        "." | "(local)" | "" => "localhost".to_string(),
        other => other.to_string(),
    };

    (host, port, instance)
}

/// Builds sessions from [`HardenerOptions`].
#[derive(Debug, Clone)]
pub struct TiberiusConnector {
    options: HardenerOptions,
}

impl TiberiusConnector {
    /// Creates a connector for the server described by `options`.
    pub fn new(options: &HardenerOptions) -> Self {
        Self {
            options: options.clone(),
        }
    }

    fn config(&self, catalog: &str) -> crate::Result<(Config, bool)> {
        let (host, port, instance) = parse_server(&self.options.server);
        let mut config = Config::new();
        config.host(&host);
        config.application_name("sqlcontain");

        let named = instance.is_some() && self.options.port.is_none() && port.is_none();
        if let Some(instance) = instance {
            config.instance_name(instance);
        }
        config.port(self.options.port.or(port).unwrap_or(DEFAULT_PORT));

        if !catalog.is_empty() {
            config.database(catalog);
        }

        match self.options.auth {
            AuthMode::Sql => {
                config.authentication(AuthMethod::sql_server(
                    self.options.credentials.username(),
                    self.options.credentials.password(),
                ));
            }
            #[cfg(windows)]
            AuthMode::Trusted => config.authentication(AuthMethod::Integrated),
            #[cfg(not(windows))]
            AuthMode::Trusted => {
                return Err(ContainError::configuration(
                    "auth",
                    "Trusted authentication is only available on Windows; use SQL authentication.",
                ));
            }
        }

        if self.options.trust_server_certificate {
            config.trust_cert();
        }

        Ok((config, named))
    }
}

#[async_trait]
impl Connector for TiberiusConnector {
    async fn connect(&self, catalog: &str) -> crate::Result<Box<dyn SqlSession>> {
        let (config, named) = self.config(catalog)?;
        let context = format!("{} (catalog '{}')", self.options.server, catalog);

        let connecting = async {
            let tcp = if named {
                TcpStream::connect_named(&config).await.map_err(|e| {
                    ContainError::connection_failed(format!("Failed to resolve instance {}", context), e)
                })?
            } else {
                TcpStream::connect(config.get_addr()).await.map_err(|e| {
                    ContainError::connection_failed(format!("Failed to connect to {}", context), e)
                })?
            };

            tcp.set_nodelay(true).map_err(|e| {
                ContainError::connection_failed(format!("Failed to configure socket for {}", context), e)
            })?;

            Client::connect(config, tcp.compat_write())
                .await
                .map_err(|e| ContainError::connection_failed(format!("Login failed for {}", context), e))
        };

        let client = tokio::time::timeout(self.options.connect_timeout, connecting)
            .await
            .map_err(|e| {
                ContainError::connection_failed(format!("Timed out connecting to {}", context), e)
            })??;

        let mut session = TiberiusSession {
            client,
            database: None,
            catalog: (!catalog.is_empty()).then(|| catalog.to_string()),
        };

        let current = session
            .query_scalar("SELECT DB_NAME();", &[])
            .await
            .map_err(|e| ContainError::execution("Failed to read current database", "SELECT DB_NAME();", e))?;
        if let Some(SqlValue::Text(name)) = current {
            session.database = Some(name);
        }

        tracing::debug!(
            server = %self.options.server,
            database = session.database.as_deref().unwrap_or(""),
            "Connected to SQL Server"
        );

        Ok(Box::new(session))
    }
}

/// A single tiberius connection.
pub struct TiberiusSession {
    client: Client<Compat<TcpStream>>,
    database: Option<String>,
    catalog: Option<String>,
}

impl std::fmt::Debug for TiberiusSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiberiusSession")
            .field("database", &self.database)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SqlSession for TiberiusSession {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<(), SqlError> {
        if params.is_empty() {
            self.client
                .simple_query(sql)
                .await
                .map_err(map_error)?
                .into_results()
                .await
                .map_err(map_error)?;
        } else {
            let params: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
            self.client.execute(sql, &params).await.map_err(map_error)?;
        }
        Ok(())
    }

    async fn query_scalar(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlValue>, SqlError> {
        let params: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let row = self
            .client
            .query(sql, &params)
            .await
            .map_err(map_error)?
            .into_row()
            .await
            .map_err(map_error)?;

        match row.and_then(|row| row.into_iter().next()) {
            Some(data) => column_value(data).map(Some),
            None => Ok(None),
        }
    }

    fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    fn connection_catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }
}
