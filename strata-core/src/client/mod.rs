//! Database client abstraction over the stateful socket backend and the
//! stateless HTTP backend.
//!
//! Everything above this module talks to a `&dyn DatabaseClient`, which has
//! exactly two operations: parameterized `query` for state-store reads and
//! writes, and `execute_raw` for one complete DDL statement.

pub mod http;
pub mod postgres;

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{BackendPreference, DatabaseConfig};
use crate::error::{Result, StrataError};

pub use self::http::HttpClient;
pub use self::postgres::PgClient;

/// A single SQL value, used both for bound parameters and decoded row cells.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A decoded result row: column names paired with values, in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn require(&self, column: &str) -> Result<&SqlValue> {
        self.get(column).ok_or_else(|| StrataError::Decode {
            column: column.to_string(),
            reason: "column not present in result".to_string(),
        })
    }

    pub fn get_opt_string(&self, column: &str) -> Result<Option<String>> {
        match self.require(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            SqlValue::Int(n) => Ok(Some(n.to_string())),
            SqlValue::Bool(b) => Ok(Some(b.to_string())),
            SqlValue::Timestamp(t) => Ok(Some(t.to_rfc3339())),
        }
    }

    pub fn get_string(&self, column: &str) -> Result<String> {
        self.get_opt_string(column)?.ok_or_else(|| StrataError::Decode {
            column: column.to_string(),
            reason: "unexpected NULL".to_string(),
        })
    }

    pub fn get_bool(&self, column: &str) -> Result<bool> {
        match self.require(column)? {
            SqlValue::Bool(b) => Ok(*b),
            other => Err(decode_mismatch(column, "bool", other)),
        }
    }

    pub fn get_i64(&self, column: &str) -> Result<i64> {
        match self.require(column)? {
            SqlValue::Int(n) => Ok(*n),
            other => Err(decode_mismatch(column, "integer", other)),
        }
    }

    pub fn get_timestamp(&self, column: &str) -> Result<DateTime<Utc>> {
        match self.require(column)? {
            SqlValue::Timestamp(t) => Ok(*t),
            other => Err(decode_mismatch(column, "timestamp", other)),
        }
    }
}

fn decode_mismatch(column: &str, expected: &str, found: &SqlValue) -> StrataError {
    StrataError::Decode {
        column: column.to_string(),
        reason: format!("expected {}, found {:?}", expected, found),
    }
}

/// The two operations every backend provides.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Run a parameterized query (`$1`, `$2`, ...) and return its rows.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Execute one complete SQL statement with no parameter substitution.
    async fn execute_raw(&self, sql: &str) -> Result<()>;
}

/// Which concrete backend was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Backend {
    /// Stateful socket client (tokio-postgres).
    Postgres,
    /// Stateless SQL-over-HTTP client.
    Http,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Postgres => write!(f, "postgres"),
            Backend::Http => write!(f, "http"),
        }
    }
}

/// Pick a backend for a connection string.
///
/// An explicit preference wins. Otherwise a loopback or unix-socket host, or
/// the use-local flag, selects the socket client; anything else goes over HTTP.
pub fn select_backend(conn_string: &str, config: &DatabaseConfig) -> Backend {
    match config.backend {
        BackendPreference::Postgres => Backend::Postgres,
        BackendPreference::Http => Backend::Http,
        BackendPreference::Auto => {
            if config.use_local {
                return Backend::Postgres;
            }
            match connection_host(conn_string) {
                Some(host) if is_local_host(&host) => Backend::Postgres,
                _ => Backend::Http,
            }
        }
    }
}

/// Extract the host from a URL or key/value connection string.
pub fn connection_host(conn_string: &str) -> Option<String> {
    if conn_string.contains("://") {
        let url = url::Url::parse(conn_string).ok()?;
        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            return Some(host.trim_matches(|c| c == '[' || c == ']').to_string());
        }
        // postgres:///db?host=/var/run/postgresql
        return url
            .query_pairs()
            .find(|(k, _)| k == "host")
            .map(|(_, v)| v.into_owned());
    }

    conn_string
        .split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "host" || *k == "hostaddr")
        .map(|(_, v)| v.trim_matches('\'').to_string())
}

fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") || host.starts_with('/') {
        return true;
    }
    host.parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Hide credentials in a connection string for logs and error messages.
pub fn redact_connection_string(conn_string: &str) -> String {
    if conn_string.contains("://") {
        if let Ok(mut url) = url::Url::parse(conn_string) {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            return url.to_string();
        }
    }
    conn_string
        .split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some(("password", _)) => "password=****".to_string(),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The open database connection, owned for the whole run.
///
/// The backend is chosen once when the connection is opened; callers only see
/// it through [`Connection::as_client`].
pub enum Connection {
    Postgres(PgClient),
    Http(HttpClient),
}

impl Connection {
    /// Open a connection with the backend chosen by [`select_backend`].
    pub async fn open(conn_string: &str, config: &DatabaseConfig) -> Result<Self> {
        let backend = select_backend(conn_string, config);
        tracing::info!(
            backend = %backend,
            target = %redact_connection_string(conn_string),
            "Opening database connection"
        );
        match backend {
            Backend::Postgres => Ok(Connection::Postgres(
                PgClient::connect(conn_string, config).await?,
            )),
            Backend::Http => Ok(Connection::Http(HttpClient::new(conn_string, config)?)),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Connection::Postgres(_) => Backend::Postgres,
            Connection::Http(_) => Backend::Http,
        }
    }

    pub fn as_client(&self) -> &dyn DatabaseClient {
        match self {
            Connection::Postgres(c) => c as &dyn DatabaseClient,
            Connection::Http(c) => c as &dyn DatabaseClient,
        }
    }

    /// Release the connection. The socket client waits for its connection
    /// task to finish; the HTTP client has nothing to release.
    pub async fn close(self) {
        match self {
            Connection::Postgres(c) => c.close().await,
            Connection::Http(_) => {}
        }
        tracing::debug!("Database connection closed");
    }
}

/// Quote a SQL identifier to prevent SQL injection.
///
/// Doubles any embedded double-quotes and wraps in double-quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validate that a SQL identifier contains only safe characters.
///
/// Returns an error for names with characters outside `[a-zA-Z0-9_]`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StrataError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StrataError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_] are allowed.",
            name
        )));
    }
    Ok(())
}
