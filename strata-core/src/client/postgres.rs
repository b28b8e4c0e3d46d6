//! Stateful socket backend: a single tokio-postgres connection with TLS support,
//! connect retries, and an explicit close.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Client;

use super::{redact_connection_string, DatabaseClient, Row, SqlValue};
use crate::config::{DatabaseConfig, SslMode};
use crate::error::{format_db_error, Result, StrataError};

/// Client holding one long-lived PostgreSQL connection.
pub struct PgClient {
    client: Client,
    connection_task: JoinHandle<()>,
}

impl PgClient {
    /// Connect, retrying up to `connect_retries` times with exponential backoff + jitter.
    ///
    /// Each retry waits `min(2^attempt, 30) + rand(0..1000ms)` before the next attempt.
    /// Permanent errors (authentication failures) are not retried.
    pub async fn connect(conn_string: &str, config: &DatabaseConfig) -> Result<Self> {
        let retries = config.connect_retries;
        let mut last_err = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                let base_delay = std::cmp::min(1u64 << attempt, 30);
                let jitter_ms = rand::thread_rng().gen_range(0..1000);
                let delay = std::time::Duration::from_secs(base_delay)
                    + std::time::Duration::from_millis(jitter_ms);
                tracing::info!(
                    attempt = attempt + 1,
                    max_attempts = retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }

            match connect_once(conn_string, &config.ssl_mode, config.connect_timeout_secs).await {
                Ok((client, connection_task)) => {
                    if attempt > 0 {
                        tracing::info!(
                            attempt = attempt + 1,
                            max_attempts = retries + 1,
                            "Connected successfully after retry"
                        );
                    }

                    if config.statement_timeout_secs > 0 {
                        let timeout_sql = format!(
                            "SET statement_timeout = '{}s'",
                            config.statement_timeout_secs
                        );
                        client.batch_execute(&timeout_sql).await?;
                    }

                    return Ok(Self {
                        client,
                        connection_task,
                    });
                }
                Err(e) => {
                    if is_permanent_error(&e) {
                        tracing::error!(error = %e, "Permanent connection error, not retrying");
                        return Err(StrataError::DatabaseError(e));
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(StrataError::Connection {
            target: redact_connection_string(conn_string),
            reason: last_err
                .as_ref()
                .map(format_db_error)
                .unwrap_or_else(|| "no connection attempt was made".to_string()),
        })
    }

    /// Drop the client and wait for the connection task to wind down.
    pub async fn close(self) {
        drop(self.client);
        if let Err(e) = self.connection_task.await {
            tracing::warn!(error = %e, "Database connection task did not shut down cleanly");
        }
    }
}

#[async_trait]
impl DatabaseClient for PgClient {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let owned = to_sql_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self.client.query(sql, &refs).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute_raw(&self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }
}

fn to_sql_params(params: &[SqlValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|p| -> Box<dyn ToSql + Sync + Send> {
            match p {
                SqlValue::Null => Box::new(None::<String>),
                SqlValue::Bool(b) => Box::new(*b),
                SqlValue::Int(n) => Box::new(*n),
                SqlValue::Text(s) => Box::new(s.clone()),
                SqlValue::Timestamp(t) => Box::new(*t),
            }
        })
        .collect()
}

fn decode_row(row: &tokio_postgres::Row) -> Result<Row> {
    let mut columns = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?.map(|v| SqlValue::Int(v.into()))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?.map(|v| SqlValue::Int(v.into()))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?.map(SqlValue::Timestamp)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|t| SqlValue::Timestamp(t.and_utc()))
        } else if *ty == Type::TEXT
            || *ty == Type::VARCHAR
            || *ty == Type::BPCHAR
            || *ty == Type::NAME
            || *ty == Type::UNKNOWN
        {
            row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
        } else {
            return Err(StrataError::Decode {
                column: column.name().to_string(),
                reason: format!("unsupported column type '{}'; cast it to text", ty.name()),
            });
        };
        columns.push((column.name().to_string(), value.unwrap_or(SqlValue::Null)));
    }
    Ok(Row::new(columns))
}

/// Build a rustls ClientConfig using the Mozilla CA bundle.
fn make_rustls_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Check if a postgres error is a permanent authentication failure that should not be retried.
fn is_permanent_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = e.as_db_error() {
        let code = db_err.code().code();
        // 28P01 = invalid_password, 28000 = invalid_authorization_specification
        return code == "28P01" || code == "28000";
    }
    false
}

fn spawn_connection<F>(connection: F) -> JoinHandle<()>
where
    F: Future<Output = std::result::Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "Database connection error");
        }
    })
}

/// Connect once, honoring the SSL mode and connect timeout.
async fn connect_once(
    conn_string: &str,
    ssl_mode: &SslMode,
    connect_timeout_secs: u32,
) -> std::result::Result<(Client, JoinHandle<()>), tokio_postgres::Error> {
    let connect_fut = async {
        match ssl_mode {
            SslMode::Disable => {
                let (client, connection) =
                    tokio_postgres::connect(conn_string, tokio_postgres::NoTls).await?;
                Ok((client, spawn_connection(connection)))
            }
            SslMode::Require => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_rustls_config());
                let (client, connection) = tokio_postgres::connect(conn_string, tls).await?;
                Ok((client, spawn_connection(connection)))
            }
            SslMode::Prefer => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_rustls_config());
                match tokio_postgres::connect(conn_string, tls).await {
                    Ok((client, connection)) => Ok((client, spawn_connection(connection))),
                    Err(_) => {
                        tracing::debug!("TLS connection failed, falling back to plaintext");
                        let (client, connection) =
                            tokio_postgres::connect(conn_string, tokio_postgres::NoTls).await?;
                        Ok((client, spawn_connection(connection)))
                    }
                }
            }
        }
    };

    if connect_timeout_secs > 0 {
        match tokio::time::timeout(
            std::time::Duration::from_secs(connect_timeout_secs as u64),
            connect_fut,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(tokio_postgres::Error::__private_api_timeout()),
        }
    } else {
        connect_fut.await
    }
}
