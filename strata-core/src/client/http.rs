//! Stateless SQL-over-HTTP backend.
//!
//! Every call is one independent `POST` carrying a single statement, so there
//! is no session, no transaction, and nothing to close. The wire format is the
//! serverless Postgres HTTP protocol: the connection string travels in the
//! `Neon-Connection-String` header, rows come back in array mode as raw text
//! and are decoded by the type OID of each field.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{connection_host, DatabaseClient, Row, SqlValue};
use crate::config::DatabaseConfig;
use crate::error::{Result, StrataError};

const CONNECTION_STRING_HEADER: &str = "Neon-Connection-String";
const ARRAY_MODE_HEADER: &str = "Neon-Array-Mode";
const RAW_TEXT_HEADER: &str = "Neon-Raw-Text-Output";

// PostgreSQL type OIDs decoded into typed values; everything else stays text.
const OID_BOOL: u32 = 16;
const OID_INT8: u32 = 20;
const OID_INT2: u32 = 21;
const OID_INT4: u32 = 23;
const OID_TIMESTAMP: u32 = 1114;
const OID_TIMESTAMPTZ: u32 = 1184;

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    fields: Vec<FieldDescription>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct FieldDescription {
    name: String,
    #[serde(rename = "dataTypeID", default)]
    data_type_id: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// Client issuing one HTTP request per statement.
pub struct HttpClient {
    http: reqwest::Client,
    endpoint: Url,
    connection_string: String,
}

impl HttpClient {
    /// Build a client for the given connection string.
    ///
    /// The endpoint is `https://{host}/sql` unless `http_endpoint` overrides it.
    pub fn new(conn_string: &str, config: &DatabaseConfig) -> Result<Self> {
        let endpoint = match config.http_endpoint.as_deref() {
            Some(endpoint) => Url::parse(endpoint).map_err(|e| {
                StrataError::ConfigError(format!("Invalid HTTP endpoint '{}': {}", endpoint, e))
            })?,
            None => default_endpoint(conn_string)?,
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ARRAY_MODE_HEADER, HeaderValue::from_static("true"));
        headers.insert(RAW_TEXT_HEADER, HeaderValue::from_static("true"));

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if config.connect_timeout_secs > 0 {
            builder = builder.connect_timeout(Duration::from_secs(config.connect_timeout_secs as u64));
        }
        if config.statement_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.statement_timeout_secs as u64));
        }

        Ok(Self {
            http: builder.build()?,
            endpoint,
            connection_string: conn_string.to_string(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResponse> {
        let body = QueryRequest {
            query: sql,
            params: params.iter().map(encode_param).collect(),
        };

        tracing::debug!(endpoint = %self.endpoint, params = params.len(), "Sending statement over HTTP");

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(CONNECTION_STRING_HEADER, &self.connection_string)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let (message, code) = match serde_json::from_str::<ErrorResponse>(&text) {
                Ok(err) => (err.message, err.code),
                Err(_) if text.trim().is_empty() => (status.to_string(), None),
                Err(_) => (text, None),
            };
            return Err(StrataError::Server {
                status: status.as_u16(),
                code,
                message,
            });
        }

        Ok(response.json::<QueryResponse>().await?)
    }

    fn transport_error(&self, e: reqwest::Error) -> StrataError {
        if e.is_connect() || e.is_timeout() {
            StrataError::Connection {
                target: self.endpoint.to_string(),
                reason: e.to_string(),
            }
        } else {
            StrataError::HttpError(e)
        }
    }
}

#[async_trait]
impl DatabaseClient for HttpClient {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let response = self.post(sql, params).await?;
        response
            .rows
            .into_iter()
            .map(|row| decode_row(&response.fields, row))
            .collect()
    }

    async fn execute_raw(&self, sql: &str) -> Result<()> {
        self.post(sql, &[]).await?;
        Ok(())
    }
}

fn default_endpoint(conn_string: &str) -> Result<Url> {
    let host = connection_host(conn_string).ok_or_else(|| {
        StrataError::ConfigError(
            "Cannot derive an HTTP endpoint: connection string has no host. Set http_endpoint."
                .to_string(),
        )
    })?;
    Url::parse(&format!("https://{}/sql", host)).map_err(|e| {
        StrataError::ConfigError(format!("Invalid HTTP endpoint for host '{}': {}", host, e))
    })
}

/// Parameters travel as text (or null); the server casts them.
fn encode_param(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::String(b.to_string()),
        SqlValue::Int(n) => Value::String(n.to_string()),
        SqlValue::Text(s) => Value::String(s.clone()),
        SqlValue::Timestamp(t) => Value::String(t.to_rfc3339()),
    }
}

fn decode_row(fields: &[FieldDescription], cells: Vec<Value>) -> Result<Row> {
    if cells.len() != fields.len() {
        return Err(StrataError::Decode {
            column: "*".to_string(),
            reason: format!(
                "row has {} values but {} fields were described",
                cells.len(),
                fields.len()
            ),
        });
    }
    let columns = fields
        .iter()
        .zip(cells)
        .map(|(field, cell)| {
            decode_value(field, cell).map(|value| (field.name.clone(), value))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns))
}

fn decode_value(field: &FieldDescription, cell: Value) -> Result<SqlValue> {
    let text = match cell {
        Value::Null => return Ok(SqlValue::Null),
        Value::Bool(b) => return Ok(SqlValue::Bool(b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => return Ok(SqlValue::Int(i)),
            None => n.to_string(),
        },
        Value::String(s) => s,
        other => other.to_string(),
    };

    let bad = |expected: &str| StrataError::Decode {
        column: field.name.clone(),
        reason: format!("cannot parse '{}' as {}", text, expected),
    };

    match field.data_type_id {
        OID_BOOL => match text.as_str() {
            "t" | "true" => Ok(SqlValue::Bool(true)),
            "f" | "false" => Ok(SqlValue::Bool(false)),
            _ => Err(bad("bool")),
        },
        OID_INT2 | OID_INT4 | OID_INT8 => {
            text.parse::<i64>().map(SqlValue::Int).map_err(|_| bad("integer"))
        }
        OID_TIMESTAMPTZ => parse_timestamptz(&text)
            .map(SqlValue::Timestamp)
            .ok_or_else(|| bad("timestamptz")),
        OID_TIMESTAMP => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
            .map(|t| SqlValue::Timestamp(t.and_utc()))
            .map_err(|_| bad("timestamp")),
        _ => Ok(SqlValue::Text(text)),
    }
}

fn parse_timestamptz(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
