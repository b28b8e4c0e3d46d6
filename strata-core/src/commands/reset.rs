//! Drop every managed table and the state store (destructive).

use serde::Serialize;

use crate::client::{quote_ident, redact_connection_string, DatabaseClient};
use crate::config::StrataConfig;
use crate::error::{Result, StrataError};
use crate::history::{self, MigrationLock};

const GATE_MARKERS: &[&str] = &["test", "localhost"];

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    /// Dropped tables, in the order they were dropped.
    pub dropped: Vec<String>,
}

/// Refuse destructive work unless the connection string names a test or local database.
///
/// Pure string check; callers run it before opening a connection.
pub fn check_safety_gate(conn_string: &str) -> Result<()> {
    if GATE_MARKERS.iter().any(|m| conn_string.contains(m)) {
        Ok(())
    } else {
        Err(StrataError::SafetyGateViolation {
            target: redact_connection_string(conn_string),
        })
    }
}

/// Execute the reset command.
///
/// Drops the `[reset] tables` in reverse order (children first), then the
/// state store, then the lock table.
pub async fn execute(
    client: &dyn DatabaseClient,
    config: &StrataConfig,
    conn_string: &str,
) -> Result<ResetReport> {
    check_safety_gate(conn_string)?;

    let schema = &config.migrations.schema;
    let table = &config.migrations.table;

    tracing::warn!(
        target_db = %redact_connection_string(conn_string),
        tables = config.reset.tables.len(),
        "Starting reset, this will DROP all managed tables"
    );

    let lock = MigrationLock::acquire(client, schema, table, config.migrations.lock_timeout_secs).await?;

    let result = drop_all(client, config).await;

    match result {
        Ok(dropped) => {
            lock.release_and_drop(client).await?;
            tracing::info!(dropped = dropped.len(), "Reset completed");
            Ok(ResetReport { dropped })
        }
        Err(e) => {
            if let Err(release_err) = lock.release(client).await {
                tracing::warn!(error = %release_err, "Failed to release migration lock");
            }
            tracing::error!(error = %e, "Reset failed");
            Err(e)
        }
    }
}

async fn drop_all(client: &dyn DatabaseClient, config: &StrataConfig) -> Result<Vec<String>> {
    let mut dropped = Vec::new();

    for name in config.reset.tables.iter().rev() {
        tracing::info!(table = %name, "Dropping table");
        client
            .execute_raw(&format!("DROP TABLE IF EXISTS {} CASCADE", quote_ident(name)))
            .await?;
        dropped.push(name.clone());
    }

    history::drop_history_table(client, &config.migrations.schema, &config.migrations.table).await?;
    dropped.push(format!("{}.{}", config.migrations.schema, config.migrations.table));

    Ok(dropped)
}
