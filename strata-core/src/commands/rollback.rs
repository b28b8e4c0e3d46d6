//! Remove one tracking row. Metadata only: no DDL is reverted.

use serde::Serialize;

use crate::client::DatabaseClient;
use crate::config::StrataConfig;
use crate::error::{Result, StrataError};
use crate::history::{self, MigrationLock};

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub filename: String,
    /// Group of the removed record.
    pub group: String,
}

/// Execute the rollback command.
///
/// Meant for recovering from a partially applied file after the schema has
/// been fixed by hand: the next migrate runs the file again from the top.
pub async fn execute(
    client: &dyn DatabaseClient,
    config: &StrataConfig,
    filename: &str,
) -> Result<RollbackReport> {
    let schema = &config.migrations.schema;
    let table = &config.migrations.table;

    if !history::history_table_exists(client, schema, table).await? {
        return Err(StrataError::RecordNotFound(filename.to_string()));
    }

    let lock = MigrationLock::acquire(client, schema, table, config.migrations.lock_timeout_secs).await?;
    let result = remove(client, config, filename).await;
    if let Err(e) = lock.release(client).await {
        tracing::warn!(error = %e, "Failed to release migration lock");
    }
    result
}

async fn remove(client: &dyn DatabaseClient, config: &StrataConfig, filename: &str) -> Result<RollbackReport> {
    let schema = &config.migrations.schema;
    let table = &config.migrations.table;

    let record = history::find_record(client, schema, table, filename)
        .await?
        .ok_or_else(|| StrataError::RecordNotFound(filename.to_string()))?;

    if !history::delete_record(client, schema, table, filename).await? {
        return Err(StrataError::RecordNotFound(filename.to_string()));
    }

    tracing::warn!(
        filename = %filename,
        group = %record.migration_group,
        "Removed migration record. Objects it created are still in the database"
    );

    Ok(RollbackReport {
        filename: filename.to_string(),
        group: record.migration_group,
    })
}
