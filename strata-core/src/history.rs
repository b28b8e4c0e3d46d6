//! The migration state store and the run lock that guards it.
//!
//! Everything here goes through [`DatabaseClient`], so both backends share one
//! implementation. DDL uses `execute_raw`; reads and writes use `query`.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::client::{quote_ident, DatabaseClient, Row, SqlValue};
use crate::error::{Result, StrataError};

/// Group name recorded when a migration was inserted without one.
pub const DEFAULT_GROUP: &str = "default";

/// A row from the state-store table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationRecord {
    pub filename: String,
    pub applied_at: DateTime<Utc>,
    pub migration_group: String,
    pub checksum: Option<String>,
}

impl MigrationRecord {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            filename: row.get_string("filename")?,
            applied_at: row.get_timestamp("applied_at")?,
            migration_group: row.get_string("migration_group")?,
            checksum: row.get_opt_string("checksum")?,
        })
    }
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn lock_table_name(table: &str) -> String {
    format!("{}_lock", table)
}

/// Create the state-store table if it does not exist.
pub async fn create_history_table(client: &dyn DatabaseClient, schema: &str, table: &str) -> Result<()> {
    if schema != "public" {
        client
            .execute_raw(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
            .await?;
    }

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {fq} (
    id              SERIAL PRIMARY KEY,
    filename        VARCHAR(255) NOT NULL UNIQUE,
    applied_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    migration_group VARCHAR(100) NOT NULL DEFAULT '{group}',
    checksum        VARCHAR(64)
)",
        fq = qualified(schema, table),
        group = DEFAULT_GROUP,
    );
    client.execute_raw(&sql).await
}

/// Check if the state-store table exists.
pub async fn history_table_exists(client: &dyn DatabaseClient, schema: &str, table: &str) -> Result<bool> {
    let rows = client
        .query(
            "SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            ) AS present",
            &[SqlValue::from(schema), SqlValue::from(table)],
        )
        .await?;

    match rows.first() {
        Some(row) => row.get_bool("present"),
        None => Ok(false),
    }
}

/// Look up the record for one filename.
pub async fn find_record(
    client: &dyn DatabaseClient,
    schema: &str,
    table: &str,
    filename: &str,
) -> Result<Option<MigrationRecord>> {
    let sql = format!(
        "SELECT filename, applied_at, migration_group, checksum FROM {} WHERE filename = $1",
        qualified(schema, table)
    );
    let rows = client.query(&sql, &[SqlValue::from(filename)]).await?;
    rows.first().map(MigrationRecord::from_row).transpose()
}

/// All records, oldest first.
pub async fn get_applied_migrations(
    client: &dyn DatabaseClient,
    schema: &str,
    table: &str,
) -> Result<Vec<MigrationRecord>> {
    let sql = format!(
        "SELECT filename, applied_at, migration_group, checksum FROM {} ORDER BY applied_at, id",
        qualified(schema, table)
    );
    let rows = client.query(&sql, &[]).await?;
    rows.iter().map(MigrationRecord::from_row).collect()
}

/// Record a successfully applied migration. `applied_at` is set by the database.
pub async fn insert_record(
    client: &dyn DatabaseClient,
    schema: &str,
    table: &str,
    filename: &str,
    group: &str,
    checksum: Option<&str>,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (filename, migration_group, checksum) VALUES ($1, $2, $3)",
        qualified(schema, table)
    );
    client
        .query(
            &sql,
            &[
                SqlValue::from(filename),
                SqlValue::from(group),
                SqlValue::from(checksum),
            ],
        )
        .await?;
    Ok(())
}

/// Delete the record for one filename. Returns whether a row was removed.
pub async fn delete_record(
    client: &dyn DatabaseClient,
    schema: &str,
    table: &str,
    filename: &str,
) -> Result<bool> {
    let sql = format!(
        "DELETE FROM {} WHERE filename = $1 RETURNING filename",
        qualified(schema, table)
    );
    let rows = client.query(&sql, &[SqlValue::from(filename)]).await?;
    Ok(!rows.is_empty())
}

pub async fn drop_history_table(client: &dyn DatabaseClient, schema: &str, table: &str) -> Result<()> {
    client
        .execute_raw(&format!("DROP TABLE IF EXISTS {}", qualified(schema, table)))
        .await
}

/// A held run lock, stored as a single row in `{table}_lock`.
///
/// Session-scoped advisory locks do not survive between requests on the HTTP
/// backend, so the lock is a row taken with a conditional upsert. A row older
/// than the timeout is treated as abandoned and can be taken over.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    schema: String,
    lock_table: String,
    key: String,
    holder: String,
}

impl MigrationLock {
    /// Create the lock table if needed and take the lock.
    pub async fn acquire(
        client: &dyn DatabaseClient,
        schema: &str,
        table: &str,
        timeout_secs: u64,
    ) -> Result<Self> {
        let lock = Self {
            schema: schema.to_string(),
            lock_table: lock_table_name(table),
            key: table.to_string(),
            holder: holder_id(),
        };
        let fq = qualified(&lock.schema, &lock.lock_table);

        client
            .execute_raw(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
    lock_key    VARCHAR(255) PRIMARY KEY,
    holder      VARCHAR(255) NOT NULL,
    acquired_at TIMESTAMPTZ NOT NULL DEFAULT now()
)",
                fq
            ))
            .await
            .map_err(|e| StrataError::LockError(format!("cannot create lock table {}: {}", fq, e.reason())))?;

        tracing::info!(lock = %lock.key, holder = %lock.holder, "Acquiring migration lock");

        let sql = format!(
            "INSERT INTO {fq} AS l (lock_key, holder, acquired_at) VALUES ($1, $2, now()) \
             ON CONFLICT (lock_key) DO UPDATE SET holder = EXCLUDED.holder, acquired_at = EXCLUDED.acquired_at \
             WHERE l.acquired_at < now() - ($3::bigint * interval '1 second') \
             RETURNING holder",
            fq = fq
        );
        let timeout = i64::try_from(timeout_secs).unwrap_or(i64::MAX);
        let rows = client
            .query(
                &sql,
                &[
                    SqlValue::from(lock.key.as_str()),
                    SqlValue::from(lock.holder.as_str()),
                    SqlValue::Int(timeout),
                ],
            )
            .await
            .map_err(|e| StrataError::LockError(e.reason()))?;

        if rows.is_empty() {
            let current = current_holder(client, &fq, &lock.key).await;
            return Err(StrataError::LockError(format!(
                "another run holds the lock on {}{}; retry once it finishes or wait {}s for it to expire",
                lock.key,
                current.map(|h| format!(" (holder {})", h)).unwrap_or_default(),
                timeout_secs
            )));
        }

        Ok(lock)
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Bump `acquired_at` so a long run is not mistaken for an abandoned one.
    ///
    /// Fails if another runner has taken the lock over in the meantime.
    pub async fn refresh(&self, client: &dyn DatabaseClient) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET acquired_at = now() WHERE lock_key = $1 AND holder = $2 RETURNING lock_key",
            qualified(&self.schema, &self.lock_table)
        );
        let rows = client
            .query(
                &sql,
                &[
                    SqlValue::from(self.key.as_str()),
                    SqlValue::from(self.holder.as_str()),
                ],
            )
            .await
            .map_err(|e| StrataError::LockError(format!("failed to refresh lock: {}", e.reason())))?;
        if rows.is_empty() {
            return Err(StrataError::LockError(format!(
                "lock on {} was taken over by another run; stopping before the next migration",
                self.key
            )));
        }
        tracing::debug!(lock = %self.key, "Refreshed migration lock");
        Ok(())
    }

    /// Release the lock if this run still holds it.
    pub async fn release(&self, client: &dyn DatabaseClient) -> Result<()> {
        tracing::info!(lock = %self.key, "Releasing migration lock");
        let sql = format!(
            "DELETE FROM {} WHERE lock_key = $1 AND holder = $2 RETURNING lock_key",
            qualified(&self.schema, &self.lock_table)
        );
        let rows = client
            .query(
                &sql,
                &[
                    SqlValue::from(self.key.as_str()),
                    SqlValue::from(self.holder.as_str()),
                ],
            )
            .await
            .map_err(|e| StrataError::LockError(format!("failed to release lock: {}", e.reason())))?;
        if rows.is_empty() {
            tracing::warn!(lock = %self.key, "Lock was already taken over or removed");
        }
        Ok(())
    }

    /// Release the lock and drop its table. Used by reset.
    pub async fn release_and_drop(self, client: &dyn DatabaseClient) -> Result<()> {
        self.release(client).await?;
        client
            .execute_raw(&format!(
                "DROP TABLE IF EXISTS {}",
                qualified(&self.schema, &self.lock_table)
            ))
            .await
    }
}

async fn current_holder(client: &dyn DatabaseClient, fq: &str, key: &str) -> Option<String> {
    let sql = format!("SELECT holder FROM {} WHERE lock_key = $1", fq);
    let rows = client.query(&sql, &[SqlValue::from(key)]).await.ok()?;
    rows.first().and_then(|r| r.get_string("holder").ok())
}

fn holder_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let nonce: u32 = rand::thread_rng().gen();
    format!("{}-{}-{:08x}", host, std::process::id(), nonce)
}
