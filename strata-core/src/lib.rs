pub mod catalog;
pub mod checksum;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod history;
pub mod splitter;

use client::{Backend, Connection, DatabaseClient};
use config::StrataConfig;
use error::Result;

pub use catalog::{Catalog, MigrationFile};
pub use commands::migrate::{FileOutcome, MigrateDetail, MigrateReport};
pub use commands::reset::ResetReport;
pub use commands::rollback::RollbackReport;
pub use commands::status::{MigrationInfo, MigrationState, StatusReport};
pub use commands::verify::VerifyReport;
pub use config::CliOverrides;
pub use error::StrataError;

/// Main entry point for the Strata library.
///
/// Owns the configuration and the open connection for one run. Call
/// [`Strata::close`] when done, on success and failure alike.
pub struct Strata {
    pub config: StrataConfig,
    conn_string: String,
    connection: Connection,
}

impl Strata {
    /// Resolve the connection string and open a connection with the selected backend.
    ///
    /// The catalog is built first, so a duplicate filename fails before any I/O.
    pub async fn new(config: StrataConfig) -> Result<Self> {
        Catalog::from_config(&config)?;
        let conn_string = config.connection_string()?;
        let connection = Connection::open(&conn_string, &config.database).await?;
        Ok(Self {
            config,
            conn_string,
            connection,
        })
    }

    /// Create a Strata instance around an already open connection.
    pub fn with_connection(config: StrataConfig, connection: Connection) -> Result<Self> {
        let conn_string = config.connection_string()?;
        Ok(Self {
            config,
            conn_string,
            connection,
        })
    }

    pub fn backend(&self) -> Backend {
        self.connection.backend()
    }

    pub fn client(&self) -> &dyn DatabaseClient {
        self.connection.as_client()
    }

    /// Apply pending migrations, then verify.
    pub async fn migrate(&self, dry_run: bool) -> Result<MigrateReport> {
        commands::migrate::execute(self.client(), &self.config, dry_run).await
    }

    /// Report applied and pending migrations without changing anything.
    pub async fn status(&self) -> Result<StatusReport> {
        commands::status::execute(self.client(), &self.config).await
    }

    pub async fn verify(&self) -> Result<VerifyReport> {
        commands::verify::execute(self.client(), &self.config).await
    }

    /// Drop all managed tables and the state store. Guarded by the safety gate.
    pub async fn reset(&self) -> Result<ResetReport> {
        commands::reset::execute(self.client(), &self.config, &self.conn_string).await
    }

    /// Remove the record for `filename` without reverting its DDL.
    pub async fn rollback(&self, filename: &str) -> Result<RollbackReport> {
        commands::rollback::execute(self.client(), &self.config, filename).await
    }

    /// Release the connection.
    pub async fn close(self) {
        self.connection.close().await;
    }
}
