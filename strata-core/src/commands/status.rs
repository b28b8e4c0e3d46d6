use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::Catalog;
use crate::checksum::calculate_checksum;
use crate::client::DatabaseClient;
use crate::config::StrataConfig;
use crate::error::Result;
use crate::history::{self, MigrationRecord};

use super::verify::{self, VerifyReport};

/// The state of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    Pending,
    Applied,
    /// Applied, but the file changed since.
    Drifted,
    /// Not applied and the file is not on disk.
    Missing,
    /// Recorded, but no longer declared in any group.
    Orphaned,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Pending => write!(f, "Pending"),
            MigrationState::Applied => write!(f, "Applied"),
            MigrationState::Drifted => write!(f, "Drifted"),
            MigrationState::Missing => write!(f, "Missing"),
            MigrationState::Orphaned => write!(f, "Orphaned"),
        }
    }
}

/// Combined view of a migration (catalog entry + record).
#[derive(Debug, Clone, Serialize)]
pub struct MigrationInfo {
    pub filename: String,
    pub group: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub entries: Vec<MigrationInfo>,
    pub applied: usize,
    pub pending: usize,
    pub verify: VerifyReport,
}

/// Execute the status command. Never writes; a missing state store means
/// nothing has been applied yet.
pub async fn execute(client: &dyn DatabaseClient, config: &StrataConfig) -> Result<StatusReport> {
    let catalog = Catalog::from_config(config)?;
    let schema = &config.migrations.schema;
    let table = &config.migrations.table;

    let records = if history::history_table_exists(client, schema, table).await? {
        history::get_applied_migrations(client, schema, table).await?
    } else {
        tracing::info!(schema = %schema, table = %table, "State store does not exist yet");
        Vec::new()
    };

    let entries = merge(&catalog, &records);
    let applied = entries
        .iter()
        .filter(|e| matches!(e.state, MigrationState::Applied | MigrationState::Drifted))
        .count();
    let pending = entries
        .iter()
        .filter(|e| e.state == MigrationState::Pending)
        .count();

    let verify = verify::execute(client, config).await?;

    Ok(StatusReport {
        entries,
        applied,
        pending,
        verify,
    })
}

fn merge(catalog: &Catalog, records: &[MigrationRecord]) -> Vec<MigrationInfo> {
    let by_filename: HashMap<&str, &MigrationRecord> =
        records.iter().map(|r| (r.filename.as_str(), r)).collect();

    let mut entries: Vec<MigrationInfo> = catalog
        .files()
        .iter()
        .map(|file| {
            let current = if file.exists() {
                file.read().ok().map(|c| calculate_checksum(&c))
            } else {
                None
            };

            match by_filename.get(file.filename.as_str()) {
                Some(record) => {
                    let drifted = matches!(
                        (&record.checksum, &current),
                        (Some(recorded), Some(now)) if recorded != now
                    );
                    MigrationInfo {
                        filename: file.filename.clone(),
                        group: record.migration_group.clone(),
                        state: if drifted {
                            MigrationState::Drifted
                        } else {
                            MigrationState::Applied
                        },
                        applied_at: Some(record.applied_at),
                        checksum: record.checksum.clone(),
                    }
                }
                None => MigrationInfo {
                    filename: file.filename.clone(),
                    group: file.group.clone(),
                    state: if file.exists() {
                        MigrationState::Pending
                    } else {
                        MigrationState::Missing
                    },
                    applied_at: None,
                    checksum: current,
                },
            }
        })
        .collect();

    let declared: HashSet<&str> = catalog.files().iter().map(|f| f.filename.as_str()).collect();
    for record in records {
        if !declared.contains(record.filename.as_str()) {
            entries.push(MigrationInfo {
                filename: record.filename.clone(),
                group: record.migration_group.clone(),
                state: MigrationState::Orphaned,
                applied_at: Some(record.applied_at),
                checksum: record.checksum.clone(),
            });
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::GroupConfig;

    #[test]
    fn test_merge_states() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("01-ext.sql"), "CREATE EXTENSION pgcrypto;").unwrap();
        std::fs::write(dir.path().join("02-schema.sql"), "CREATE TABLE users (id uuid);").unwrap();
        std::fs::write(dir.path().join("03-more.sql"), "CREATE TABLE more (id int);").unwrap();

        let groups = vec![GroupConfig {
            name: "core".to_string(),
            directory: dir.path().to_path_buf(),
            files: ["01-ext.sql", "02-schema.sql", "03-more.sql", "04-gone.sql"]
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }];
        let catalog = Catalog::build(&groups, &BTreeMap::new(), dir.path()).unwrap();

        let record = |filename: &str, checksum: Option<String>| MigrationRecord {
            filename: filename.to_string(),
            applied_at: Utc::now(),
            migration_group: "core".to_string(),
            checksum,
        };
        let records = vec![
            record("01-ext.sql", Some(calculate_checksum("CREATE EXTENSION pgcrypto;"))),
            record("02-schema.sql", Some("deadbeef".to_string())),
            record("00-legacy.sql", None),
        ];

        let entries = merge(&catalog, &records);
        let states: Vec<(&str, MigrationState)> = entries
            .iter()
            .map(|e| (e.filename.as_str(), e.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("01-ext.sql", MigrationState::Applied),
                ("02-schema.sql", MigrationState::Drifted),
                ("03-more.sql", MigrationState::Pending),
                ("04-gone.sql", MigrationState::Missing),
                ("00-legacy.sql", MigrationState::Orphaned),
            ]
        );
    }

    #[test]
    fn test_record_without_checksum_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.sql"), "SELECT 1;").unwrap();
        let groups = vec![GroupConfig {
            name: "core".to_string(),
            directory: dir.path().to_path_buf(),
            files: vec!["a.sql".to_string()],
        }];
        let catalog = Catalog::build(&groups, &BTreeMap::new(), dir.path()).unwrap();
        let records = vec![MigrationRecord {
            filename: "a.sql".to_string(),
            applied_at: Utc::now(),
            migration_group: "core".to_string(),
            checksum: None,
        }];
        assert_eq!(merge(&catalog, &records)[0].state, MigrationState::Applied);
    }
}
