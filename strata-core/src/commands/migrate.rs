use std::collections::HashMap;
use std::time::Instant;

use regex::Regex;
use serde::Serialize;

use crate::catalog::{Catalog, MigrationFile};
use crate::checksum::calculate_checksum;
use crate::client::DatabaseClient;
use crate::config::StrataConfig;
use crate::error::{Result, StrataError};
use crate::history::{self, MigrationLock};
use crate::splitter::split_statements;

use super::verify::{self, VerifyReport};

/// SQLSTATE codes for "already exists" failures: duplicate table, object, column.
const ALREADY_EXISTS_CODES: &[&str] = &["42P07", "42710", "42701"];

const EXCERPT_LEN: usize = 120;

/// What happened to one catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Applied {
        statements: usize,
        execution_time_ms: u64,
    },
    /// A record already exists; nothing was executed.
    Skipped,
    /// Recorded, but the file content changed since it was applied.
    Drifted { recorded: String, current: String },
    /// The source file does not exist; the run moved on.
    SkippedMissing { available: Vec<String> },
    /// Dry run only: would be applied.
    Pending { statements: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrateDetail {
    pub filename: String,
    pub group: String,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

/// Report returned after a migrate operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrateReport {
    pub applied: usize,
    pub skipped: usize,
    pub missing: usize,
    pub drifted: usize,
    pub pending: usize,
    pub dry_run: bool,
    pub total_time_ms: u64,
    pub details: Vec<MigrateDetail>,
    pub verify: Option<VerifyReport>,
}

impl MigrateReport {
    fn push(&mut self, file: &MigrationFile, outcome: FileOutcome) {
        match &outcome {
            FileOutcome::Applied {
                execution_time_ms, ..
            } => {
                self.applied += 1;
                self.total_time_ms += execution_time_ms;
            }
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Drifted { .. } => {
                self.skipped += 1;
                self.drifted += 1;
            }
            FileOutcome::SkippedMissing { .. } => self.missing += 1,
            FileOutcome::Pending { .. } => self.pending += 1,
        }
        self.details.push(MigrateDetail {
            filename: file.filename.clone(),
            group: file.group.clone(),
            outcome,
        });
    }
}

/// Execute the migrate command.
///
/// Ensures the state store exists, takes the run lock, visits every catalog
/// entry in order, releases the lock, and finally runs the verifier.
pub async fn execute(
    client: &dyn DatabaseClient,
    config: &StrataConfig,
    dry_run: bool,
) -> Result<MigrateReport> {
    let catalog = Catalog::from_config(config)?;
    let sensitive = compile_patterns(&config.migrations.rerun_sensitive)?;

    if dry_run {
        return plan(client, config, &catalog).await;
    }

    let schema = &config.migrations.schema;
    let table = &config.migrations.table;

    history::create_history_table(client, schema, table).await?;

    let lock = MigrationLock::acquire(client, schema, table, config.migrations.lock_timeout_secs).await?;

    let result = run_migrate(client, config, &catalog, &sensitive, &lock).await;

    // Always release the lock
    if let Err(e) = lock.release(client).await {
        tracing::warn!(error = %e, "Failed to release migration lock");
    }

    let mut report = match result {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Migrate failed");
            return Err(e);
        }
    };

    tracing::info!(
        applied = report.applied,
        skipped = report.skipped,
        missing = report.missing,
        total_time_ms = report.total_time_ms,
        "Migrate completed"
    );

    report.verify = Some(verify::execute(client, config).await?);
    Ok(report)
}

async fn run_migrate(
    client: &dyn DatabaseClient,
    config: &StrataConfig,
    catalog: &Catalog,
    sensitive: &[Regex],
    lock: &MigrationLock,
) -> Result<MigrateReport> {
    let schema = &config.migrations.schema;
    let table = &config.migrations.table;

    if config.migrations.validate_on_migrate {
        validate_checksums(client, config, catalog).await?;
    }

    let mut report = MigrateReport::default();

    for file in catalog.files() {
        if let Some(record) = history::find_record(client, schema, table, &file.filename).await? {
            let outcome = match (record.checksum, current_checksum(file)) {
                (Some(recorded), Some(current)) if recorded != current => {
                    tracing::warn!(
                        filename = %file.filename,
                        recorded = %recorded,
                        current = %current,
                        "Applied migration has changed on disk"
                    );
                    FileOutcome::Drifted { recorded, current }
                }
                _ => {
                    tracing::info!(filename = %file.filename, "Skipping, already applied");
                    FileOutcome::Skipped
                }
            };
            report.push(file, outcome);
            continue;
        }

        if !file.exists() {
            let available = file.available_siblings();
            tracing::warn!(
                filename = %file.filename,
                path = %file.source_path.display(),
                available = %available.join(", "),
                "Migration file not found, continuing with the next file"
            );
            report.push(file, FileOutcome::SkippedMissing { available });
            continue;
        }

        let outcome = apply_migration(client, config, file, sensitive).await?;
        report.push(file, outcome);

        // Keeps the row younger than lock_timeout for as long as files keep landing.
        lock.refresh(client).await?;
    }

    Ok(report)
}

async fn apply_migration(
    client: &dyn DatabaseClient,
    config: &StrataConfig,
    file: &MigrationFile,
    sensitive: &[Regex],
) -> Result<FileOutcome> {
    tracing::info!(filename = %file.filename, group = %file.group, "Applying migration");

    let content = file.read()?;
    let checksum = calculate_checksum(&content);
    let statements = split_statements(&content);
    let start = Instant::now();

    for (idx, statement) in statements.iter().enumerate() {
        if let Err(e) = client.execute_raw(statement).await {
            if matches!(e, StrataError::Connection { .. }) {
                return Err(e);
            }
            let failure = StrataError::StatementFailed {
                filename: file.filename.clone(),
                statement_index: idx + 1,
                excerpt: excerpt(statement),
                reason: e.reason(),
                advisory: advisory(&file.filename, &e, sensitive),
            };
            tracing::error!(
                filename = %file.filename,
                statement = idx + 1,
                total = statements.len(),
                error = %e.reason(),
                "Migration failed"
            );
            return Err(failure);
        }
    }

    history::insert_record(
        client,
        &config.migrations.schema,
        &config.migrations.table,
        &file.filename,
        &file.group,
        Some(&checksum),
    )
    .await?;

    let execution_time_ms = start.elapsed().as_millis() as u64;
    tracing::info!(
        filename = %file.filename,
        statements = statements.len(),
        execution_time_ms,
        "Migration applied"
    );

    Ok(FileOutcome::Applied {
        statements: statements.len(),
        execution_time_ms,
    })
}

/// Dry run: report what would happen without executing or recording anything.
async fn plan(client: &dyn DatabaseClient, config: &StrataConfig, catalog: &Catalog) -> Result<MigrateReport> {
    let schema = &config.migrations.schema;
    let table = &config.migrations.table;

    let applied: HashMap<String, history::MigrationRecord> =
        if history::history_table_exists(client, schema, table).await? {
            history::get_applied_migrations(client, schema, table)
                .await?
                .into_iter()
                .map(|r| (r.filename.clone(), r))
                .collect()
        } else {
            HashMap::new()
        };

    let mut report = MigrateReport {
        dry_run: true,
        ..Default::default()
    };

    for file in catalog.files() {
        let outcome = if applied.contains_key(&file.filename) {
            FileOutcome::Skipped
        } else if !file.exists() {
            FileOutcome::SkippedMissing {
                available: file.available_siblings(),
            }
        } else {
            FileOutcome::Pending {
                statements: split_statements(&file.read()?).len(),
            }
        };
        report.push(file, outcome);
    }

    tracing::info!(pending = report.pending, "Dry run complete, nothing executed");
    Ok(report)
}

/// Fail before any DDL runs if an applied migration changed on disk.
async fn validate_checksums(
    client: &dyn DatabaseClient,
    config: &StrataConfig,
    catalog: &Catalog,
) -> Result<()> {
    let records = history::get_applied_migrations(
        client,
        &config.migrations.schema,
        &config.migrations.table,
    )
    .await?;

    for record in records {
        let (Some(file), Some(recorded)) = (catalog.get(&record.filename), record.checksum) else {
            continue;
        };
        if let Some(current) = current_checksum(file) {
            if current != recorded {
                return Err(StrataError::ChecksumMismatch {
                    filename: record.filename,
                    recorded,
                    current,
                });
            }
        }
    }
    Ok(())
}

fn current_checksum(file: &MigrationFile) -> Option<String> {
    if !file.exists() {
        return None;
    }
    file.read().ok().map(|content| calculate_checksum(&content))
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| {
                StrataError::ConfigError(format!("Invalid rerun_sensitive pattern '{}': {}", p, e))
            })
        })
        .collect()
}

/// First line-collapsed 120 characters of a statement.
fn excerpt(statement: &str) -> String {
    let collapsed = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= EXCERPT_LEN {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(EXCERPT_LEN).collect();
    cut.push_str("...");
    cut
}

fn advisory(filename: &str, error: &StrataError, sensitive: &[Regex]) -> Option<String> {
    let already_exists = error
        .sqlstate()
        .is_some_and(|code| ALREADY_EXISTS_CODES.contains(&code));

    if already_exists {
        return Some(format!(
            "an object created by {} already exists. An earlier run may have applied part of this file \
             without recording it. Make the statement idempotent (IF NOT EXISTS), or fix the schema by hand \
             and re-run; on a test database, `strata reset` starts over.",
            filename
        ));
    }
    if sensitive.iter().any(|re| re.is_match(filename)) {
        return Some(format!(
            "{} creates schema objects and is expected to conflict when re-run against a database that \
             already has them. Check whether its objects exist before re-running.",
            filename
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(code: &str) -> StrataError {
        StrataError::Server {
            status: 400,
            code: Some(code.to_string()),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_excerpt_collapses_whitespace_and_truncates() {
        assert_eq!(excerpt("CREATE TABLE a (\n  id int\n);"), "CREATE TABLE a ( id int );");

        let long = format!("SELECT '{}';", "x".repeat(300));
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), EXCERPT_LEN + 3);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let s = "é".repeat(200);
        assert_eq!(excerpt(&s).chars().count(), EXCERPT_LEN + 3);
    }

    #[test]
    fn test_advisory_for_already_exists() {
        let patterns = compile_patterns(&[]).unwrap();
        for code in ALREADY_EXISTS_CODES {
            let advice = advisory("05-users.sql", &server_error(code), &patterns);
            assert!(advice.unwrap().contains("already exists"));
        }
        assert!(advisory("05-users.sql", &server_error("23505"), &patterns).is_none());
    }

    #[test]
    fn test_advisory_for_rerun_sensitive_filename() {
        let patterns = compile_patterns(&["(?i)(create|schema|init)".to_string()]).unwrap();
        assert!(advisory("02-schema.sql", &server_error("22P02"), &patterns).is_some());
        assert!(advisory("07-seed-data.sql", &server_error("22P02"), &patterns).is_none());
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(matches!(
            compile_patterns(&["(".to_string()]),
            Err(StrataError::ConfigError(_))
        ));
    }

    #[test]
    fn test_report_counts() {
        let file = MigrationFile {
            filename: "01-ext.sql".to_string(),
            group: "core".to_string(),
            source_path: "db/01-ext.sql".into(),
        };
        let mut report = MigrateReport::default();
        report.push(&file, FileOutcome::Applied { statements: 2, execution_time_ms: 5 });
        report.push(&file, FileOutcome::Skipped);
        report.push(
            &file,
            FileOutcome::Drifted {
                recorded: "a".to_string(),
                current: "b".to_string(),
            },
        );
        report.push(&file, FileOutcome::SkippedMissing { available: vec![] });

        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.drifted, 1);
        assert_eq!(report.missing, 1);
        assert_eq!(report.total_time_ms, 5);
        assert_eq!(report.details.len(), 4);
    }
}
