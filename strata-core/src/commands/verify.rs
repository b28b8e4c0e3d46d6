//! Read-only introspection of the migrated schema.
//!
//! Gaps are reported, never raised. Database errors still propagate.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::client::{DatabaseClient, SqlValue};
use crate::config::StrataConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionStatus {
    pub name: String,
    pub present: bool,
}

/// One feature-level assertion: a required table or an expected foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub extensions: Vec<ExtensionStatus>,
    /// Tables in the current schema, minus the state store and its lock table.
    pub tables: Vec<String>,
    pub features: Vec<FeatureCheck>,
}

impl VerifyReport {
    pub fn is_complete(&self) -> bool {
        self.extensions.iter().all(|e| e.present) && self.features.iter().all(|f| f.ok)
    }
}

pub async fn execute(client: &dyn DatabaseClient, config: &StrataConfig) -> Result<VerifyReport> {
    let installed = installed_extensions(client).await?;
    let extensions = if config.verify.extensions.is_empty() {
        installed
            .iter()
            .filter(|name| name.as_str() != "plpgsql")
            .map(|name| ExtensionStatus {
                name: name.clone(),
                present: true,
            })
            .collect()
    } else {
        config
            .verify
            .extensions
            .iter()
            .map(|name| ExtensionStatus {
                name: name.clone(),
                present: installed.contains(name),
            })
            .collect()
    };

    let tables = user_tables(client, &config.migrations.table).await?;

    let mut features = Vec::new();
    for table in &config.verify.required_tables {
        let ok = tables.iter().any(|t| t == table);
        features.push(FeatureCheck {
            name: format!("table {}", table),
            ok,
            detail: if ok { "present".to_string() } else { "missing".to_string() },
        });
    }
    for fk in &config.verify.foreign_keys {
        let ok = foreign_key_exists(client, &fk.table, &fk.column, &fk.references).await?;
        features.push(FeatureCheck {
            name: format!("{}.{} -> {}", fk.table, fk.column, fk.references),
            ok,
            detail: if ok {
                "foreign key present".to_string()
            } else {
                "foreign key missing".to_string()
            },
        });
    }

    let report = VerifyReport {
        extensions,
        tables,
        features,
    };

    for ext in &report.extensions {
        if ext.present {
            tracing::info!(extension = %ext.name, "Extension installed");
        } else {
            tracing::warn!(extension = %ext.name, "Extension missing");
        }
    }
    tracing::info!(count = report.tables.len(), tables = %report.tables.join(", "), "Tables present");
    for feature in report.features.iter().filter(|f| !f.ok) {
        tracing::warn!(feature = %feature.name, detail = %feature.detail, "Feature check failed");
    }

    Ok(report)
}

async fn installed_extensions(client: &dyn DatabaseClient) -> Result<BTreeSet<String>> {
    let rows = client
        .query("SELECT extname::text AS extname FROM pg_extension ORDER BY extname", &[])
        .await?;
    rows.iter().map(|r| r.get_string("extname")).collect()
}

async fn user_tables(client: &dyn DatabaseClient, state_table: &str) -> Result<Vec<String>> {
    let lock_table = format!("{}_lock", state_table);
    let rows = client
        .query(
            "SELECT table_name::text AS table_name FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            &[],
        )
        .await?;
    let mut tables = Vec::with_capacity(rows.len());
    for row in &rows {
        let name = row.get_string("table_name")?;
        if name != state_table && name != lock_table {
            tables.push(name);
        }
    }
    Ok(tables)
}

async fn foreign_key_exists(
    client: &dyn DatabaseClient,
    table: &str,
    column: &str,
    references: &str,
) -> Result<bool> {
    let rows = client
        .query(
            "SELECT EXISTS (
                SELECT 1
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                  ON kcu.constraint_name = tc.constraint_name
                 AND kcu.table_schema = tc.table_schema
                JOIN information_schema.constraint_column_usage ccu
                  ON ccu.constraint_name = tc.constraint_name
                 AND ccu.table_schema = tc.table_schema
                WHERE tc.constraint_type = 'FOREIGN KEY'
                  AND tc.table_schema::text = current_schema()
                  AND tc.table_name::text = $1
                  AND kcu.column_name::text = $2
                  AND ccu.table_name::text = $3
            ) AS present",
            &[
                SqlValue::from(table),
                SqlValue::from(column),
                SqlValue::from(references),
            ],
        )
        .await?;
    match rows.first() {
        Some(row) => row.get_bool("present"),
        None => Ok(false),
    }
}
