//! In-memory stand-in for a PostgreSQL database.
//!
//! Understands exactly the statements the state store, lock, verifier and
//! reset issue, and treats every other `execute_raw` as migration DDL: it is
//! logged, and `CREATE EXTENSION` / `CREATE TABLE` are reflected in the
//! catalog queries the verifier runs.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{LazyLock, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use regex::Regex;

use strata_core::client::{DatabaseClient, Row, SqlValue};
use strata_core::config::{GroupConfig, StrataConfig};
use strata_core::error::{Result, StrataError};

static CREATE_EXTENSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)CREATE\s+EXTENSION\s+(?:IF\s+NOT\s+EXISTS\s+)?"?(\w+)"#).unwrap()
});
static CREATE_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?"?(\w+)"?"#).unwrap()
});
static QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).unwrap());

#[derive(Debug, Clone)]
pub struct FakeRecord {
    pub id: i64,
    pub filename: String,
    pub group: String,
    pub checksum: Option<String>,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    history_exists: bool,
    lock_table_exists: bool,
    lock: Option<(String, String)>,
    records: Vec<FakeRecord>,
    next_id: i64,
    extensions: BTreeSet<String>,
    tables: BTreeSet<String>,
    /// Migration DDL, in execution order.
    executed: Vec<String>,
    /// Every `execute_raw` and `query`, in order.
    log: Vec<String>,
    dropped: Vec<String>,
    fail_marker: Option<(String, String)>,
}

#[derive(Default)]
pub struct FakeDb {
    state: Mutex<State>,
}

fn server_error(code: &str, message: impl Into<String>) -> StrataError {
    StrataError::Server {
        status: 400,
        code: Some(code.to_string()),
        message: message.into(),
    }
}

fn param_text(params: &[SqlValue], idx: usize) -> String {
    match params.get(idx) {
        Some(SqlValue::Text(s)) => s.clone(),
        other => panic!("expected text parameter ${}, got {:?}", idx + 1, other),
    }
}

fn row(columns: Vec<(&str, SqlValue)>) -> Row {
    Row::new(columns.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make any statement containing `marker` fail with the given SQLSTATE.
    pub fn fail_on(&self, marker: &str, sqlstate: &str) {
        self.state.lock().unwrap().fail_marker = Some((marker.to_string(), sqlstate.to_string()));
    }

    /// Pretend another process holds the run lock.
    pub fn hold_lock(&self, key: &str, holder: &str) {
        let mut state = self.state.lock().unwrap();
        state.lock_table_exists = true;
        state.lock = Some((key.to_string(), holder.to_string()));
    }

    pub fn lock_holder(&self) -> Option<String> {
        self.state.lock().unwrap().lock.as_ref().map(|(_, h)| h.clone())
    }

    pub fn history_exists(&self) -> bool {
        self.state.lock().unwrap().history_exists
    }

    pub fn lock_table_exists(&self) -> bool {
        self.state.lock().unwrap().lock_table_exists
    }

    pub fn records(&self) -> Vec<FakeRecord> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn filenames(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.filename).collect()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.state.lock().unwrap().dropped.clone()
    }

    pub fn tables(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().tables.clone()
    }
}

impl State {
    fn history_query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        if !self.history_exists {
            return Err(server_error("42P01", "relation \"schema_migrations\" does not exist"));
        }

        if sql.starts_with("INSERT INTO") {
            let filename = param_text(params, 0);
            if self.records.iter().any(|r| r.filename == filename) {
                return Err(server_error(
                    "23505",
                    format!("duplicate key value violates unique constraint: {}", filename),
                ));
            }
            self.next_id += 1;
            let applied_at =
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(self.next_id);
            self.records.push(FakeRecord {
                id: self.next_id,
                filename,
                group: param_text(params, 1),
                checksum: match params.get(2) {
                    Some(SqlValue::Text(s)) => Some(s.clone()),
                    _ => None,
                },
                applied_at,
            });
            return Ok(Vec::new());
        }

        if sql.starts_with("DELETE FROM") {
            let filename = param_text(params, 0);
            let before = self.records.len();
            self.records.retain(|r| r.filename != filename);
            return Ok(if self.records.len() < before {
                vec![row(vec![("filename", SqlValue::Text(filename))])]
            } else {
                Vec::new()
            });
        }

        let to_row = |r: &FakeRecord| {
            row(vec![
                ("filename", SqlValue::Text(r.filename.clone())),
                ("applied_at", SqlValue::Timestamp(r.applied_at)),
                ("migration_group", SqlValue::Text(r.group.clone())),
                ("checksum", r.checksum.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null)),
            ])
        };

        if sql.contains("WHERE filename = $1") {
            let filename = param_text(params, 0);
            return Ok(self.records.iter().filter(|r| r.filename == filename).map(to_row).collect());
        }

        if sql.contains("ORDER BY applied_at, id") {
            let mut sorted = self.records.clone();
            sorted.sort_by_key(|r| (r.applied_at, r.id));
            return Ok(sorted.iter().map(to_row).collect());
        }

        panic!("unexpected state store query: {}", sql);
    }

    fn lock_query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        if !self.lock_table_exists {
            return Err(server_error("42P01", "lock table does not exist"));
        }

        if sql.starts_with("INSERT INTO") {
            let key = param_text(params, 0);
            let holder = param_text(params, 1);
            return Ok(match &self.lock {
                Some(_) => Vec::new(),
                None => {
                    self.lock = Some((key, holder.clone()));
                    vec![row(vec![("holder", SqlValue::Text(holder))])]
                }
            });
        }

        if sql.starts_with("DELETE FROM") {
            let key = param_text(params, 0);
            let holder = param_text(params, 1);
            if self.lock.as_ref() == Some(&(key.clone(), holder)) {
                self.lock = None;
                return Ok(vec![row(vec![("lock_key", SqlValue::Text(key))])]);
            }
            return Ok(Vec::new());
        }

        if sql.starts_with("UPDATE") {
            let key = param_text(params, 0);
            let holder = param_text(params, 1);
            if self.lock.as_ref() == Some(&(key.clone(), holder)) {
                return Ok(vec![row(vec![("lock_key", SqlValue::Text(key))])]);
            }
            return Ok(Vec::new());
        }

        if sql.starts_with("SELECT holder") {
            return Ok(self
                .lock
                .iter()
                .map(|(_, h)| row(vec![("holder", SqlValue::Text(h.clone()))]))
                .collect());
        }

        panic!("unexpected lock query: {}", sql);
    }

    fn foreign_key_present(&self, table: &str, column: &str, references: &str) -> bool {
        self.executed.iter().any(|stmt| {
            CREATE_TABLE_RE
                .captures(stmt)
                .is_some_and(|c| &c[1] == table)
                && stmt.contains(column)
                && stmt.contains(&format!("REFERENCES {}", references))
        })
    }
}

#[async_trait]
impl DatabaseClient for FakeDb {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut state = self.state.lock().unwrap();
        state.log.push(sql.to_string());

        if sql.contains("lock_key") || sql.starts_with("SELECT holder") {
            return state.lock_query(sql, params);
        }

        if sql.contains("FROM pg_extension") {
            return Ok(state
                .extensions
                .iter()
                .map(|e| row(vec![("extname", SqlValue::Text(e.clone()))]))
                .collect());
        }

        if sql.contains("FOREIGN KEY") {
            let present = state.foreign_key_present(
                &param_text(params, 0),
                &param_text(params, 1),
                &param_text(params, 2),
            );
            return Ok(vec![row(vec![("present", SqlValue::Bool(present))])]);
        }

        if sql.contains("table_type = 'BASE TABLE'") {
            let mut names: Vec<String> = state.tables.iter().cloned().collect();
            if state.history_exists {
                names.push("schema_migrations".to_string());
            }
            if state.lock_table_exists {
                names.push("schema_migrations_lock".to_string());
            }
            names.sort();
            return Ok(names
                .into_iter()
                .map(|t| row(vec![("table_name", SqlValue::Text(t))]))
                .collect());
        }

        if sql.contains("information_schema.tables") {
            return Ok(vec![row(vec![("present", SqlValue::Bool(state.history_exists))])]);
        }

        state.history_query(sql, params)
    }

    async fn execute_raw(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.log.push(sql.to_string());

        if let Some((marker, code)) = state.fail_marker.clone() {
            if sql.contains(&marker) {
                return Err(server_error(&code, format!("statement failed: {}", marker)));
            }
        }

        if sql.starts_with("CREATE SCHEMA") {
            return Ok(());
        }

        if sql.starts_with("CREATE TABLE IF NOT EXISTS") && sql.contains("lock_key") {
            state.lock_table_exists = true;
            return Ok(());
        }

        if sql.starts_with("CREATE TABLE IF NOT EXISTS") && sql.contains("migration_group") {
            state.history_exists = true;
            return Ok(());
        }

        if sql.starts_with("DROP TABLE IF EXISTS") {
            let names: Vec<String> = QUOTED_RE.captures_iter(sql).map(|c| c[1].to_string()).collect();
            let name = names.last().cloned().unwrap_or_default();
            if name.ends_with("_lock") {
                state.lock_table_exists = false;
                state.lock = None;
            } else if names.len() == 2 {
                state.history_exists = false;
                state.records.clear();
            } else {
                state.tables.remove(&name);
            }
            state.dropped.push(name);
            return Ok(());
        }

        if let Some(c) = CREATE_EXTENSION_RE.captures(sql) {
            let name = c[1].to_string();
            state.extensions.insert(name);
        }
        if let Some(c) = CREATE_TABLE_RE.captures(sql) {
            let name = c[1].to_string();
            if !state.tables.insert(name.clone()) && !sql.contains("IF NOT EXISTS") {
                return Err(server_error("42P07", format!("relation \"{}\" already exists", name)));
            }
        }
        state.executed.push(sql.to_string());
        Ok(())
    }
}

/// Write `files` into `dir` and return a config with one group per entry of `groups`.
pub fn config_for(dir: &Path, groups: &[(&str, &str, &[&str])]) -> StrataConfig {
    let mut config = StrataConfig::default();
    config.base_dir = dir.to_path_buf();
    config.database.url = Some("postgres://app@localhost:5432/app_test".to_string());
    config.migrations.groups = groups
        .iter()
        .map(|(name, directory, files)| GroupConfig {
            name: name.to_string(),
            directory: directory.into(),
            files: files.iter().map(|f| f.to_string()).collect(),
        })
        .collect();
    config
}

pub fn write_file(dir: &Path, relative: &str, content: &str) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}
