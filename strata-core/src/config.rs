use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::client::validate_identifier;
use crate::error::{Result, StrataError};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "strata.toml";

/// SSL/TLS connection mode for the stateful client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SslMode {
    /// Never use TLS.
    Disable,
    /// Try TLS first, fall back to plaintext.
    #[default]
    Prefer,
    /// Require TLS; fail if the handshake fails.
    Require,
}

impl std::str::FromStr for SslMode {
    type Err = StrataError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" | "disabled" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" | "required" => Ok(SslMode::Require),
            _ => Err(StrataError::ConfigError(format!(
                "Invalid SSL mode '{}'. Use 'disable', 'prefer', or 'require'.",
                s
            ))),
        }
    }
}

/// Which client backend to use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BackendPreference {
    /// Pick from the connection target (loopback or `USE_LOCAL_DB` → socket, else HTTP).
    #[default]
    Auto,
    /// Always use the stateful socket client.
    Postgres,
    /// Always use the stateless HTTP client.
    Http,
}

impl std::str::FromStr for BackendPreference {
    type Err = StrataError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "postgres" | "postgresql" | "socket" | "local" => Ok(BackendPreference::Postgres),
            "http" | "serverless" => Ok(BackendPreference::Http),
            _ => Err(StrataError::ConfigError(format!(
                "Invalid backend '{}'. Use 'auto', 'postgres', or 'http'.",
                s
            ))),
        }
    }
}

/// Top-level configuration for Strata.
#[derive(Debug, Clone)]
pub struct StrataConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationSettings,
    pub verify: VerifySettings,
    pub reset: ResetSettings,
    /// Set when running under CI (`CI` env var).
    pub ci: bool,
    /// Directory that relative migration paths resolve against.
    pub base_dir: PathBuf,
}

/// Database connection configuration.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub backend: BackendPreference,
    pub use_local: bool,
    pub http_endpoint: Option<String>,
    pub connect_retries: u32,
    pub ssl_mode: SslMode,
    pub connect_timeout_secs: u32,
    pub statement_timeout_secs: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            backend: BackendPreference::Auto,
            use_local: false,
            http_endpoint: None,
            connect_retries: 0,
            ssl_mode: SslMode::Prefer,
            connect_timeout_secs: 30,
            statement_timeout_secs: 0,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "[REDACTED]"))
            .field("backend", &self.backend)
            .field("use_local", &self.use_local)
            .field("http_endpoint", &self.http_endpoint)
            .field("connect_retries", &self.connect_retries)
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("statement_timeout_secs", &self.statement_timeout_secs)
            .finish()
    }
}

/// One declared migration group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub name: String,
    pub directory: PathBuf,
    pub files: Vec<String>,
}

/// Migration behavior settings.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Groups in execution order.
    pub groups: Vec<GroupConfig>,
    /// Filenames satisfied by a file outside their group directory.
    pub redirects: BTreeMap<String, PathBuf>,
    pub table: String,
    pub schema: String,
    pub validate_on_migrate: bool,
    /// Regex patterns for migrations known to conflict when re-run.
    pub rerun_sensitive: Vec<String>,
    /// Age after which a lock row is abandoned. Refreshed after each applied
    /// file, so it must exceed the slowest single migration.
    pub lock_timeout_secs: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            redirects: BTreeMap::new(),
            table: "schema_migrations".to_string(),
            schema: "public".to_string(),
            validate_on_migrate: false,
            rerun_sensitive: vec!["(?i)(create|schema|init)".to_string()],
            lock_timeout_secs: 900,
        }
    }
}

/// Foreign key the verifier expects to find.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForeignKeyCheck {
    pub table: String,
    pub column: String,
    pub references: String,
}

/// What the verifier looks for after a run.
#[derive(Debug, Clone, Default)]
pub struct VerifySettings {
    pub extensions: Vec<String>,
    pub required_tables: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyCheck>,
}

/// Tables owned by the migrations, in dependency order (parents first).
#[derive(Debug, Clone, Default)]
pub struct ResetSettings {
    pub tables: Vec<String>,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            migrations: MigrationSettings::default(),
            verify: VerifySettings::default(),
            reset: ResetSettings::default(),
            ci: false,
            base_dir: PathBuf::from("."),
        }
    }
}

// ── TOML deserialization structs ──

#[derive(Deserialize, Default)]
struct TomlConfig {
    database: Option<TomlDatabaseConfig>,
    migrations: Option<TomlMigrationSettings>,
    verify: Option<TomlVerifySettings>,
    reset: Option<TomlResetSettings>,
}

#[derive(Deserialize, Default)]
struct TomlDatabaseConfig {
    url: Option<String>,
    backend: Option<String>,
    use_local: Option<bool>,
    http_endpoint: Option<String>,
    connect_retries: Option<u32>,
    ssl_mode: Option<String>,
    connect_timeout: Option<u32>,
    statement_timeout: Option<u32>,
}

#[derive(Deserialize)]
struct TomlGroup {
    name: String,
    directory: String,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Deserialize, Default)]
struct TomlMigrationSettings {
    table: Option<String>,
    schema: Option<String>,
    validate_on_migrate: Option<bool>,
    rerun_sensitive: Option<Vec<String>>,
    lock_timeout: Option<u64>,
    groups: Option<Vec<TomlGroup>>,
    redirects: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Default)]
struct TomlVerifySettings {
    extensions: Option<Vec<String>>,
    required_tables: Option<Vec<String>>,
    foreign_keys: Option<Vec<ForeignKeyCheck>>,
}

#[derive(Deserialize, Default)]
struct TomlResetSettings {
    tables: Option<Vec<String>>,
}

/// CLI overrides that take highest priority.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub url: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub backend: Option<String>,
    pub use_local: Option<bool>,
    pub http_endpoint: Option<String>,
    pub validate_on_migrate: Option<bool>,
    pub connect_retries: Option<u32>,
    pub ssl_mode: Option<String>,
    pub connect_timeout: Option<u32>,
    pub statement_timeout: Option<u32>,
}

impl StrataConfig {
    /// Load configuration with the following priority (highest wins):
    /// 1. CLI arguments
    /// 2. Environment variables
    /// 3. TOML config file
    /// 4. Built-in defaults
    pub fn load(config_path: Option<&str>, overrides: &CliOverrides) -> Result<Self> {
        let mut config = StrataConfig::default();

        // Layer 3: TOML config file
        let toml_path = config_path.unwrap_or(DEFAULT_CONFIG_FILE);
        if let Ok(content) = std::fs::read_to_string(toml_path) {
            // Warn if config file has overly permissive permissions (Unix only)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = std::fs::metadata(toml_path) {
                    let mode = meta.permissions().mode();
                    if mode & 0o077 != 0 {
                        tracing::warn!(
                            path = %toml_path,
                            mode = format!("{:o}", mode),
                            "Config file has overly permissive permissions. Consider chmod 600."
                        );
                    }
                }
            }
            let toml_config: TomlConfig = toml::from_str(&content).map_err(|e| {
                StrataError::ConfigError(format!("Failed to parse config file '{}': {}", toml_path, e))
            })?;
            config.apply_toml(toml_config)?;
            config.base_dir = Path::new(toml_path)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
        } else if config_path.is_some() {
            // If explicitly specified, error if not found
            return Err(StrataError::ConfigError(format!(
                "Config file '{}' not found",
                toml_path
            )));
        }

        // Layer 2: Environment variables
        config.apply_env();

        // Layer 1: CLI overrides
        config.apply_cli(overrides)?;

        config.validate()?;

        // Cap connect_retries at 20
        if config.database.connect_retries > 20 {
            config.database.connect_retries = 20;
            tracing::warn!("connect_retries capped at 20");
        }

        Ok(config)
    }

    /// Check identifiers and patterns before any I/O happens.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.migrations.schema)?;
        validate_identifier(&self.migrations.table)?;
        for table in self
            .reset
            .tables
            .iter()
            .chain(self.verify.required_tables.iter())
        {
            validate_identifier(table)?;
        }
        for fk in &self.verify.foreign_keys {
            validate_identifier(&fk.table)?;
            validate_identifier(&fk.column)?;
            validate_identifier(&fk.references)?;
        }
        for pattern in &self.migrations.rerun_sensitive {
            regex::Regex::new(pattern).map_err(|e| {
                StrataError::ConfigError(format!(
                    "Invalid rerun_sensitive pattern '{}': {}",
                    pattern, e
                ))
            })?;
        }
        for group in &self.migrations.groups {
            if group.name.trim().is_empty() {
                return Err(StrataError::ConfigError(
                    "Migration group name cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn apply_toml(&mut self, toml: TomlConfig) -> Result<()> {
        if let Some(db) = toml.database {
            if let Some(v) = db.url { self.database.url = Some(v); }
            if let Some(v) = db.backend { self.database.backend = v.parse()?; }
            if let Some(v) = db.use_local { self.database.use_local = v; }
            if let Some(v) = db.http_endpoint { self.database.http_endpoint = Some(v); }
            if let Some(v) = db.connect_retries { self.database.connect_retries = v; }
            if let Some(v) = db.ssl_mode { self.database.ssl_mode = v.parse()?; }
            if let Some(v) = db.connect_timeout { self.database.connect_timeout_secs = v; }
            if let Some(v) = db.statement_timeout { self.database.statement_timeout_secs = v; }
        }

        if let Some(m) = toml.migrations {
            if let Some(v) = m.table { self.migrations.table = v; }
            if let Some(v) = m.schema { self.migrations.schema = v; }
            if let Some(v) = m.validate_on_migrate { self.migrations.validate_on_migrate = v; }
            if let Some(v) = m.rerun_sensitive { self.migrations.rerun_sensitive = v; }
            if let Some(v) = m.lock_timeout { self.migrations.lock_timeout_secs = v; }
            if let Some(groups) = m.groups {
                self.migrations.groups = groups
                    .into_iter()
                    .map(|g| GroupConfig {
                        name: g.name,
                        directory: PathBuf::from(g.directory),
                        files: g.files,
                    })
                    .collect();
            }
            if let Some(redirects) = m.redirects {
                self.migrations.redirects = redirects
                    .into_iter()
                    .map(|(name, path)| (name, PathBuf::from(path)))
                    .collect();
            }
        }

        if let Some(v) = toml.verify {
            if let Some(x) = v.extensions { self.verify.extensions = x; }
            if let Some(x) = v.required_tables { self.verify.required_tables = x; }
            if let Some(x) = v.foreign_keys { self.verify.foreign_keys = x; }
        }

        if let Some(r) = toml.reset {
            if let Some(x) = r.tables { self.reset.tables = x; }
        }

        Ok(())
    }

    fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply environment variables read through `lookup`.
    ///
    /// `TEST_DATABASE_URL` wins over `DATABASE_URL` when both are set.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database.url = Some(v);
        }
        if let Some(v) = lookup("TEST_DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database.url = Some(v);
        }
        if let Some(v) = lookup("USE_LOCAL_DB") {
            self.database.use_local = is_truthy(&v);
        }
        if let Some(v) = lookup("CI") {
            self.ci = is_truthy(&v);
        }
        if let Some(v) = lookup("STRATA_HTTP_ENDPOINT") {
            self.database.http_endpoint = Some(v);
        }
        if let Some(v) = lookup("STRATA_CONNECT_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                self.database.connect_retries = n;
            }
        }
        if let Some(v) = lookup("STRATA_SSL_MODE") {
            if let Ok(mode) = v.parse() {
                self.database.ssl_mode = mode;
            }
        }
        if let Some(v) = lookup("STRATA_CONNECT_TIMEOUT") {
            if let Ok(n) = v.parse::<u32>() {
                self.database.connect_timeout_secs = n;
            }
        }
        if let Some(v) = lookup("STRATA_STATEMENT_TIMEOUT") {
            if let Ok(n) = v.parse::<u32>() {
                self.database.statement_timeout_secs = n;
            }
        }
        if let Some(v) = lookup("STRATA_MIGRATIONS_TABLE") {
            self.migrations.table = v;
        }
        if let Some(v) = lookup("STRATA_MIGRATIONS_SCHEMA") {
            self.migrations.schema = v;
        }
    }

    fn apply_cli(&mut self, overrides: &CliOverrides) -> Result<()> {
        if let Some(ref v) = overrides.url {
            self.database.url = Some(v.clone());
        }
        if let Some(ref v) = overrides.schema {
            self.migrations.schema = v.clone();
        }
        if let Some(ref v) = overrides.table {
            self.migrations.table = v.clone();
        }
        if let Some(ref v) = overrides.backend {
            self.database.backend = v.parse()?;
        }
        if let Some(v) = overrides.use_local {
            self.database.use_local = v;
        }
        if let Some(ref v) = overrides.http_endpoint {
            self.database.http_endpoint = Some(v.clone());
        }
        if let Some(v) = overrides.validate_on_migrate {
            self.migrations.validate_on_migrate = v;
        }
        if let Some(v) = overrides.connect_retries {
            self.database.connect_retries = v;
        }
        if let Some(ref v) = overrides.ssl_mode {
            self.database.ssl_mode = v.parse()?;
        }
        if let Some(v) = overrides.connect_timeout {
            self.database.connect_timeout_secs = v;
        }
        if let Some(v) = overrides.statement_timeout {
            self.database.statement_timeout_secs = v;
        }
        Ok(())
    }

    /// Resolve the connection string.
    ///
    /// Handles JDBC-style URLs by stripping the `jdbc:` prefix and
    /// extracting `user` and `password` query parameters.
    pub fn connection_string(&self) -> Result<String> {
        match self.database.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(normalize_jdbc_url(url)),
            _ => Err(StrataError::ConfigError(
                "No database connection string. Set DATABASE_URL (or TEST_DATABASE_URL), \
                 pass --url, or set [database] url in strata.toml."
                    .to_string(),
            )),
        }
    }

    /// Resolve a configured path against the config file's directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Normalize a JDBC-style URL to a standard PostgreSQL connection string.
///
/// Handles:
///   - `jdbc:postgresql://host:port/db?user=x&password=y`  →  `postgresql://x:y@host:port/db`
///   - `postgresql://...` passed through as-is
///   - `postgres://...` passed through as-is
fn normalize_jdbc_url(url: &str) -> String {
    let Some(url) = url.strip_prefix("jdbc:") else {
        return url.to_string();
    };

    if let Some((base, query)) = url.split_once('?') {
        let mut user = None;
        let mut password = None;
        let mut other_params = Vec::new();

        for param in query.split('&') {
            if let Some((key, value)) = param.split_once('=') {
                match key.to_lowercase().as_str() {
                    "user" => user = Some(value.to_string()),
                    "password" => password = Some(value.to_string()),
                    _ => other_params.push(param.to_string()),
                }
            }
        }

        if user.is_some() || password.is_some() {
            if let Some(rest) = base
                .strip_prefix("postgresql://")
                .or_else(|| base.strip_prefix("postgres://"))
            {
                let scheme = if base.starts_with("postgresql://") {
                    "postgresql"
                } else {
                    "postgres"
                };

                let auth = match (user, password) {
                    (Some(u), Some(p)) => format!("{}:{}@", u, p),
                    (Some(u), None) => format!("{}@", u),
                    (None, Some(p)) => format!(":{p}@"),
                    (None, None) => String::new(),
                };

                let mut result = format!("{}://{}{}", scheme, auth, rest);
                if !other_params.is_empty() {
                    result.push('?');
                    result.push_str(&other_params.join("&"));
                }
                return result;
            }
        }

        if other_params.is_empty() {
            return base.to_string();
        }
        return format!("{}?{}", base, other_params.join("&"));
    }

    url.to_string()
}
