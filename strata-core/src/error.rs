use thiserror::Error;

/// Extract the full error message from a tokio_postgres::Error,
/// including the underlying DbError details that Display hides.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        if let Some(position) = db_err.position() {
            msg.push_str(&format!("\n  Position: {:?}", position));
        }
        return msg;
    }
    // Fallback: walk the source chain
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(&format!(": {}", s));
        source = s.source();
    }
    msg
}

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Migration '{filename}' is declared in both group '{first_group}' and group '{second_group}'")]
    DuplicateFilename {
        filename: String,
        first_group: String,
        second_group: String,
    },

    #[error("Cannot reach database at {target}: {reason}")]
    Connection { target: String, reason: String },

    #[error("Database error: {}", format_db_error(.0))]
    DatabaseError(#[from] tokio_postgres::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Query rejected by server (HTTP {status}{}): {message}", .code.as_deref().map(|c| format!(", SQLSTATE {}", c)).unwrap_or_default())]
    Server {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Migration {filename} failed at statement {statement_index} ({excerpt}): {reason}{}", .advisory.as_deref().map(|a| format!("\n  Advisory: {}", a)).unwrap_or_default())]
    StatementFailed {
        filename: String,
        statement_index: usize,
        excerpt: String,
        reason: String,
        advisory: Option<String>,
    },

    #[error("Checksum mismatch for migration {filename}: recorded {recorded}, found {current}")]
    ChecksumMismatch {
        filename: String,
        recorded: String,
        current: String,
    },

    #[error("Failed to acquire migration lock: {0}")]
    LockError(String),

    #[error("Refusing to reset {target}: the connection string must contain 'test' or 'localhost'")]
    SafetyGateViolation { target: String },

    #[error("No migration record found for '{0}'")]
    RecordNotFound(String),

    #[error("Cannot decode column '{column}': {reason}")]
    Decode { column: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StrataError {
    /// The SQLSTATE code reported by the backend, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            StrataError::DatabaseError(e) => e.as_db_error().map(|db| db.code().code()),
            StrataError::Server { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Human-readable reason, without the variant prefix added by Display.
    pub fn reason(&self) -> String {
        match self {
            StrataError::DatabaseError(e) => format_db_error(e),
            StrataError::Server { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
