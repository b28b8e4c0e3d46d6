mod output;

use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use strata_core::commands::reset::check_safety_gate;
use strata_core::config::{CliOverrides, StrataConfig};
use strata_core::error::StrataError;
use strata_core::Strata;

#[derive(Parser)]
#[command(
    name = "strata",
    about = "Catalog-driven schema migrations for PostgreSQL over sockets or HTTP",
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_HASH"), " ", env!("BUILD_TIME"), ")"
    ),
    propagate_version = true
)]
struct Cli {
    /// Config file path (default: strata.toml)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Database URL (overrides DATABASE_URL and config)
    #[arg(long, value_name = "URL", global = true)]
    url: Option<String>,

    /// Schema holding the state-store table (overrides config)
    #[arg(long, value_name = "SCHEMA", global = true)]
    schema: Option<String>,

    /// State-store table name (overrides config)
    #[arg(long, value_name = "TABLE", global = true)]
    table: Option<String>,

    /// Client backend: auto, postgres, http
    #[arg(long, value_name = "BACKEND", global = true)]
    backend: Option<String>,

    /// Force the stateful socket client (same as USE_LOCAL_DB=true)
    #[arg(long, global = true)]
    use_local: bool,

    /// SQL-over-HTTP endpoint (default: https://{host}/sql)
    #[arg(long, value_name = "URL", global = true)]
    http_endpoint: Option<String>,

    /// Number of retries when connecting to the database
    #[arg(long, value_name = "N", global = true)]
    connect_retries: Option<u32>,

    /// SSL/TLS mode: disable, prefer, require
    #[arg(long, value_name = "MODE", global = true)]
    ssl_mode: Option<String>,

    /// Connection timeout in seconds (default: 30, 0 = no timeout)
    #[arg(long, value_name = "SECS", global = true)]
    connect_timeout: Option<u32>,

    /// Statement timeout in seconds (default: 0 = no limit)
    #[arg(long, value_name = "SECS", global = true)]
    statement_timeout: Option<u32>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations, then verify the schema (default)
    #[command(alias = "run")]
    Migrate {
        /// List what would be applied without executing anything
        #[arg(long)]
        dry_run: bool,

        /// Abort before any DDL if an applied migration changed on disk
        #[arg(long)]
        validate_on_migrate: bool,
    },

    /// Show applied and pending migrations, tables and feature checks
    Status,

    /// Drop all managed tables and the state store (test/local databases only)
    Reset,

    /// Remove one migration record without reverting its DDL
    Rollback {
        /// Migration filename, e.g. 05-users.sql
        filename: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json {
        "error"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .without_time()
        .init();

    if let Err(e) = run(cli).await {
        print_error(&e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), StrataError> {
    let json_output = cli.json;
    let command = cli.command.unwrap_or(Commands::Migrate {
        dry_run: false,
        validate_on_migrate: false,
    });

    let overrides = CliOverrides {
        url: cli.url,
        schema: cli.schema,
        table: cli.table,
        backend: cli.backend,
        use_local: cli.use_local.then_some(true),
        http_endpoint: cli.http_endpoint,
        validate_on_migrate: match &command {
            Commands::Migrate {
                validate_on_migrate: true,
                ..
            } => Some(true),
            _ => None,
        },
        connect_retries: cli.connect_retries,
        ssl_mode: cli.ssl_mode,
        connect_timeout: cli.connect_timeout,
        statement_timeout: cli.statement_timeout,
    };

    let config = StrataConfig::load(cli.config.as_deref(), &overrides)?;

    if config.ci {
        colored::control::set_override(false);
        tracing::info!("CI environment detected, colored output disabled");
    }

    // The gate runs before any connection is opened.
    if let Commands::Reset = command {
        check_safety_gate(&config.connection_string()?)?;
    }

    let strata = Strata::new(config).await?;
    tracing::debug!(backend = %strata.backend(), "Connected");

    let result = dispatch(&strata, command, json_output).await;

    // Always release the connection
    strata.close().await;
    result
}

async fn dispatch(strata: &Strata, command: Commands, json_output: bool) -> Result<(), StrataError> {
    match command {
        Commands::Migrate { dry_run, .. } => {
            let report = strata.migrate(dry_run).await?;
            if json_output {
                print_json(&report);
            } else {
                output::print_migrate_summary(&report);
            }
        }
        Commands::Status => {
            let report = strata.status().await?;
            if json_output {
                print_json(&report);
            } else {
                output::print_status(&report);
            }
        }
        Commands::Reset => {
            let report = strata.reset().await?;
            if json_output {
                print_json(&report);
            } else {
                output::print_reset_result(&report);
            }
        }
        Commands::Rollback { filename } => {
            let report = strata.rollback(&filename).await?;
            if json_output {
                print_json(&report);
            } else {
                output::print_rollback_result(&report);
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("{} failed to serialize report: {}", "ERROR:".red().bold(), e),
    }
}

fn print_error(error: &StrataError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    // Provide actionable guidance
    let hint = match error {
        StrataError::ConfigError(_) => {
            "Hint: Set DATABASE_URL (or TEST_DATABASE_URL), pass --url, or check strata.toml."
        }
        StrataError::DuplicateFilename { .. } => {
            "Hint: Each filename may appear only once across all groups in strata.toml."
        }
        StrataError::Connection { .. } | StrataError::DatabaseError(_) | StrataError::HttpError(_) => {
            "Hint: Verify the database is reachable. For a local database set USE_LOCAL_DB=true or pass --backend postgres."
        }
        StrataError::Server { .. } => {
            "Hint: The HTTP endpoint rejected the query. Check the connection string and --http-endpoint."
        }
        StrataError::StatementFailed { .. } => {
            "Hint: Earlier statements in this file were applied but not recorded. Fix the schema or make them idempotent, then run 'strata migrate' again."
        }
        StrataError::ChecksumMismatch { .. } => {
            "Hint: Restore the original migration file, or drop --validate-on-migrate to report drift without failing."
        }
        StrataError::LockError(_) => {
            "Hint: Another run holds the migration lock. Wait for it to finish or for the lock to expire (lock_timeout)."
        }
        StrataError::SafetyGateViolation { .. } => {
            "Hint: reset only runs when the connection string contains 'test' or 'localhost'."
        }
        StrataError::RecordNotFound(_) => {
            "Hint: Run 'strata status' to list recorded migrations."
        }
        StrataError::Decode { .. } | StrataError::IoError(_) => return,
    };
    eprintln!("{}", hint.dimmed());
}
