//! rs2bq - Redshift to BigQuery migrator

use clap::{Parser, Subcommand};
use rs2bq::config::{ConfigOverrides, MigratorConfig};
use rs2bq::context::MigrationContext;
use rs2bq::orchestrator::Orchestrator;
use rs2bq::schema::{FileSchemaStore, SchemaStore};
use rs2bq::typemap;
use rs2bq_common::logging::{init_logging, LogConfig, LogLevel};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "rs2bq")]
#[command(author, version, about = "Migrate Redshift tables to BigQuery through S3")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Tables to migrate (comma-separated), replaces AWS_REDSHIFT_TABLES
    #[arg(long, global = true, value_delimiter = ',')]
    tables: Option<Vec<String>>,

    /// Root for persisted schemas and staged files
    #[arg(long, global = true, env = "RS2BQ_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Tables processed at once during schema fetch and load
    #[arg(long, global = true, env = "RS2BQ_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Return as soon as the UNLOAD batch is accepted
    #[arg(long, global = true)]
    no_wait_export: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export, fetch schemas and load every table
    Run,

    /// Submit the UNLOAD batch only
    Export,

    /// Describe tables and persist their schemas only
    Schemas,

    /// Load already exported tables using persisted schemas
    Load,

    /// Print the BigQuery fields mapped from a persisted schema
    Map {
        /// Table name
        table: String,
    },

    /// Print the resolved configuration (secrets omitted)
    Config,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            tables: self.tables.clone(),
            work_dir: self.work_dir.clone(),
            concurrency: self.concurrency,
            wait_for_export: self.no_wait_export.then_some(false),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        })
        .log_file_prefix("rs2bq")
        .filter_directives("aws_smithy_runtime=warn,aws_config=warn,hyper=warn")
        .build();

    // Environment variables take precedence
    let log_config = match log_config.merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: invalid logging configuration: {:#}", e);
            process::exit(1);
        },
    };

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {:#}", e);
            process::exit(1);
        },
    };

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> anyhow::Result<()> {
    let config = MigratorConfig::load_with(&cli.overrides())?;

    match &cli.command {
        Command::Config => print_json(&config),

        Command::Map { table } => {
            let store = FileSchemaStore::new(config.pipeline.schema_dir());
            let schema = store.get(table).await?;
            print_json(&typemap::map_schema(&schema)?)
        },

        Command::Run => print_json(&orchestrator(config).await?.run().await?),

        Command::Export => {
            let handle = orchestrator(config).await?.export_only().await?;
            info!(statement_id = %handle.statement_id, "Export submitted");
            print_json(&handle)
        },

        Command::Schemas => {
            let schemas = orchestrator(config).await?.fetch_schemas_only().await?;
            info!("Persisted {} schema(s)", schemas.len());
            print_json(&schemas)
        },

        Command::Load => print_json(&orchestrator(config).await?.load_only().await?),
    }
}

/// Connect the production adapters and start logging state transitions
async fn orchestrator(config: MigratorConfig) -> anyhow::Result<Orchestrator> {
    let ctx = MigrationContext::from_config(config).await?;
    let orchestrator = Orchestrator::new(ctx);
    watch_progress(&orchestrator);
    Ok(orchestrator)
}

/// Log every state transition at debug level until the run ends
fn watch_progress(orchestrator: &Orchestrator) {
    let mut states = orchestrator.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            debug!(?state, "Run state changed");
            if state.is_terminal() {
                break;
            }
        }
    });
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_become_overrides() {
        let cli = Cli::parse_from([
            "rs2bq",
            "run",
            "--tables",
            "orders,customers",
            "--concurrency",
            "2",
            "--no-wait-export",
        ]);

        let overrides = cli.overrides();
        assert_eq!(
            overrides.tables,
            Some(vec!["orders".to_string(), "customers".to_string()])
        );
        assert_eq!(overrides.concurrency, Some(2));
        assert_eq!(overrides.wait_for_export, Some(false));
    }

    #[test]
    fn test_map_takes_a_table() {
        let cli = Cli::parse_from(["rs2bq", "map", "orders"]);
        assert!(matches!(cli.command, Command::Map { ref table } if table == "orders"));
        assert!(cli.overrides().wait_for_export.is_none());
    }
}
