//! MSSQL Stream Connector command line.
//!
//! Runs a query and prints its batches as JSON lines, validates connection
//! options, or prints the options schema. Data goes to stdout, logs to
//! stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use mssql_stream_connector::constants::DEFAULT_BATCH_SIZE;
use mssql_stream_connector::{options_schema, ConnectionTest, QueryExecutor};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mssql-stream-connector")]
#[command(about = "Stream SQL Server query results as JSON batches")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a query and print one JSON line per batch
    Query {
        /// JSON file holding the connection options
        #[arg(long)]
        options: PathBuf,

        /// Maximum rows per batch
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// SQL text to execute
        query: String,
    },

    /// Check that the connection options can run a trivial query
    Test {
        /// JSON file holding the connection options
        #[arg(long)]
        options: PathBuf,
    },

    /// Print the connection options schema
    OptionsSchema,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr (stdout carries query output)
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Query {
            options,
            batch_size,
            query,
        } => run_query(&options, &query, batch_size).await,
        Command::Test { options } => run_test(&options).await,
        Command::OptionsSchema => {
            println!("{}", serde_json::to_string_pretty(&options_schema())?);
            Ok(())
        }
    }
}

async fn run_query(options_path: &Path, query: &str, batch_size: usize) -> Result<()> {
    let options = read_options(options_path)?;
    let executor = QueryExecutor::from_env()?;

    let result = async {
        let mut stream = executor.execute_query(query, &options, batch_size).await?;

        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let header = json!({
            "columnTypes": stream.column_types(),
            "expectedRowCount": stream.expected_row_count(),
        });
        writeln!(out, "{header}")?;

        while let Some(batch) = stream.next().await {
            writeln!(out, "{}", serde_json::to_string(&batch?)?)?;
        }
        out.flush()?;
        anyhow::Ok(())
    }
    .await;

    executor.close().await;
    result
}

async fn run_test(options_path: &Path) -> Result<()> {
    let options = read_options(options_path)?;
    let executor = QueryExecutor::from_env()?;

    let outcome = executor.test_connection(&options).await;
    executor.close().await;

    println!("{}", serde_json::to_string(&outcome)?);
    match outcome {
        ConnectionTest::Passed => Ok(()),
        ConnectionTest::Failed { reason } => Err(anyhow::anyhow!(reason)),
    }
}

fn read_options(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read options file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Options file {} is not valid JSON", path.display()))
}

/// Initialize tracing subscriber with stderr output.
///
/// Logs MUST go to stderr because stdout carries query results.
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new("warn,mssql_stream_connector=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
