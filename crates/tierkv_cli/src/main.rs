//! tierkv shell
//!
//! Starts a local tierkv cluster in-process and runs transaction commands
//! against it, either interactively or from a batch file.
//!
//! # Commands
//!
//! - `START_TXN <client_id>` - Begin a transaction and print its id
//! - `TXN_GET <txn_id> <key>` - Read a key
//! - `TXN_PUT <txn_id> <key> <value>` - Write a key
//! - `COMMIT_TXN <txn_id>` - Commit a transaction
//!
//! A blank line exits.

mod commands;
mod config;
mod error;

use clap::Parser;
use commands::shell::Shell;
use config::CliConfig;
use error::CliResult;
use std::path::PathBuf;
use std::process::ExitCode;
use tierkv_client::TxnClient;
use tierkv_server::LocalCluster;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Transaction shell for a local tierkv cluster.
#[derive(Parser)]
#[command(name = "tierkv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML cluster configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print every response as JSON
    #[arg(long)]
    json: bool,

    /// File of commands to run; omit for interactive mode
    input: Option<PathBuf>,
}

async fn run(cli: Cli) -> CliResult<u8> {
    let config = match &cli.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    };

    let cluster = LocalCluster::start(config.cluster.clone())?;
    info!(protocol = %config.cluster.protocol, "local cluster started");

    let client_config = config
        .client_config()
        .with_routing(cluster.routing_addresses());
    let mut shell = Shell::new(TxnClient::connect(&cluster.network(), client_config), cli.json);

    let mut stdout = std::io::stdout();
    let code = match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            shell.run(BufReader::new(file), &mut stdout, None).await?
        }
        None => {
            let stdin = BufReader::new(tokio::io::stdin());
            shell.run(stdin, &mut stdout, Some("tierkv> ")).await?
        }
    };

    cluster.shutdown().await;
    Ok(code)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
