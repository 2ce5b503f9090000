use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "heliumevents")]
#[command(about = "Mirror a Helium hotspot's activity history into Elasticsearch")]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every day since the last checkpoint
    Trawl,
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.verbose) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match cli.command.unwrap_or(Commands::Trawl) {
        Commands::Trawl => match trawl_sync::run_trawl_once_from_env().await {
            Ok(summary) => {
                println!(
                    "trawl complete: hotspot={} days={} fetched={} new={} known={}",
                    summary.hotspot,
                    summary.days_synced,
                    summary.fetched,
                    summary.new_docs,
                    summary.duplicate_docs
                );
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("trawl aborted: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}
