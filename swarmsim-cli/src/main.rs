//! Swarmsim CLI - Command-line driver for swarm simulations
//!
//! Runs single simulations or sweeps over seed counts and reports the
//! resulting completion statistics.

mod commands;

use clap::Parser;
use swarmsim_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "swarmsim")]
#[command(about = "Bandwidth-constrained BitTorrent swarm simulator")]
struct Cli {
    /// Console log level (the run log under ./logs always captures everything)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_level.as_tracing_level(), None) {
        eprintln!("Could not set up run log: {e}");
    }

    commands::handle_command(cli.command).await
}
