//! fleetrun CLI entry point

use anyhow::Result;
use clap::Parser;

use fleetrun::cli::{self, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Diagnostics go to stderr; task output is rendered by the runner
    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    cli::execute(cli)
}
