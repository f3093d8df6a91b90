//! Command-line interface - argument parsing and command dispatch

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{Config, DEFAULT_CONFIG};
use crate::runner::Runner;

#[derive(Parser)]
#[command(name = "fleetrun", version, about = "SSH deployment and multi-host task runner")]
pub struct Cli {
    /// Config file path (default: Fleetfile.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Show detailed output (timing, checksums, transfer sizes)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a task from the config file
    Run {
        /// Task name
        task: String,
        /// Restrict the run to a single server
        #[arg(long)]
        on: Option<String>,
    },
    /// List available tasks
    List,
    /// Write an example Fleetfile.yaml
    Init,
}

pub fn execute(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Run { task, on } => run_task(&cli, task, on.as_deref()),
        Command::List => list_tasks(&cli),
        Command::Init => init_config(),
    }
}

fn run_task(cli: &Cli, task: &str, host_filter: Option<&str>) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    let mut runner = Runner::new(config);
    if cli.verbose {
        runner.set_verbose(true);
    }
    runner.run(task, host_filter)?;
    Ok(())
}

fn list_tasks(cli: &Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("failed to load config")?;

    println!("Available tasks:");
    let mut names: Vec<&String> = config.tasks.keys().collect();
    names.sort();
    for name in names {
        let description = &config.tasks[name].description;
        let description = if description.is_empty() {
            "(no description)"
        } else {
            description
        };
        println!("  {:<20} {}", name, description);
    }
    Ok(())
}

fn init_config() -> Result<()> {
    if std::path::Path::new(DEFAULT_CONFIG).exists() {
        bail!("{} already exists", DEFAULT_CONFIG);
    }

    std::fs::write(DEFAULT_CONFIG, EXAMPLE_CONFIG)
        .with_context(|| format!("failed to write {}", DEFAULT_CONFIG))?;
    println!("Created {}", DEFAULT_CONFIG);
    Ok(())
}

const EXAMPLE_CONFIG: &str = r#"# Fleetfile.yaml - fleetrun deployment config
servers:
  production:
    host: example.com
    user: ubuntu
    key: ~/.ssh/id_rsa
    # port: 22

# Optional log file sink
log:
  enabled: true
  path: ./fleetrun.log

tasks:
  deploy:
    description: "Deploy to production"
    on: [production]
    scripts:
      - local: cargo build --release
      - scp: target/release/server:/app/server-new
      - run: |
          cd /app
          mv server server-old 2>/dev/null || true
          mv server-new server
          chmod +x server
          sudo systemctl restart myapp

  status:
    description: "Check service status"
    on: [production]
    scripts:
      - run: sudo systemctl status myapp --no-pager

  rollback:
    description: "Roll back to the previous version"
    on: [production]
    scripts:
      - run: |
          cd /app
          mv server server-failed
          mv server-old server
          sudo systemctl restart myapp
"#;
