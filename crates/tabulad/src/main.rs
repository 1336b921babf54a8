//! tabulad: the Tabula table daemon.
//!
//! Runs one table's contract executor against Raft snapshots read from
//! JSON files, and reports what the executor ended up doing.
//!
//! # Usage
//!
//! ```text
//! tabulad apply --config executor.toml --snapshot s1.json --snapshot s2.json
//! tabulad check-config --config executor.toml
//! ```

mod apply;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tabula_core::ExecutorConfig;

#[derive(Parser)]
#[command(name = "tabulad", about = "Tabula table daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply snapshots in order and print the resulting executor state.
    Apply {
        /// Path to executor.toml.
        #[arg(long)]
        config: PathBuf,

        /// Raft state snapshot (JSON). Repeat to apply several in order.
        #[arg(long = "snapshot", required = true)]
        snapshots: Vec<PathBuf>,

        /// Use an in-memory store instead of a file under data_dir.
        #[arg(long)]
        in_memory: bool,

        /// Also print counters in Prometheus text format.
        #[arg(long)]
        metrics: bool,
    },
    /// Parse executor.toml and print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Apply {
            config,
            snapshots,
            in_memory,
            metrics,
        } => {
            let config = ExecutorConfig::from_file(&config)?;
            let report = apply::run(config, &snapshots, in_memory).await?;
            println!("{}", serde_json::to_string_pretty(&report.json)?);
            if metrics {
                print!("{}", report.prometheus);
            }
            Ok(())
        }
        Command::CheckConfig { config } => {
            let config = ExecutorConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tabula=debug,tabulad=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
