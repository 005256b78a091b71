// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camera-splitter")]
#[command(about = "Split one camera buffer stream into several outputs")]
#[command(version = camera_splitter::constants::app_info::version())]
struct Cli {
    /// JSON splitter configuration (defaults apply to missing fields)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a loopback producer and consumers through the splitter
    Simulate(cli::SimulateArgs),

    /// Print the effective splitter configuration
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG to control the log level, e.g. RUST_LOG=camera_splitter=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => cli::simulate(args, cli.config.as_deref()),
        Commands::Config => cli::print_config(cli.config.as_deref()),
    }
}
