//! Arbor CLI entry point

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "arbor")]
#[command(about = "Incremental dependency-graph pipeline with live analysis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root path (defaults to current directory)
    #[arg(short, long, default_value = ".")]
    root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the pipeline and its HTTP/WebSocket server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "7890")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Take changes from a remote watcher at this WebSocket URL instead of watching locally
        #[arg(long)]
        ingress: Option<String>,
    },
    /// Build the graph once and print a summary
    Snapshot,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!("arbor={}", log_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Serve { port, host, ingress } => {
            tracing::info!("Arbor v{}", env!("CARGO_PKG_VERSION"));
            tracing::info!("Repository root: {}", cli.root.display());
            commands::serve(cli.root, host, port, ingress).await
        }
        Commands::Snapshot => commands::snapshot(cli.root),
        Commands::Version => {
            println!("Arbor v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
