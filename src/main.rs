use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use postillon::config::read_config;
use postillon::server::Server;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(
        short,
        long,
        env = "POSTILLON_CONFIG",
        default_value = "postillon.toml"
    )]
    /// Path to the configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the IMAP server daemon
    Daemon,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("postillon=info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %format!("{:#}", e), "fatal");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = read_config(&args.config_file)?;
    match args.command {
        Command::Daemon => {
            let server = Server::new(config)?;
            let (exit_tx, exit_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    let _ = exit_tx.send(true);
                }
            });
            server.run(exit_rx).await
        }
    }
}
