use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use epgd::rpc::{protocol, RpcClient};
use epgd::{config, daemon::Daemon, logging};
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/epgd/epgd.conf";

#[derive(Parser)]
#[command(name = "epgd")]
#[command(about = "EPG ingestion control daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Daemon {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Ask a running daemon to stop.
    Stop {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Daemon { config } => {
            let config = config::load(config)?;
            let _guard = logging::init(&config.log_path, &config.log_level)?;
            let daemon = Daemon::bind(config)
                .await
                .context("Failed to start daemon")?;
            daemon.run().await
        }
        Commands::Stop { config } => {
            let config = config::load(config)?;
            send_stop(&config).await
        }
    }
}

/// Connect and send the stop command. A successful send is a successful
/// stop; the daemon closes the socket while shutting down, so no reply
/// is awaited.
async fn send_stop(config: &config::Config) -> Result<()> {
    let addr = config.connect_addr();
    let mut client = RpcClient::connect(&addr)
        .await
        .with_context(|| format!("Failed to connect to daemon at {addr}"))?;
    client
        .send(protocol::DAEMON_STOP_SERVICE, Some("{}".to_string()))
        .await
        .context("Failed to send stop command")?;
    Ok(())
}
