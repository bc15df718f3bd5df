//! onionlink - bundled Tor supervisor and v3 onion-service manager
//!
//! Launches a tor child with an ephemeral control port, authenticates,
//! publishes the configured hidden service, and keeps its private key and
//! hostname persisted in the hidden-service directory.
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon
//! onionlink run --config /etc/onionlink/config.toml
//!
//! # Check whether a tor executable can be found
//! onionlink check
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use onionlink::manager::TorManagerEvent;
use onionlink::{config, logging, process, TorManager};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "onionlink", version, about = "Bundled Tor and onion-service manager")]
struct Cli {
    /// Verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the manager daemon
    Run {
        /// Path to config.toml
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Locate the tor executable and exit
    Check {
        /// Explicit tor executable to test
        #[arg(long)]
        executable: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        logging::init_with_level(tracing::Level::DEBUG);
    } else {
        logging::init();
    }

    match cli.command {
        Commands::Run { config } => run_daemon(config).await,
        Commands::Check { executable } => {
            match process::tor_executable_path(executable.as_deref()) {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(())
                },
                None => anyhow::bail!("no tor executable found"),
            }
        },
    }
}

async fn run_daemon(config_path: Option<PathBuf>) -> Result<()> {
    info!("onionlink v{} starting", onionlink::VERSION);

    let config = match config_path {
        Some(path) => config::load_from_path(path)?,
        None => config::load_config()?,
    };

    if config.friends.server_address.is_some() {
        // The friend-server protocol is supplied by the embedding
        // application through the FsClient trait.
        warn!("friends.server_address set, but the standalone daemon ships no FsClient; ignoring");
    }

    let manager = TorManager::new(config);
    let mut events = manager.subscribe();

    manager.start().await?;

    if let Some(info) = manager.hidden_service_info().await {
        info!("hidden service: {}", info.onion_address);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; shutting down");
                manager.stop().await;
                break;
            },
            event = events.recv() => match event {
                Ok(TorManagerEvent::ConfigurationNeeded) => {
                    warn!("tor is not configured yet; edit torrc in the data directory");
                },
                Ok(TorManagerEvent::Error(message)) => {
                    warn!("error: {}", message);
                },
                Ok(TorManagerEvent::HiddenServiceStatusChanged { old, new }) => {
                    info!("hidden service {:?} -> {:?}", old, new);
                },
                Ok(TorManagerEvent::BootstrapProgress(map)) => {
                    let progress = map.get("PROGRESS").map(String::as_str).unwrap_or("?");
                    let summary = map.get("SUMMARY").map(String::as_str).unwrap_or("");
                    info!("bootstrap {}% {}", progress, summary);
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event stream lagged, {} events dropped", skipped);
                },
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}
