//! termhost daemon
//!
//! Serves browser terminal channels backed by local shells.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use tracing_subscriber::EnvFilter;

/// termhost - a shell in your browser.
#[derive(Parser, Debug)]
#[command(name = "termhost")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving terminal channels
    Serve {
        /// Address to bind, overriding the configuration
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, overriding the configuration
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print the effective configuration (password masked)
    Config,

    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    if let Commands::Serve { host, port } = &cli.command {
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
    }

    init_tracing(cli.verbose, &config.log.level);
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Serve { .. } => {
            config.validate()?;
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run(&mut orchestrator).await?;
        }
        Commands::Config => {
            print!("{}", config.redacted().to_toml()?);
        }
        Commands::Check => {
            config.validate()?;
            println!("Configuration OK");
        }
    }

    Ok(())
}

/// `RUST_LOG` wins, then `--verbose`, then the configured level.
fn init_tracing(verbose: bool, configured: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { configured };
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Runs the server until a signal or the shutdown endpoint stops it.
async fn run(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::debug!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ChannelOpened {
                    channel_id,
                    username,
                } => {
                    tracing::debug!("Channel opened: {} ({})", channel_id, username);
                }
                OrchestratorEvent::ChannelClosed { channel_id, reason } => {
                    tracing::debug!("Channel closed: {} ({})", channel_id, reason);
                }
            }
        }
    });

    let addr = orchestrator.start().await?;
    tracing::info!("termhost serving on http://{}", addr);

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown requested");
        }
    }

    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Failed to register SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received Ctrl-C");
}
