use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use warden::dispatch::HttpCommandSink;
use warden::telemetry::init_tracing;
use warden::{Supervisor, SupervisorConfig};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Supervision control plane for autonomous worker agents", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML or YAML config file. Defaults apply when omitted.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and its operator API
    Serve {
        #[arg(long, short, help = "API port (overrides config)")]
        port: Option<u16>,
        #[arg(long, help = "Emit JSON log lines")]
        json_logs: bool,
        #[arg(long, short, help = "Enable debug logging")]
        verbose: bool,
    },
    /// Print the effective configuration and exit
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            port,
            json_logs,
            verbose,
        } => {
            let level = if verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::INFO
            };
            init_tracing(json_logs, level);
            serve(config, port).await?
        }
        Commands::Config => print!("{}", serde_yaml::to_string(&config)?),
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<SupervisorConfig> {
    let config = match path {
        Some(path) => SupervisorConfig::load(path)?,
        None => SupervisorConfig::default(),
    }
    .with_env_overrides();

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn serve(config: SupervisorConfig, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.api_port);
    let supervisor = Supervisor::new(config, Arc::new(HttpCommandSink::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = supervisor.run_background(shutdown_rx.clone());
    let mut api = tokio::spawn(warden::api::serve(supervisor, port, shutdown_rx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for ctrl-c")?;
            tracing::info!("Shutdown requested");
        }
        result = &mut api => {
            // Server exited on its own, usually a bind failure.
            let _ = shutdown_tx.send(true);
            return result.context("API task panicked")?;
        }
    }

    let _ = shutdown_tx.send(true);
    api.await.context("API task panicked")??;
    for worker in workers {
        let _ = worker.await;
    }

    tracing::info!("Supervisor stopped");
    Ok(())
}
