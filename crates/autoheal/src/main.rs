//! Autoheal CLI
//!
//! Runs the healer: an HTTP server receiving Alertmanager webhooks and the workers
//! that turn the alerts into AWX jobs and Kubernetes batch jobs.

use anyhow::{Context, Result};
use autoheal::config::{parse_duration, parse_interval, Config, ConfigLoader, KubeSecrets, SecretSource};
use autoheal::runner::{AwxClient, KubeBatchJobCreator};
use autoheal::server::DEFAULT_LISTEN_ADDR;
use autoheal::{Runners, Service, ServiceOptions};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Alert-driven auto-healer
#[derive(Parser)]
#[command(name = "autoheal")]
#[command(about = "Runs healing actions in response to Prometheus alerts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the healer server
    Server {
        /// Configuration file or directory, can be repeated
        #[arg(long = "config-file", default_value = "autoheal.yml")]
        config_files: Vec<PathBuf>,

        /// Address to listen on
        #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
        listen: SocketAddr,

        /// How long executed actions are remembered (e.g. `30m`), overrides the configuration
        #[arg(long, value_parser = parse_duration)]
        throttle_interval: Option<Duration>,

        /// Interval between AWX job status checks, overrides the configuration
        #[arg(long, value_parser = parse_interval)]
        job_status_interval: Option<Duration>,

        /// Interval between configuration reloads, `0` disables reloading
        #[arg(long, value_parser = parse_duration, default_value = "30s")]
        config_reload_interval: Duration,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Server {
            config_files,
            listen,
            throttle_interval,
            job_status_interval,
            config_reload_interval,
        } => {
            let kube = connect_kubernetes().await;
            let secrets = kube.clone().map(KubeSecrets::new);
            let loader = ConfigLoader::new(config_files);
            let config = loader
                .load(secrets.as_ref().map(|s| s as &dyn SecretSource))
                .await
                .context("Failed to load configuration")?;

            let mut options = ServiceOptions::from_config(&config);
            options.listen = listen;
            options.config_reload_interval = config_reload_interval;
            if let Some(interval) = throttle_interval {
                options.throttle_interval = interval;
            }
            if let Some(interval) = job_status_interval {
                options.job_status_interval = interval;
            }

            let runners = build_runners(&config, kube)?;
            let service = Service::new(config, loader, options, runners);

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    shutdown_signal().await;
                    cancel.cancel();
                }
            });

            info!("Starting autoheal v{}", env!("CARGO_PKG_VERSION"));
            service.run(cancel).await
        }
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default_filter = if verbose {
        "autoheal=debug,info"
    } else {
        "autoheal=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

async fn connect_kubernetes() -> Option<kube::Client> {
    match kube::Client::try_default().await {
        Ok(client) => {
            info!("Connected to Kubernetes cluster");
            Some(client)
        }
        Err(e) => {
            warn!(error = %e, "Kubernetes isn't available, batch job actions and secret references will fail");
            None
        }
    }
}

/// AWX client when an address is configured, Kubernetes client when a cluster is
/// reachable, and disabled runners otherwise.
fn build_runners(config: &Config, kube: Option<kube::Client>) -> Result<Runners> {
    let mut runners = Runners::disabled();

    if config.awx.is_configured() {
        let client = Arc::new(
            AwxClient::new(&config.awx.settings()).context("Failed to create AWX client")?,
        );
        info!(
            address = %config.awx.address,
            project = %config.awx.project,
            "AWX job actions enabled"
        );
        runners.launcher = Arc::clone(&client) as _;
        runners.querier = client;
    } else {
        warn!("AWX address isn't configured, AWX job actions will fail");
    }

    if let Some(client) = kube {
        info!("Batch job actions enabled");
        runners.creator = Arc::new(KubeBatchJobCreator::new(client));
    }

    Ok(runners)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
